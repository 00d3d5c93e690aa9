use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

/// Comment body that marks a comment as a like record.
pub const LIKE_RECORD_MARKER: &str = "[LIKE_RECORD]";

lazy_static! {
    static ref HTML_TAG: Regex = Regex::new(r"<[^>]*>").expect("valid tag regex");
}

/// Removes markup tags and surrounding whitespace. The server renders a
/// submitted `[LIKE_RECORD]` as `<p>[LIKE_RECORD]</p>\n`, so comparisons
/// against the marker always go through here.
pub fn strip_html_tags(text: &str) -> String {
    HTML_TAG.replace_all(text, "").trim().to_string()
}

pub fn is_like_marker(text: &str) -> bool {
    strip_html_tags(text) == LIKE_RECORD_MARKER
}

/// One comment as returned by `GET /api/comment`. Servers differ in which
/// fields they return, so everything but the body is optional.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WalineComment {
    #[serde(rename = "objectId", default, deserialize_with = "string_or_number")]
    pub object_id: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub mail: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(rename = "insertedAt", default)]
    pub inserted_at: Option<String>,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<String>,
}

impl WalineComment {
    pub fn is_like_record(&self) -> bool {
        self.comment.as_deref().map(is_like_marker).unwrap_or(false)
    }

    pub fn is_like_by(&self, user_id: &str) -> bool {
        self.is_like_record() && self.user_id.as_deref() == Some(user_id)
    }

    pub fn time(&self) -> Option<&str> {
        self.inserted_at.as_deref().or(self.created_at.as_deref())
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.time()?;
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }
}

// SQL backends return numeric ids, LeanCloud returns strings.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// `{errno, errmsg?, data}` wrapper used by every comment API response.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub errno: Option<i64>,
    #[serde(default)]
    pub errmsg: Option<serde_json::Value>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Body of `POST /api/comment`.
#[derive(Debug, Serialize)]
pub struct CreateCommentRequest<'a> {
    pub url: &'a str,
    pub comment: &'a str,
    pub nick: &'a str,
    pub mail: &'a str,
    pub link: &'a str,
    pub ua: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleStats {
    pub path: String,
    pub count: u64,
    pub last_liked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikeUser {
    pub name: String,
    pub email: Option<String>,
    pub avatar: String,
    pub link: Option<String>,
    pub time: String,
}

impl From<&WalineComment> for LikeUser {
    fn from(comment: &WalineComment) -> Self {
        Self {
            name: comment.nick.clone().unwrap_or_default(),
            email: comment.mail.clone(),
            avatar: comment.avatar.clone().unwrap_or_default(),
            link: comment.link.clone().filter(|l| !l.is_empty()),
            time: comment.time().unwrap_or_default().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_rendered_marker() {
        assert_eq!(strip_html_tags("<p>[LIKE_RECORD]</p>\n"), LIKE_RECORD_MARKER);
        assert!(is_like_marker("  [LIKE_RECORD] "));
        assert!(!is_like_marker("<p>[LIKE_RECORD] nice</p>"));
        assert!(!is_like_marker("hello"));
    }

    #[test]
    fn parses_numeric_and_string_ids() {
        let raw = r#"[
            {"objectId": 42, "comment": "<p>[LIKE_RECORD]</p>", "user_id": 7, "url": "/a"},
            {"objectId": "abc", "comment": "hi", "user_id": "u2"}
        ]"#;
        let comments: Vec<WalineComment> = serde_json::from_str(raw).unwrap();
        assert_eq!(comments[0].object_id.as_deref(), Some("42"));
        assert!(comments[0].is_like_by("7"));
        assert!(!comments[1].is_like_record());
        assert_eq!(comments[1].user_id.as_deref(), Some("u2"));
    }

    #[test]
    fn timestamp_prefers_inserted_at() {
        let comment = WalineComment {
            inserted_at: Some("2024-05-01T10:00:00Z".into()),
            created_at: Some("2023-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        assert_eq!(comment.time(), Some("2024-05-01T10:00:00Z"));
        assert_eq!(
            comment.timestamp().map(|t| t.to_rfc3339()),
            Some("2024-05-01T10:00:00+00:00".to_string())
        );
    }
}
