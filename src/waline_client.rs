use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{Clock, Freshness, StatsCache, SystemClock};
use crate::config::{LikeConfig, RetryConfig};
use crate::db::{SessionStore, SessionUser};
use crate::errors::LikeError;
use crate::models::{
    ApiEnvelope, ArticleStats, CreateCommentRequest, LikeUser, WalineComment, LIKE_RECORD_MARKER,
};

const USER_AGENT: &str = concat!("waline-likes/", env!("CARGO_PKG_VERSION"));

/// Likes on top of a Waline comment server. A like is a comment whose body is
/// [`LIKE_RECORD_MARKER`]; counts and membership are derived by scanning the
/// comment feed.
///
/// Identical concurrent reads are not coalesced: two simultaneous stat
/// requests for an uncached path make two requests.
pub struct LikeService {
    client: Client,
    server_url: String,
    cache: StatsCache,
    retry: RetryConfig,
    session: SessionStore,
}

impl LikeService {
    pub fn new(config: &LikeConfig, session: SessionStore) -> Result<Self, LikeError> {
        Self::with_clock(config, session, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &LikeConfig,
        session: SessionStore,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LikeError> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            server_url: config.server_url.clone(),
            cache: StatsCache::with_clock(config.cache.clone(), clock),
            retry: config.retry.clone(),
            session,
        })
    }

    pub fn cache(&self) -> &StatsCache {
        &self.cache
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    /// Runs `StatsCache::sweep` on the configured interval until the service
    /// is dropped.
    pub fn spawn_cache_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::downgrade(self);
        let period = self.cache.config().sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(service) = service.upgrade() else {
                    break;
                };
                let removed = service.cache.sweep();
                if removed > 0 {
                    debug!(removed, "swept expired like counts");
                }
            }
        })
    }

    fn comments_url(&self, path: Option<&str>) -> String {
        match path {
            Some(path) => format!(
                "{}/api/comment?path={}&type=all",
                self.server_url,
                urlencoding::encode(path)
            ),
            None => format!("{}/api/comment?type=all", self.server_url),
        }
    }

    /// Every comment on `path`, or the whole corpus when `path` is `None`.
    async fn fetch_comments(&self, path: Option<&str>) -> Result<Vec<WalineComment>, LikeError> {
        let response = self.client.get(self.comments_url(path)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LikeError::Http { status });
        }
        let body = response.text().await?;
        let envelope: ApiEnvelope = serde_json::from_str(&body)?;
        check_errno(&envelope)?;

        let list = match envelope.data {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::Object(mut page)) => match page.remove("data") {
                None | Some(Value::Null) => return Ok(Vec::new()),
                Some(list @ Value::Array(_)) => list,
                Some(other) => return Err(LikeError::NotArray(json_type(&other))),
            },
            Some(list @ Value::Array(_)) => list,
            Some(other) => return Err(LikeError::NotArray(json_type(&other))),
        };
        Ok(serde_json::from_value(list)?)
    }

    /// Like count for one article. `None` when the path is blank or the
    /// server could not be read; never errors.
    pub async fn get_article_stats(&self, path: &str, use_cache: bool) -> Option<u64> {
        if path.trim().is_empty() {
            error!("like count requested for an empty path");
            return None;
        }
        if use_cache {
            if let Some(count) = self.cache.get(path) {
                return Some(count);
            }
        }

        match self.fetch_comments(Some(path)).await {
            Ok(comments) => {
                let count = count_likes(&comments);
                self.cache.set(path, count, Freshness::Normal);
                Some(count)
            }
            Err(e) => {
                error!(path, error = %e, "failed to fetch like count");
                None
            }
        }
    }

    /// Counts for many articles with at most one request: cached paths are
    /// answered locally, the rest from a single corpus-wide scan.
    pub async fn get_batch_article_stats(&self, paths: &[String]) -> HashMap<String, u64> {
        let mut result = HashMap::new();
        let mut uncached = Vec::new();
        for path in paths {
            match self.cache.get(path) {
                Some(count) => {
                    result.insert(path.clone(), count);
                }
                None => uncached.push(path),
            }
        }
        if uncached.is_empty() {
            return result;
        }

        let comments = match self.fetch_comments(None).await {
            Ok(comments) => comments,
            Err(e) => {
                error!(error = %e, "failed to fetch batch like counts");
                return result;
            }
        };
        let grouped = group_likes_by_path(&comments);
        for path in uncached {
            let count = grouped.get(path.as_str()).map(|s| s.count).unwrap_or(0);
            self.cache.set(path, count, Freshness::Normal);
            result.insert(path.clone(), count);
        }
        result
    }

    /// Every article with at least one like.
    pub async fn get_all_articles_stats(&self) -> Vec<ArticleStats> {
        let comments = match self.fetch_comments(None).await {
            Ok(comments) => comments,
            Err(e) => {
                error!(error = %e, "failed to fetch like counts for all articles");
                return Vec::new();
            }
        };
        group_likes_by_path(&comments)
            .into_values()
            .inspect(|stats| self.cache.set(&stats.path, stats.count, Freshness::Normal))
            .collect()
    }

    pub async fn get_most_liked_articles(&self, limit: usize) -> Vec<ArticleStats> {
        let mut articles = self.get_all_articles_stats().await;
        articles.retain(|a| a.count > 0);
        articles.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.path.cmp(&b.path)));
        articles.truncate(limit);
        articles
    }

    pub async fn get_recent_liked_articles(&self, limit: usize) -> Vec<ArticleStats> {
        let mut articles = self.get_all_articles_stats().await;
        articles.retain(|a| a.count > 0);
        // Newest first; articles without a parseable time go last.
        articles.sort_by(|a, b| {
            b.last_liked_at
                .cmp(&a.last_liked_at)
                .then_with(|| a.path.cmp(&b.path))
        });
        articles.truncate(limit);
        articles
    }

    /// Uncached membership check.
    pub async fn check_user_liked(&self, path: &str, user_id: &str) -> bool {
        match self.fetch_comments(Some(path)).await {
            Ok(comments) => comments.iter().any(|c| c.is_like_by(user_id)),
            Err(e) => {
                error!(path, error = %e, "failed to check like status");
                false
            }
        }
    }

    pub async fn get_like_users(&self, path: &str) -> Vec<LikeUser> {
        match self.fetch_comments(Some(path)).await {
            Ok(comments) => comments
                .iter()
                .filter(|c| c.is_like_record())
                .map(LikeUser::from)
                .collect(),
            Err(e) => {
                error!(path, error = %e, "failed to fetch like users");
                Vec::new()
            }
        }
    }

    pub async fn verify_token(&self, token: &str) -> bool {
        let request = self
            .client
            .get(format!("{}/api/token", self.server_url))
            .bearer_auth(token);
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                error!(error = %e, "token verification failed");
                false
            }
        }
    }

    /// Adds the current user's like and returns the re-read count, or `None`
    /// when the server did not answer with a count in time.
    pub async fn like_article(&self, path: &str) -> Result<Option<u64>, LikeError> {
        ensure_path(path)?;
        let user = self.authorize().await?;
        if let Some(user_id) = user.object_id.as_deref() {
            let comments = self.fetch_comments(Some(path)).await?;
            if comments.iter().any(|c| c.is_like_by(user_id)) {
                warn!(path, user_id, "like record already exists");
                return Err(LikeError::AlreadyLiked);
            }
        }

        let body = CreateCommentRequest {
            url: path,
            comment: LIKE_RECORD_MARKER,
            nick: if user.display_name.is_empty() {
                "Guest"
            } else {
                user.display_name.as_str()
            },
            mail: &user.email,
            link: "",
            ua: USER_AGENT,
        };
        let request = self
            .client
            .post(format!("{}/api/comment", self.server_url))
            .bearer_auth(&user.token)
            .json(&body);
        send_mutation(request).await.inspect_err(|e| {
            error!(path, error = %e, "failed to create like record");
        })?;
        info!(path, "like record created");

        Ok(self.refresh_after_mutation(path).await)
    }

    /// Removes the current user's like and returns the re-read count.
    pub async fn unlike_article(&self, path: &str) -> Result<Option<u64>, LikeError> {
        ensure_path(path)?;
        if self.session.user_id().is_none() {
            warn!(path, "cannot remove like record without a user id");
            return Err(LikeError::LoginRequired);
        }
        let user = self.authorize().await?;
        let user_id = user.object_id.as_deref().ok_or(LikeError::LoginRequired)?;

        let comments = self.fetch_comments(Some(path)).await?;
        let record = comments
            .iter()
            .find(|c| c.is_like_by(user_id))
            .and_then(|c| c.object_id.as_deref())
            .ok_or_else(|| {
                warn!(path, user_id, "no like record to remove");
                LikeError::RecordNotFound
            })?;

        let request = self
            .client
            .delete(format!("{}/api/comment/{}", self.server_url, record))
            .bearer_auth(&user.token);
        send_mutation(request).await.inspect_err(|e| {
            error!(path, error = %e, "failed to delete like record");
        })?;
        info!(path, record, "like record deleted");

        Ok(self.refresh_after_mutation(path).await)
    }

    async fn authorize(&self) -> Result<SessionUser, LikeError> {
        let user = self.session.user().ok_or_else(|| {
            warn!("like mutation attempted without a session");
            LikeError::LoginRequired
        })?;
        // Only a rejected token ends the session; an unreachable server is a
        // transport failure.
        let response = self
            .client
            .get(format!("{}/api/token", self.server_url))
            .bearer_auth(&user.token)
            .send()
            .await
            .inspect_err(|e| error!(error = %e, "token verification failed"))?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "session token is invalid or expired");
            return Err(LikeError::TokenExpired);
        }
        Ok(user)
    }

    /// Drops the cached count and re-reads it, retrying while the server
    /// catches up. A successful read is cached with the short TTL.
    async fn refresh_after_mutation(&self, path: &str) -> Option<u64> {
        self.cache.invalidate(path);
        for attempt in 0..self.retry.attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay).await;
            }
            if let Some(count) = self.get_article_stats(path, false).await {
                self.cache.set(path, count, Freshness::Fresh);
                return Some(count);
            }
            debug!(path, attempt, "re-read after mutation failed");
        }
        None
    }
}

fn ensure_path(path: &str) -> Result<(), LikeError> {
    if path.trim().is_empty() {
        return Err(LikeError::EmptyPath);
    }
    Ok(())
}

fn check_errno(envelope: &ApiEnvelope) -> Result<(), LikeError> {
    match envelope.errno {
        Some(errno) if errno != 0 => {
            let errmsg = match &envelope.errmsg {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            Err(LikeError::Api { errno, errmsg })
        }
        _ => Ok(()),
    }
}

async fn send_mutation(request: RequestBuilder) -> Result<(), LikeError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        debug!(%status, body = %text, "mutation rejected");
        return Err(LikeError::Http { status });
    }
    // Errors can also arrive inside a 200. Bodies that aren't an envelope are
    // accepted as-is.
    let text = response.text().await?;
    if let Ok(envelope) = serde_json::from_str::<ApiEnvelope>(&text) {
        check_errno(&envelope)?;
    }
    Ok(())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn count_likes(comments: &[WalineComment]) -> u64 {
    comments.iter().filter(|c| c.is_like_record()).count() as u64
}

/// Like totals per article path, with the newest like time of each.
pub fn group_likes_by_path(comments: &[WalineComment]) -> HashMap<String, ArticleStats> {
    let mut grouped: HashMap<String, ArticleStats> = HashMap::new();
    for comment in comments.iter().filter(|c| c.is_like_record()) {
        let Some(path) = comment.url.as_deref() else {
            continue;
        };
        let stats = grouped
            .entry(path.to_string())
            .or_insert_with(|| ArticleStats {
                path: path.to_string(),
                count: 0,
                last_liked_at: None,
            });
        stats.count += 1;
        stats.last_liked_at = stats.last_liked_at.max(comment.timestamp());
    }
    grouped
}
