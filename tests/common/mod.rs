#![allow(dead_code)]

use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use waline_likes::{LikeConfig, LikeService, LocalStore, SessionStore, SessionUser};

pub const USER_ID: &str = "u1";

pub fn like(url: &str, id: u64, user_id: &str, time: &str) -> Value {
    json!({
        "objectId": id,
        "comment": "<p>[LIKE_RECORD]</p>\n",
        "url": url,
        "nick": format!("user-{user_id}"),
        "mail": format!("{user_id}@example.com"),
        "user_id": user_id,
        "avatar": "https://avatar.example.com/x.png",
        "insertedAt": time,
    })
}

pub fn comment(url: &str, id: u64, text: &str) -> Value {
    json!({
        "objectId": id,
        "comment": format!("<p>{text}</p>\n"),
        "url": url,
        "nick": "visitor",
        "insertedAt": "2024-01-01T00:00:00.000Z",
    })
}

pub fn envelope(list: &[Value]) -> String {
    json!({
        "errno": 0,
        "errmsg": "",
        "data": {
            "page": 1,
            "totalPages": 1,
            "pageSize": 50,
            "count": list.len(),
            "data": list,
        },
    })
    .to_string()
}

struct Store {
    comments: Vec<Value>,
    next_id: u64,
}

/// In-memory comment store behind a mockito server, speaking the comment
/// API's envelope format.
pub struct FakeWaline {
    pub server: ServerGuard,
    store: Arc<Mutex<Store>>,
}

impl FakeWaline {
    pub async fn start(seed: Vec<Value>) -> Self {
        Self {
            server: Server::new_async().await,
            store: Arc::new(Mutex::new(Store {
                comments: seed,
                next_id: 1000,
            })),
        }
    }

    pub fn config(&self) -> LikeConfig {
        let mut config = LikeConfig::new(self.server.url()).unwrap();
        config.retry.attempts = 2;
        config.retry.delay = Duration::from_millis(1);
        config
    }

    pub fn service(&self, session: SessionStore) -> Arc<LikeService> {
        Arc::new(LikeService::new(&self.config(), session).unwrap())
    }

    pub fn likes_on(&self, path: &str) -> usize {
        self.store
            .lock()
            .unwrap()
            .comments
            .iter()
            .filter(|c| c["url"] == path && c["comment"] == "<p>[LIKE_RECORD]</p>\n")
            .count()
    }

    /// `GET /api/comment?path=<path>&type=all`
    pub fn path_mock(&mut self, path: &str) -> Mock {
        let store = self.store.clone();
        let wanted = path.to_string();
        self.server
            .mock("GET", "/api/comment")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("path".into(), path.into()),
                Matcher::UrlEncoded("type".into(), "all".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body_from_request(move |_| {
                let store = store.lock().unwrap();
                let list: Vec<Value> = store
                    .comments
                    .iter()
                    .filter(|c| c["url"] == wanted.as_str())
                    .cloned()
                    .collect();
                envelope(&list).into()
            })
    }

    /// `GET /api/comment?type=all`
    pub fn corpus_mock(&mut self) -> Mock {
        let store = self.store.clone();
        self.server
            .mock("GET", "/api/comment")
            .match_query(Matcher::Exact("type=all".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body_from_request(move |_| envelope(&store.lock().unwrap().comments).into())
    }

    pub fn token_mock(&mut self) -> Mock {
        self.server
            .mock("GET", "/api/token")
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"errno":0,"data":{"objectId":"u1"}}"#)
    }

    /// `POST /api/comment`, recording the new comment under `user_id`.
    pub fn create_mock(&mut self, user_id: &str) -> Mock {
        let store = self.store.clone();
        let user_id = user_id.to_string();
        self.server
            .mock("POST", "/api/comment")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body_from_request(move |request| {
                let body: Value = request
                    .body()
                    .ok()
                    .and_then(|raw| serde_json::from_slice(raw).ok())
                    .unwrap_or(Value::Null);
                let mut store = store.lock().unwrap();
                store.next_id += 1;
                let created = json!({
                    "objectId": store.next_id,
                    "comment": format!("<p>{}</p>\n", body["comment"].as_str().unwrap_or_default()),
                    "url": body["url"],
                    "nick": body["nick"],
                    "mail": body["mail"],
                    "user_id": user_id,
                    "insertedAt": "2024-06-01T12:00:00.000Z",
                });
                store.comments.push(created.clone());
                json!({"errno": 0, "errmsg": "", "data": created})
                    .to_string()
                    .into()
            })
    }

    /// `DELETE /api/comment/<id>`
    pub fn delete_mock(&mut self) -> Mock {
        let store = self.store.clone();
        self.server
            .mock("DELETE", Matcher::Regex(r"^/api/comment/\d+$".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body_from_request(move |request| {
                let id = request.path().rsplit('/').next().unwrap_or_default().to_string();
                store
                    .lock()
                    .unwrap()
                    .comments
                    .retain(|c| c["objectId"].to_string() != id);
                r#"{"errno":0,"errmsg":"","data":""}"#.into()
            })
    }

    pub async fn serve_path(&mut self, path: &str) -> Mock {
        self.path_mock(path).create_async().await
    }

    pub async fn serve_corpus(&mut self) -> Mock {
        self.corpus_mock().create_async().await
    }

    pub async fn accept_token(&mut self) -> Mock {
        self.token_mock().create_async().await
    }
}

pub fn session(user_id: Option<&str>) -> (LocalStore, SessionStore) {
    let store = LocalStore::in_memory().unwrap();
    let session = SessionStore::new(store.clone());
    if let Some(user_id) = user_id {
        session
            .login(&SessionUser {
                token: "tok".into(),
                display_name: "Alice".into(),
                email: "alice@example.com".into(),
                object_id: Some(user_id.into()),
                ..Default::default()
            })
            .unwrap();
    }
    (store, session)
}
