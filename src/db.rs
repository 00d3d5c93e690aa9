use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{error, warn};

pub const LIKED_POSTS_KEY: &str = "waline-liked-posts";
pub const SESSION_KEY: &str = "WALINE_USER";
pub const COMMENT_BOX_KEY: &str = "WALINE_COMMENT_BOX_EDITOR";

/// Change notification for one key. `old_value`/`new_value` are `None` when
/// the key was absent before or removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Key/value store persisted in SQLite. Writes are broadcast to subscribers.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    events: broadcast::Sender<StorageEvent>,
}

impl LocalStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir)?;
        }
        let conn = Connection::open(data_dir.join("local_storage.db"))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS local_storage (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            events,
        })
    }

    pub fn default_data_dir() -> Result<PathBuf> {
        let home_dir =
            dirs_next::home_dir().ok_or_else(|| anyhow!("Could not find home directory"))?;
        Ok(home_dir.join(".waline_likes"))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("Failed to lock local storage"))?;
        let value = conn
            .query_row(
                "SELECT value FROM local_storage WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let old_value = self.get(key)?;
        {
            let conn = self
                .conn
                .lock()
                .map_err(|_| anyhow!("Failed to lock local storage"))?;
            conn.execute(
                "INSERT OR REPLACE INTO local_storage (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }
        self.publish(key, old_value, Some(value.to_string()));
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let old_value = self.get(key)?;
        {
            let conn = self
                .conn
                .lock()
                .map_err(|_| anyhow!("Failed to lock local storage"))?;
            conn.execute("DELETE FROM local_storage WHERE key = ?1", params![key])?;
        }
        if old_value.is_some() {
            self.publish(key, old_value, None);
        }
        Ok(())
    }

    /// Re-reads `key` and announces it after another process changed it.
    pub fn notify_external(&self, key: &str) -> Result<()> {
        let current = self.get(key)?;
        self.publish(key, None, current);
        Ok(())
    }

    fn publish(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        // No subscribers is fine.
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            old_value,
            new_value,
        });
    }
}

/// Article paths this device has liked. Only a hint for the UI before the
/// server answers; failures are logged and ignored.
#[derive(Clone)]
pub struct LikedPaths {
    store: LocalStore,
}

impl LikedPaths {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    fn read(&self) -> Vec<String> {
        match self.store.get(LIKED_POSTS_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(e) => {
                error!(error = %e, "failed to read liked paths");
                Vec::new()
            }
        }
    }

    fn write(&self, paths: &[String]) {
        let result = serde_json::to_string(paths)
            .map_err(anyhow::Error::from)
            .and_then(|raw| self.store.set(LIKED_POSTS_KEY, &raw));
        if let Err(e) = result {
            error!(error = %e, "failed to save liked paths");
        }
    }

    pub fn has_liked(&self, path: &str) -> bool {
        self.read().iter().any(|p| p == path)
    }

    pub fn set_liked(&self, path: &str) {
        let mut paths = self.read();
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_string());
            self.write(&paths);
        }
    }

    pub fn set_unliked(&self, path: &str) {
        let mut paths = self.read();
        paths.retain(|p| p != path);
        self.write(&paths);
    }

    pub fn set(&self, path: &str, liked: bool) {
        if liked {
            self.set_liked(path);
        } else {
            self.set_unliked(path);
        }
    }

    pub fn all_liked(&self) -> Vec<String> {
        self.read()
    }

    /// Drops duplicate entries. Returns true when something was rewritten.
    pub fn repair(&self) -> bool {
        let paths = self.read();
        let mut unique: Vec<String> = Vec::with_capacity(paths.len());
        for path in &paths {
            if !unique.contains(path) {
                unique.push(path.clone());
            }
        }
        if unique.len() == paths.len() {
            return false;
        }
        self.write(&unique);
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub token: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(rename = "objectId", default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(rename = "mailMd5", default, skip_serializing_if = "Option::is_none")]
    pub mail_md5: Option<String>,
}

/// The comment widget's login session, shared through local storage.
#[derive(Clone)]
pub struct SessionStore {
    store: LocalStore,
}

impl SessionStore {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn user(&self) -> Option<SessionUser> {
        let raw = match self.store.get(SESSION_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                error!(error = %e, "failed to read session");
                return None;
            }
        };
        match serde_json::from_str::<SessionUser>(&raw) {
            Ok(user) if !user.token.is_empty() => Some(user),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "stored session is not valid JSON");
                None
            }
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.user().is_some()
    }

    pub fn user_name(&self) -> String {
        self.user()
            .map(|u| u.display_name)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "Guest".to_string())
    }

    pub fn user_email(&self) -> Option<String> {
        self.user().map(|u| u.email).filter(|e| !e.is_empty())
    }

    pub fn user_id(&self) -> Option<String> {
        self.user()?.object_id.filter(|id| !id.is_empty())
    }

    pub fn token(&self) -> Option<String> {
        self.user().map(|u| u.token)
    }

    pub fn login(&self, user: &SessionUser) -> Result<()> {
        self.store.set(SESSION_KEY, &serde_json::to_string(user)?)
    }

    pub fn logout(&self) {
        for key in [SESSION_KEY, COMMENT_BOX_KEY] {
            if let Err(e) = self.store.remove(key) {
                error!(error = %e, key, "logout failed");
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.store.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> SessionUser {
        SessionUser {
            token: "tok".into(),
            display_name: "Alice".into(),
            email: "a@example.com".into(),
            object_id: Some(id.into()),
            ..Default::default()
        }
    }

    #[test]
    fn liked_paths_toggle_and_repair() {
        let store = LocalStore::in_memory().unwrap();
        let liked = LikedPaths::new(store.clone());

        liked.set_liked("/a");
        liked.set_liked("/a");
        liked.set_liked("/b");
        assert_eq!(liked.all_liked(), vec!["/a", "/b"]);
        liked.set_unliked("/a");
        assert!(!liked.has_liked("/a"));

        store
            .set(LIKED_POSTS_KEY, r#"["/x","/y","/x"]"#)
            .unwrap();
        assert!(liked.repair());
        assert_eq!(liked.all_liked(), vec!["/x", "/y"]);
        assert!(!liked.repair());
    }

    #[test]
    fn corrupt_hint_reads_as_empty() {
        let store = LocalStore::in_memory().unwrap();
        store.set(LIKED_POSTS_KEY, "not json").unwrap();
        let liked = LikedPaths::new(store);
        assert!(liked.all_liked().is_empty());
        assert!(!liked.has_liked("/a"));
    }

    #[test]
    fn session_requires_token() {
        let store = LocalStore::in_memory().unwrap();
        let session = SessionStore::new(store.clone());
        assert!(!session.is_logged_in());
        assert_eq!(session.user_name(), "Guest");

        store
            .set(SESSION_KEY, r#"{"token":"","display_name":"x"}"#)
            .unwrap();
        assert!(session.user().is_none());

        session.login(&user("u1")).unwrap();
        assert!(session.is_logged_in());
        assert_eq!(session.user_id().as_deref(), Some("u1"));
        assert_eq!(session.user_email().as_deref(), Some("a@example.com"));

        store.set(COMMENT_BOX_KEY, "draft").unwrap();
        session.logout();
        assert!(!session.is_logged_in());
        assert_eq!(store.get(COMMENT_BOX_KEY).unwrap(), None);
    }

    #[test]
    fn writes_are_broadcast() {
        let store = LocalStore::in_memory().unwrap();
        let session = SessionStore::new(store.clone());
        let mut events = session.subscribe();

        session.login(&user("u1")).unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.key, SESSION_KEY);
        assert!(event.old_value.is_none());
        assert!(event.new_value.unwrap().contains("\"objectId\":\"u1\""));

        store.notify_external(SESSION_KEY).unwrap();
        assert_eq!(events.try_recv().unwrap().key, SESSION_KEY);
    }
}
