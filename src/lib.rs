//! Article likes stored as marked comments on a Waline comment server.
//!
//! A like is an ordinary comment whose body is [`models::LIKE_RECORD_MARKER`].
//! [`waline_client::LikeService`] counts and mutates those records,
//! [`like_state::LikeStateController`] drives an optimistic like button, and
//! [`reconciler::CommentFeedReconciler`] hides the records from a rendered
//! comment list and keeps its visible counts honest.

pub mod cache;
pub mod config;
pub mod db;
pub mod dom;
pub mod errors;
pub mod like_state;
pub mod models;
pub mod reconciler;
pub mod waline_client;

pub use cache::{CacheConfig, Freshness, StatsCache};
pub use config::{LikeConfig, RetryConfig};
pub use db::{LikedPaths, LocalStore, SessionStore, SessionUser};
pub use errors::{classify, Classification, ErrorCategory, FailureKind, LikeError, Remedy};
pub use like_state::{ClientLikeState, LikeStateController, ToggleOutcome};
pub use models::{ArticleStats, LikeUser, LIKE_RECORD_MARKER};
pub use reconciler::{CommentFeedReconciler, ReconcilerConfig, ReconcilerStats};
pub use waline_client::LikeService;
