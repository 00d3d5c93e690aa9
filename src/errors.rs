use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Auth,
    Conflict,
    Transport,
    Data,
}

#[derive(Debug, Error)]
pub enum LikeError {
    #[error("login required")]
    LoginRequired,
    #[error("session token expired or invalid")]
    TokenExpired,
    #[error("article already liked by this user")]
    AlreadyLiked,
    #[error("like record not found")]
    RecordNotFound,
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("comment API responded with HTTP {status}")]
    Http { status: StatusCode },
    #[error("malformed JSON from comment API: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("comment API error {errno}: {errmsg}")]
    Api { errno: i64, errmsg: String },
    #[error("expected an array of comments, got {0}")]
    NotArray(&'static str),
    #[error("comment API returned no data after the update")]
    NoData,
    #[error("article path is empty")]
    EmptyPath,
}

impl LikeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            LikeError::LoginRequired | LikeError::TokenExpired => ErrorCategory::Auth,
            LikeError::AlreadyLiked | LikeError::RecordNotFound => ErrorCategory::Conflict,
            LikeError::Network(_) | LikeError::Http { .. } | LikeError::Malformed(_) => {
                ErrorCategory::Transport
            }
            LikeError::Api { .. }
            | LikeError::NotArray(_)
            | LikeError::NoData
            | LikeError::EmptyPath => ErrorCategory::Data,
        }
    }
}

/// What the presentation layer shows for a failed toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    LoginRequired,
    TokenExpired,
    Duplicate,
    Network,
    RecordNotFound,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remedy {
    PromptLogin,
    ClearSessionThenPromptLogin,
}

impl Remedy {
    pub fn clears_session(self) -> bool {
        matches!(self, Remedy::ClearSessionThenPromptLogin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: FailureKind,
    pub message: &'static str,
    pub remedy: Option<Remedy>,
    /// Informational outcomes are shown as notices, not errors.
    pub informational: bool,
}

pub fn classify(error: &LikeError) -> Classification {
    match error {
        LikeError::LoginRequired => Classification {
            kind: FailureKind::LoginRequired,
            message: "Please log in before liking",
            remedy: Some(Remedy::PromptLogin),
            informational: false,
        },
        LikeError::TokenExpired => Classification {
            kind: FailureKind::TokenExpired,
            message: "Your login has expired, please log in again",
            remedy: Some(Remedy::ClearSessionThenPromptLogin),
            informational: false,
        },
        LikeError::AlreadyLiked => Classification {
            kind: FailureKind::Duplicate,
            message: "You have already liked this",
            remedy: None,
            informational: true,
        },
        LikeError::Network(_) => Classification {
            kind: FailureKind::Network,
            message: "Network connection failed, check your connection and retry",
            remedy: None,
            informational: true,
        },
        LikeError::RecordNotFound => Classification {
            kind: FailureKind::RecordNotFound,
            message: "No like record found, it may already be removed",
            remedy: None,
            informational: true,
        },
        _ => Classification {
            kind: FailureKind::Unknown,
            message: "Operation failed, please try again later",
            remedy: None,
            informational: false,
        },
    }
}
