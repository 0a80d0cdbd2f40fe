use std::time::Duration;

use chat_wire::{ApiError, StreamErrorKind};
use thiserror::Error;

/// Failure taxonomy surfaced by a conversation session.
///
/// Every failure reaches the caller through `Err`; the session never logs and
/// swallows one.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Caller misuse, e.g. a parent id without a conversation id.
    #[error("invalid request: {0}")]
    User(String),

    /// Credential missing, invalid or expired, and the refresh failed too.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The remote is throttling; back off before retrying the turn.
    #[error("rate limited: {detail}")]
    RateLimit {
        detail: String,
        retry_after: Option<Duration>,
    },

    /// Malformed or unexpected response content.
    #[error("server error: {0}")]
    Server(String),

    /// Transport failure or deadline exceeded.
    #[error("network error: {0}")]
    Network(String),

    #[error("cannot roll back {requested} turn(s); only {available} recorded")]
    RollbackUnderflow { requested: usize, available: usize },
}

impl SessionError {
    /// Maps a decoded stream error to the session taxonomy.
    #[must_use]
    pub fn from_stream(kind: StreamErrorKind, detail: String) -> Self {
        match kind {
            StreamErrorKind::InvalidCredential => Self::Authentication(detail),
            StreamErrorKind::RateLimited | StreamErrorKind::ConcurrentRequest => Self::RateLimit {
                detail,
                retry_after: Some(chat_wire::retry::rate_limit_backoff(0)),
            },
            StreamErrorKind::Malformed | StreamErrorKind::Server => Self::Server(detail),
        }
    }

    #[must_use]
    pub fn is_retryable_by_caller(&self) -> bool {
        matches!(self, Self::RateLimit { .. } | Self::Network(_))
    }
}

impl From<ApiError> for SessionError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::MissingAccessToken | ApiError::Auth(_) => {
                Self::Authentication(error.to_string())
            }
            ApiError::Status {
                kind,
                message,
                retry_after,
                ..
            } => match kind {
                StreamErrorKind::InvalidCredential => Self::Authentication(message),
                StreamErrorKind::RateLimited | StreamErrorKind::ConcurrentRequest => {
                    Self::RateLimit {
                        detail: message,
                        retry_after,
                    }
                }
                StreamErrorKind::Malformed | StreamErrorKind::Server => Self::Server(message),
            },
            ApiError::Timeout { .. } | ApiError::Transport(_) => Self::Network(error.to_string()),
            ApiError::Request(ref inner) if !inner.is_decode() && !inner.is_builder() => {
                Self::Network(error.to_string())
            }
            ApiError::InvalidBaseUrl(_) | ApiError::InvalidHeader(_) => {
                Self::User(error.to_string())
            }
            ApiError::Request(_) | ApiError::Serde(_) | ApiError::MalformedResponse(_) => {
                Self::Server(error.to_string())
            }
        }
    }
}
