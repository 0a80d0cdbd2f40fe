use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::events::StreamErrorKind;
use crate::retry::{is_concurrency_text, is_rate_limit_text, rate_limit_backoff};

pub const STATUS_UNAUTHORIZED: u16 = 401;
pub const STATUS_FORBIDDEN: u16 = 403;
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("access token is required")]
    MissingAccessToken,

    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        kind: StreamErrorKind,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

impl ApiError {
    /// Builds a status error from a non-success response body.
    #[must_use]
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let (kind, message) = classify_error_body(status, body);
        let retry_after = match kind {
            StreamErrorKind::RateLimited | StreamErrorKind::ConcurrentRequest => {
                Some(retry_after.unwrap_or_else(|| rate_limit_backoff(0)))
            }
            _ => None,
        };
        Self::Status {
            status,
            kind,
            message,
            retry_after,
        }
    }

    /// True for 401/403 responses, which the remote uses to reject a credential.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Status { status, .. } if is_auth_failure_status(*status))
    }

    /// True for failures that happened below HTTP semantics (I/O, timeout).
    #[must_use]
    pub fn is_network(&self) -> bool {
        match self {
            Self::Request(error) => !error.is_decode() && !error.is_builder(),
            Self::Timeout { .. } | Self::Transport(_) => true,
            _ => false,
        }
    }
}

#[must_use]
pub fn is_auth_failure_status(status: u16) -> bool {
    matches!(status, STATUS_UNAUTHORIZED | STATUS_FORBIDDEN)
}

/// Classifies a decoded `detail` value (string or `{code, message}` object).
pub fn classify_detail(detail: &Value) -> (StreamErrorKind, String) {
    let (code, message) = match detail {
        Value::String(text) => (None, text.clone()),
        Value::Object(fields) => {
            let code = fields
                .get("code")
                .and_then(Value::as_str)
                .and_then(non_empty_string)
                .map(ToOwned::to_owned);
            let message = fields
                .get("message")
                .and_then(Value::as_str)
                .and_then(non_empty_string)
                .map(ToOwned::to_owned)
                .or_else(|| code.clone())
                .unwrap_or_else(|| detail.to_string());
            (code, message)
        }
        other => (None, other.to_string()),
    };

    (classify(code.as_deref(), &message, None), message)
}

/// Classifies an HTTP error body, falling back to the raw body or the
/// canonical reason when the body carries no structured detail.
pub fn classify_error_body(status: u16, body: &str) -> (StreamErrorKind, String) {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let detail = parsed.as_ref().and_then(|value| {
        value
            .get("detail")
            .or_else(|| value.get("error"))
            .filter(|detail| !detail.is_null())
    });

    let (code, message) = match detail {
        Some(detail) => {
            let (kind, message) = classify_detail(detail);
            if kind != StreamErrorKind::Server {
                return (kind, message);
            }
            let code = detail
                .get("code")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned);
            (code, message)
        }
        None if body.trim().is_empty() => (None, canonical_reason(status).to_owned()),
        None => (None, body.trim().to_owned()),
    };

    (classify(code.as_deref(), &message, Some(status)), message)
}

fn classify(code: Option<&str>, message: &str, status: Option<u16>) -> StreamErrorKind {
    let code = code.unwrap_or("");
    if code.eq_ignore_ascii_case("invalid_api_key")
        || code.eq_ignore_ascii_case("token_expired")
        || code.eq_ignore_ascii_case("invalid_token")
        || status.is_some_and(is_auth_failure_status)
        || is_credential_text(message)
    {
        return StreamErrorKind::InvalidCredential;
    }
    if is_concurrency_text(message) {
        return StreamErrorKind::ConcurrentRequest;
    }
    if status == Some(STATUS_TOO_MANY_REQUESTS)
        || code.to_ascii_lowercase().starts_with("rate_limit")
        || is_rate_limit_text(message)
    {
        return StreamErrorKind::RateLimited;
    }
    StreamErrorKind::Server
}

fn is_credential_text(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    (lowered.contains("token") || lowered.contains("credential") || lowered.contains("api key"))
        && (lowered.contains("expired") || lowered.contains("invalid"))
}

fn canonical_reason(status: u16) -> &'static str {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("request failed")
}

fn non_empty_string(value: &str) -> Option<&str> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn status_error_for_429_carries_backoff_hint() {
        let error = ApiError::from_status(429, "", None);
        match error {
            ApiError::Status {
                kind, retry_after, ..
            } => {
                assert_eq!(kind, StreamErrorKind::RateLimited);
                assert!(retry_after.is_some());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn explicit_retry_after_wins_over_default_hint() {
        let error = ApiError::from_status(429, "", Some(Duration::from_secs(7)));
        assert!(matches!(
            error,
            ApiError::Status { retry_after: Some(after), .. } if after == Duration::from_secs(7)
        ));
    }

    #[test]
    fn auth_failure_detection_covers_401_and_403_only() {
        assert!(ApiError::from_status(401, "", None).is_auth_failure());
        assert!(ApiError::from_status(403, "", None).is_auth_failure());
        assert!(!ApiError::from_status(500, "", None).is_auth_failure());
    }

    #[test]
    fn object_detail_without_message_uses_code() {
        let (kind, message) = classify_detail(&json!({"code": "token_expired"}));
        assert_eq!(kind, StreamErrorKind::InvalidCredential);
        assert_eq!(message, "token_expired");
    }
}
