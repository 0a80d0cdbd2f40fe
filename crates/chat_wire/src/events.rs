use serde::{Deserialize, Serialize};

/// Author role attached to a message in the conversation tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            "system" => Self::System,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }
}

/// Category of an error payload decoded from the response stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    RateLimited,
    InvalidCredential,
    ConcurrentRequest,
    Malformed,
    Server,
}

impl StreamErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::InvalidCredential => "invalid_credential",
            Self::ConcurrentRequest => "concurrent_request",
            Self::Malformed => "malformed",
            Self::Server => "server",
        }
    }
}

/// Event produced by [`crate::StreamDecoder`] for one response.
///
/// `Delta.text` carries whatever the service sent for that record; depending
/// on the upstream variant this is either the cumulative reply so far or only
/// the newest fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Delta {
        text: String,
        conversation_id: String,
        message_id: String,
        /// `message.metadata.finish_details.type`, e.g. `stop` or `max_tokens`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_details: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_turn: Option<bool>,
    },
    Done,
    Error {
        kind: StreamErrorKind,
        detail: String,
    },
}

/// `finish_details` of a reply cut off by the output token limit.
pub const FINISH_MAX_TOKENS: &str = "max_tokens";

impl StreamEvent {
    /// Builds a delta without finish metadata.
    #[must_use]
    pub fn delta(
        text: impl Into<String>,
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self::Delta {
            text: text.into(),
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            finish_details: None,
            end_turn: None,
        }
    }

    /// True for a delta whose reply stopped at the output token limit.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        matches!(
            self,
            Self::Delta { finish_details: Some(reason), .. } if reason == FINISH_MAX_TOKENS
        )
    }

    /// Returns true when no further events may follow this one.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}
