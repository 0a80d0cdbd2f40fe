use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::Role;

/// Model used when neither the session nor the caller names one.
pub const DEFAULT_MODEL: &str = "text-davinci-002-render-sha";

/// Turn action understood by the conversation endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnAction {
    /// Send a new user message.
    Next,
    /// Ask the assistant to keep writing its previous reply.
    Continue,
}

/// One message of a turn: caller-supplied or generated id, author role, and
/// ordered text parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub role: Role,
    pub content_parts: Vec<String>,
}

impl Turn {
    /// Builds a user turn with a freshly generated id.
    #[must_use]
    pub fn user(prompt: impl Into<String>) -> Self {
        Self::user_with_id(Uuid::new_v4().to_string(), prompt)
    }

    #[must_use]
    pub fn user_with_id(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            content_parts: vec![prompt.into()],
        }
    }

    /// Concatenated text of all parts.
    #[must_use]
    pub fn text(&self) -> String {
        self.content_parts.concat()
    }
}

/// Request body for one turn against the conversation endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRequest {
    pub action: TurnAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<WireMessage>,
    pub conversation_id: Option<String>,
    pub parent_message_id: String,
    pub model: String,
    #[serde(default)]
    pub history_and_training_disabled: bool,
}

impl ConversationRequest {
    /// Request carrying a new user turn.
    #[must_use]
    pub fn next(
        turn: &Turn,
        conversation_id: Option<String>,
        parent_message_id: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            action: TurnAction::Next,
            messages: vec![WireMessage::from(turn)],
            conversation_id,
            parent_message_id: parent_message_id.into(),
            model: model.into(),
            history_and_training_disabled: false,
        }
    }

    /// Request asking the assistant to continue its last reply.
    #[must_use]
    pub fn continuation(
        conversation_id: Option<String>,
        parent_message_id: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            action: TurnAction::Continue,
            messages: Vec::new(),
            conversation_id,
            parent_message_id: parent_message_id.into(),
            model: model.into(),
            history_and_training_disabled: false,
        }
    }

    #[must_use]
    pub fn with_history_disabled(mut self, disabled: bool) -> Self {
        self.history_and_training_disabled = disabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    pub role: Role,
    pub author: WireAuthor,
    pub content: WireContent,
}

impl From<&Turn> for WireMessage {
    fn from(turn: &Turn) -> Self {
        Self {
            id: turn.id.clone(),
            role: turn.role,
            author: WireAuthor { role: turn.role },
            content: WireContent {
                content_type: "text".to_owned(),
                parts: turn.content_parts.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAuthor {
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireContent {
    pub content_type: String,
    pub parts: Vec<String>,
}
