use serde::{Deserialize, Serialize};
use tracing::debug;

/// How `Delta.text` relates to the text already received for a reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaMode {
    /// Every delta carries the whole reply so far.
    #[default]
    Cumulative,
    /// Every delta carries only the newest fragment.
    Incremental,
}

/// Accumulates one reply and reports only the text not yet shown.
///
/// The buffer never shrinks: in cumulative mode a delta shorter than the
/// current text (a stale or truncated resend) is ignored. A delta at least as
/// long replaces the text, even when the remote revised earlier tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyBuffer {
    mode: DeltaMode,
    text: String,
}

impl ReplyBuffer {
    #[must_use]
    pub fn new(mode: DeltaMode) -> Self {
        Self {
            mode,
            text: String::new(),
        }
    }

    /// Feeds one delta and returns the unseen suffix (possibly empty).
    pub fn push(&mut self, delta: &str) -> &str {
        let seen = self.text.len();
        match self.mode {
            DeltaMode::Incremental => {
                self.text.push_str(delta);
                &self.text[seen..]
            }
            DeltaMode::Cumulative if delta.len() < seen => "",
            DeltaMode::Cumulative => {
                if !delta.starts_with(self.text.as_str()) {
                    debug!(seen, len = delta.len(), "cumulative delta revised earlier text");
                }
                self.text.clear();
                self.text.push_str(delta);
                let mut start = seen;
                while !self.text.is_char_boundary(start) {
                    start -= 1;
                }
                &self.text[start..]
            }
        }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn mode(&self) -> DeltaMode {
        self.mode
    }

    #[must_use]
    pub fn into_text(self) -> String {
        self.text
    }
}

/// A fully received reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub text: String,
    pub conversation_id: String,
    pub message_id: String,
    /// Why the remote stopped, from the last delta (`stop`, `max_tokens`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_details: Option<String>,
}
