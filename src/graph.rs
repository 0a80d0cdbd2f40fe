//! Branching conversation pointer with bounded undo history.
//!
//! The graph never talks to the network. Resolving a resumed conversation's
//! current node is done by the session, which feeds the result back through
//! [`ConversationGraph::remember_current_node`] before preparing the turn.

use std::collections::{HashMap, VecDeque};

use chat_wire::payload::{ConversationRequest, Turn, TurnAction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SessionError;

pub const DEFAULT_HISTORY_CAP: usize = 64;

/// `(conversation_id, parent_id)` pair the next turn attaches to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pointer {
    pub conversation_id: Option<String>,
    pub parent_id: Option<String>,
}

/// A resolved turn, ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTurn {
    pub action: TurnAction,
    /// The user message; `None` for a continuation.
    pub turn: Option<Turn>,
    pub conversation_id: Option<String>,
    pub parent_id: String,
}

impl PreparedTurn {
    #[must_use]
    pub fn to_request(&self, model: &str, history_disabled: bool) -> ConversationRequest {
        let request = match &self.turn {
            Some(turn) => ConversationRequest::next(
                turn,
                self.conversation_id.clone(),
                self.parent_id.clone(),
                model,
            ),
            None => ConversationRequest::continuation(
                self.conversation_id.clone(),
                self.parent_id.clone(),
                model,
            ),
        };
        request.with_history_disabled(history_disabled)
    }
}

enum Target {
    Attached {
        conversation_id: Option<String>,
        parent_id: String,
    },
    /// Known conversation with no known node.
    Unresolved { conversation_id: String },
    NewConversation,
}

#[derive(Debug, Clone)]
pub struct ConversationGraph {
    current: Pointer,
    history: VecDeque<Pointer>,
    history_cap: usize,
    /// Last known node of every conversation this graph has seen.
    mapping: HashMap<String, String>,
}

impl Default for ConversationGraph {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}

impl ConversationGraph {
    #[must_use]
    pub fn new(history_cap: usize) -> Self {
        Self {
            current: Pointer::default(),
            history: VecDeque::new(),
            history_cap: history_cap.max(1),
            mapping: HashMap::new(),
        }
    }

    /// Starts from a pointer persisted by an earlier run.
    #[must_use]
    pub fn resume(
        history_cap: usize,
        conversation_id: Option<String>,
        parent_id: Option<String>,
    ) -> Self {
        let mut graph = Self::new(history_cap);
        if let (Some(conversation_id), Some(parent_id)) = (&conversation_id, &parent_id) {
            graph
                .mapping
                .insert(conversation_id.clone(), parent_id.clone());
        }
        graph.current = Pointer {
            conversation_id,
            parent_id,
        };
        graph
    }

    #[must_use]
    pub fn conversation_id(&self) -> Option<&str> {
        self.current.conversation_id.as_deref()
    }

    #[must_use]
    pub fn parent_id(&self) -> Option<&str> {
        self.current.parent_id.as_deref()
    }

    #[must_use]
    pub fn pointer(&self) -> Pointer {
        self.current.clone()
    }

    #[must_use]
    pub fn history_depth(&self) -> usize {
        self.history.len()
    }

    #[must_use]
    pub fn history_cap(&self) -> usize {
        self.history_cap
    }

    /// Last known node of `conversation_id`, if any.
    #[must_use]
    pub fn current_node(&self, conversation_id: &str) -> Option<&str> {
        self.mapping.get(conversation_id).map(String::as_str)
    }

    /// Conversation whose current node must be looked up before a turn with
    /// these explicit ids can be prepared, or `None` when no lookup is needed.
    #[must_use]
    pub fn pending_lookup(
        &self,
        conversation_id: Option<&str>,
        parent_id: Option<&str>,
    ) -> Option<String> {
        match self.target(conversation_id, parent_id) {
            Ok(Target::Unresolved { conversation_id }) => Some(conversation_id),
            _ => None,
        }
    }

    /// Records a looked-up current node.
    pub fn remember_current_node(
        &mut self,
        conversation_id: impl Into<String>,
        node: impl Into<String>,
    ) {
        self.mapping.insert(conversation_id.into(), node.into());
    }

    /// Resolves the ids for a new user turn and records the pre-turn pointer
    /// in the undo history. The current pointer itself only moves when a
    /// reply is applied.
    pub fn prepare_turn(
        &mut self,
        turn: Turn,
        conversation_id: Option<&str>,
        parent_id: Option<&str>,
    ) -> Result<PreparedTurn, SessionError> {
        let (conversation_id, parent_id) = self.attach(conversation_id, parent_id)?;
        Ok(PreparedTurn {
            action: TurnAction::Next,
            turn: Some(turn),
            conversation_id,
            parent_id,
        })
    }

    /// Resolves the ids for continuing the last reply on the current branch.
    pub fn prepare_continue(
        &mut self,
        conversation_id: Option<&str>,
        parent_id: Option<&str>,
    ) -> Result<PreparedTurn, SessionError> {
        let prepared = self.continue_target(conversation_id, parent_id)?;
        self.push_history();
        Ok(prepared)
    }

    /// Continues the reply just applied as part of the turn that produced
    /// it, so the undo history keeps a single entry for both.
    pub fn prepare_continuation(&self) -> Result<PreparedTurn, SessionError> {
        self.continue_target(None, None)
    }

    fn continue_target(
        &self,
        conversation_id: Option<&str>,
        parent_id: Option<&str>,
    ) -> Result<PreparedTurn, SessionError> {
        let Target::Attached {
            conversation_id: Some(conversation_id),
            parent_id,
        } = self.target(conversation_id, parent_id)?
        else {
            return Err(SessionError::User(
                "continue requires an existing conversation with a known reply".to_owned(),
            ));
        };

        Ok(PreparedTurn {
            action: TurnAction::Continue,
            turn: None,
            conversation_id: Some(conversation_id),
            parent_id,
        })
    }

    /// Moves the pointer to a decoded reply. Re-applying the same ids is a
    /// no-op; returns whether the pointer changed.
    pub fn apply(&mut self, conversation_id: &str, message_id: &str) -> bool {
        self.mapping
            .insert(conversation_id.to_owned(), message_id.to_owned());

        if self.current.conversation_id.as_deref() == Some(conversation_id)
            && self.current.parent_id.as_deref() == Some(message_id)
        {
            return false;
        }

        self.current = Pointer {
            conversation_id: Some(conversation_id.to_owned()),
            parent_id: Some(message_id.to_owned()),
        };
        true
    }

    /// Pops `n` history entries and restores the oldest popped one. `n == 0`
    /// is a no-op.
    pub fn rollback(&mut self, n: usize) -> Result<(), SessionError> {
        if n > self.history.len() {
            return Err(SessionError::RollbackUnderflow {
                requested: n,
                available: self.history.len(),
            });
        }

        let mut restored = None;
        for _ in 0..n {
            restored = self.history.pop_back();
        }
        if let Some(pointer) = restored {
            debug!(
                conversation_id = ?pointer.conversation_id,
                parent_id = ?pointer.parent_id,
                n,
                "rolled back conversation pointer"
            );
            self.current = pointer;
        }
        Ok(())
    }

    /// Detaches from the current conversation. Not undoable and leaves the
    /// history untouched.
    pub fn reset(&mut self) {
        self.current = Pointer {
            conversation_id: None,
            parent_id: Some(fresh_id()),
        };
    }

    fn attach(
        &mut self,
        conversation_id: Option<&str>,
        parent_id: Option<&str>,
    ) -> Result<(Option<String>, String), SessionError> {
        let resolved = match self.target(conversation_id, parent_id)? {
            Target::Attached {
                conversation_id,
                parent_id,
            } => (conversation_id, parent_id),
            Target::Unresolved { conversation_id } => {
                warn!(
                    %conversation_id,
                    "conversation has no known current node; starting a new conversation"
                );
                (None, fresh_id())
            }
            Target::NewConversation => (None, fresh_id()),
        };

        self.push_history();
        debug!(
            conversation_id = ?resolved.0,
            parent_id = %resolved.1,
            "prepared turn"
        );
        Ok(resolved)
    }

    fn target(
        &self,
        conversation_id: Option<&str>,
        parent_id: Option<&str>,
    ) -> Result<Target, SessionError> {
        let conversation_id = conversation_id.filter(|id| !id.trim().is_empty());
        let parent_id = parent_id.filter(|id| !id.trim().is_empty());

        if parent_id.is_some() && conversation_id.is_none() {
            return Err(SessionError::User(
                "parent requires conversation".to_owned(),
            ));
        }

        let switching = conversation_id
            .is_some_and(|id| self.current.conversation_id.as_deref() != Some(id));
        let conversation_id = conversation_id
            .map(ToOwned::to_owned)
            .or_else(|| self.current.conversation_id.clone());
        let parent_id = match parent_id {
            Some(parent_id) => Some(parent_id.to_owned()),
            None if switching => None,
            None => self.current.parent_id.clone(),
        };

        Ok(match (conversation_id, parent_id) {
            (conversation_id, Some(parent_id)) => Target::Attached {
                conversation_id,
                parent_id,
            },
            (Some(conversation_id), None) => match self.mapping.get(&conversation_id) {
                Some(node) => Target::Attached {
                    parent_id: node.clone(),
                    conversation_id: Some(conversation_id),
                },
                None => Target::Unresolved { conversation_id },
            },
            (None, None) => Target::NewConversation,
        })
    }

    fn push_history(&mut self) {
        self.history.push_back(self.current.clone());
        while self.history.len() > self.history_cap {
            self.history.pop_front();
        }
    }
}

fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}
