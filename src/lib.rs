//! Conversation session client for the web chat backend.
//!
//! Invariant: one [`ConversationSession`] is the only writer of its
//! conversation graph and credential; every turn runs under the session lock.
//!
//! # Public API Overview
//! - Drive turns through [`ConversationSession`] (`ask`, `ask_stream`,
//!   `continue_stream`) and undo them with `rollback`.
//! - Track the branching pointer with [`ConversationGraph`].
//! - Keep credentials valid with [`CredentialLifecycle`] and the built-in
//!   authenticators.
//! - Load [`ClientConfig`] files and turn them into [`SessionSettings`].
//! - Persist the pointer between runs with `session_store`.
//!
//! Wire types (`StreamEvent`, `Credential`, the collaborator traits) are
//! re-exported from `chat_wire`.

pub mod auth;
pub mod config;
pub mod credential;
pub mod error;
pub mod graph;
pub mod logging;
pub mod reply;
pub mod session;

pub use crate::auth::{CachedAuthenticator, StaticTokenAuthenticator};
pub use crate::config::{
    config_search_paths, default_config_dir, ClientConfig, ConfigError, SessionSettings,
    BASE_URL_ENV, DEFAULT_TIMEOUT,
};
pub use crate::credential::{CredentialLifecycle, CredentialState, RetryBudget};
pub use crate::error::SessionError;
pub use crate::graph::{ConversationGraph, Pointer, PreparedTurn, DEFAULT_HISTORY_CAP};
pub use crate::reply::{DeltaMode, Reply, ReplyBuffer};
pub use crate::session::{AskOptions, ConversationSession, TurnStream};

pub use chat_wire::{
    ApiConfig, ApiError, Authenticator, Credential, HistoryLookup, HttpTransport,
    SessionCookieAuthenticator, StreamDecoder, StreamErrorKind, StreamEvent, Transport,
};
pub use session_store::{ConversationPointer, SessionStore, SessionStoreError, TokenCache};
