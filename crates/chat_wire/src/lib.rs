//! Wire-level primitives for the web conversation backend.
//!
//! This crate owns request construction, response stream decoding, error
//! classification, and the collaborator contracts (`Transport`,
//! `Authenticator`, `HistoryLookup`) a conversation session is driven
//! through. It holds no conversation state of its own.

pub mod auth;
pub mod client;
pub mod config;
pub mod credential;
pub mod decoder;
pub mod error;
pub mod events;
pub mod headers;
pub mod payload;
pub mod retry;
pub mod transport;
pub mod url;

pub use auth::{Authenticator, SessionCookieAuthenticator, SESSION_COOKIE_NAME};
pub use client::HttpTransport;
pub use config::ApiConfig;
pub use credential::Credential;
pub use decoder::StreamDecoder;
pub use error::ApiError;
pub use events::{Role, StreamErrorKind, StreamEvent, FINISH_MAX_TOKENS};
pub use payload::{ConversationRequest, Turn, TurnAction, DEFAULT_MODEL};
pub use transport::{ByteStream, HistoryLookup, OutboundRequest, Transport, TransportResponse};
pub use url::{conversation_url, DEFAULT_BASE_URL};
