//! On-disk state kept between process runs: the JSONL turn journal and the
//! access-token cache.

mod error;
mod paths;
mod replay;
mod schema;
mod store;
mod token_cache;

pub use error::SessionStoreError;
pub use paths::{session_file_name, session_root, token_cache_path};
pub use schema::{
    EntryRecordType, SessionEntry, SessionEntryKind, SessionHeader, SessionRecordType,
};
pub use store::{ConversationPointer, SessionStore};
pub use token_cache::TokenCache;
