use std::path::PathBuf;

use thiserror::Error;

/// Failures reading or writing a turn journal or the token cache.
#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("{operation} {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("reading journal {path} at line {line}: {source}")]
    IoLine {
        path: PathBuf,
        line: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("journal {path}:{line} is not valid JSON: {source}")]
    JsonLineParse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} is not valid JSON: {source}")]
    JsonParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("journal {path} is empty; expected a session header")]
    MissingHeader { path: PathBuf },

    #[error("journal {path}:{line}: expected a `session` header")]
    InvalidHeaderRecord { path: PathBuf, line: usize },

    #[error("journal {path}:{line}: version {found} is not supported")]
    UnsupportedVersion {
        path: PathBuf,
        line: usize,
        found: u32,
    },

    #[error("journal {path}:{line}: entry id `{id}` already used")]
    DuplicateEntryId {
        path: PathBuf,
        line: usize,
        id: String,
    },

    #[error("journal {path}:{line}: entry id is empty")]
    EmptyEntryId { path: PathBuf, line: usize },

    #[error("journal {path}:{line}: expected an `entry` record")]
    InvalidEntryRecord { path: PathBuf, line: usize },

    #[error("journal {path}:{line}: `{field}` is not an RFC3339 timestamp: {value}")]
    InvalidTimestamp {
        path: PathBuf,
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("no journals under {root}")]
    NoSessionsFound { root: PathBuf },

    #[error("journal {path} has no entry `{leaf_id}`")]
    UnknownLeafId { path: PathBuf, leaf_id: String },

    #[error("journal {path}: parent chain of `{leaf_id}` loops")]
    ReplayCycle { path: PathBuf, leaf_id: String },

    #[error("encoding record for {path}: {source}")]
    JsonSerialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("formatting the current time: {0}")]
    ClockFormat(#[source] time::error::Format),
}

impl SessionStoreError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn io_line(path: impl Into<PathBuf>, line: usize, source: std::io::Error) -> Self {
        Self::IoLine {
            path: path.into(),
            line,
            source,
        }
    }

    #[must_use]
    pub fn json_line(path: impl Into<PathBuf>, line: usize, source: serde_json::Error) -> Self {
        Self::JsonLineParse {
            path: path.into(),
            line,
            source,
        }
    }

    #[must_use]
    pub fn json_serialize(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::JsonSerialize {
            path: path.into(),
            source,
        }
    }
}
