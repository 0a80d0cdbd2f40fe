use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::error::SessionStoreError;
use crate::paths::{session_file_name, session_root};
use crate::schema::{JsonLine, SessionEntry, SessionEntryKind, SessionHeader};

/// `(conversation_id, message_id)` to resume a conversation from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationPointer {
    pub conversation_id: String,
    pub message_id: String,
}

/// Append-only JSONL journal of the turns of one session.
pub struct SessionStore {
    pub(crate) path: PathBuf,
    pub(crate) file: File,
    pub(crate) header: SessionHeader,
    pub(crate) entries: Vec<SessionEntry>,
    pub(crate) index_by_id: HashMap<String, usize>,
    pub(crate) current_leaf_id: Option<String>,
}

impl SessionStore {
    /// Creates a fresh journal under `session_root(config_dir)`.
    pub fn create_new(config_dir: &Path) -> Result<Self, SessionStoreError> {
        let root = session_root(config_dir);
        fs::create_dir_all(&root)
            .map_err(|source| SessionStoreError::io("creating session root", &root, source))?;

        let created_at = now_rfc3339()?;
        let header = SessionHeader::v1(Uuid::new_v4().to_string(), created_at);
        let path = root.join(session_file_name(&header.created_at, &header.session_id));

        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|source| SessionStoreError::io("creating session file", &path, source))?;
        let line = serde_json::to_string(&header)
            .map_err(|source| SessionStoreError::json_serialize(&path, source))?;
        writeln!(file, "{line}")
            .and_then(|()| file.flush())
            .map_err(|source| SessionStoreError::io("writing session header", &path, source))?;

        debug!(path = %path.display(), "created session journal");
        Ok(Self {
            path,
            file,
            header,
            entries: Vec::new(),
            index_by_id: HashMap::new(),
            current_leaf_id: None,
        })
    }

    pub fn open(path: &Path) -> Result<Self, SessionStoreError> {
        let path = path.to_path_buf();
        let read_file = File::open(&path)
            .map_err(|source| SessionStoreError::io("opening session file", &path, source))?;
        let reader = BufReader::new(read_file);

        let mut header: Option<SessionHeader> = None;
        let mut entries = Vec::new();
        let mut index_by_id = HashMap::new();

        for (line_index, line_result) in reader.lines().enumerate() {
            let line_number = line_index + 1;
            let line = line_result
                .map_err(|source| SessionStoreError::io_line(&path, line_number, source))?;
            let parsed = parse_json_line(&path, line_number, &line)?;

            if line_number == 1 {
                match parsed {
                    JsonLine::Session(parsed_header) => {
                        validate_header_line(&path, line_number, &parsed_header)?;
                        header = Some(parsed_header);
                    }
                    JsonLine::Entry(_) => {
                        return Err(SessionStoreError::InvalidHeaderRecord {
                            path,
                            line: line_number,
                        });
                    }
                }

                continue;
            }

            match parsed {
                JsonLine::Session(_) => {
                    return Err(SessionStoreError::InvalidEntryRecord {
                        path,
                        line: line_number,
                    });
                }
                JsonLine::Entry(entry) => {
                    validate_entry_line(&path, line_number, &entry, &index_by_id)?;
                    index_by_id.insert(entry.id.clone(), entries.len());
                    entries.push(entry);
                }
            }
        }

        let header =
            header.ok_or_else(|| SessionStoreError::MissingHeader { path: path.clone() })?;
        let current_leaf_id = entries.last().map(|entry| entry.id.clone());

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|source| {
                SessionStoreError::io("opening session file for append", &path, source)
            })?;

        Ok(Self {
            path,
            file,
            header,
            entries,
            index_by_id,
            current_leaf_id,
        })
    }

    /// Newest journal file under `session_root(config_dir)`.
    pub fn latest_session_path(config_dir: &Path) -> Result<PathBuf, SessionStoreError> {
        let root = session_root(config_dir);
        let read_dir = match fs::read_dir(&root) {
            Ok(read_dir) => read_dir,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionStoreError::NoSessionsFound { root });
            }
            Err(source) => {
                return Err(SessionStoreError::io("listing session root", &root, source));
            }
        };

        let mut candidates = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry
                .map_err(|source| SessionStoreError::io("listing session root", &root, source))?;
            let path = dir_entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "jsonl") {
                candidates.push(path);
            }
        }

        candidates.sort_by(|left, right| left.file_name().cmp(&right.file_name()));
        candidates
            .pop()
            .ok_or(SessionStoreError::NoSessionsFound { root })
    }

    /// Opens the newest journal under `session_root(config_dir)`.
    pub fn latest(config_dir: &Path) -> Result<Self, SessionStoreError> {
        Self::open(&Self::latest_session_path(config_dir)?)
    }

    pub fn append(&mut self, entry: SessionEntry) -> Result<(), SessionStoreError> {
        let line_number = self.entries.len() + 2;
        validate_entry_line(&self.path, line_number, &entry, &self.index_by_id)?;

        let line = serde_json::to_string(&entry)
            .map_err(|source| SessionStoreError::json_serialize(&self.path, source))?;
        writeln!(self.file, "{line}")
            .and_then(|()| self.file.flush())
            .map_err(|source| SessionStoreError::io("appending session entry", &self.path, source))?;

        self.index_by_id.insert(entry.id.clone(), self.entries.len());
        self.current_leaf_id = Some(entry.id.clone());
        self.entries.push(entry);
        Ok(())
    }

    /// Journals one completed exchange: the user message attached to
    /// `parent_id`, then the assistant reply attached to the user message.
    pub fn append_turn(
        &mut self,
        conversation_id: &str,
        parent_id: &str,
        user_message_id: &str,
        prompt: &str,
        assistant_message_id: &str,
        reply: &str,
    ) -> Result<(), SessionStoreError> {
        let ts = now_rfc3339()?;
        if !self.index_by_id.contains_key(user_message_id) {
            self.append(SessionEntry::new(
                user_message_id,
                Some(parent_id),
                Some(conversation_id),
                ts.clone(),
                SessionEntryKind::UserText {
                    text: prompt.to_owned(),
                },
            ))?;
        }
        self.append(SessionEntry::new(
            assistant_message_id,
            Some(user_message_id),
            Some(conversation_id),
            ts,
            SessionEntryKind::AssistantText {
                text: reply.to_owned(),
            },
        ))
    }

    /// Conversation and message id of the last journaled assistant reply.
    #[must_use]
    pub fn current_pointer(&self) -> Option<ConversationPointer> {
        self.entries
            .iter()
            .rev()
            .filter(|entry| entry.is_assistant())
            .find_map(|entry| {
                Some(ConversationPointer {
                    conversation_id: entry.conversation_id.clone()?,
                    message_id: entry.id.clone(),
                })
            })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    #[must_use]
    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    #[must_use]
    pub fn current_leaf_id(&self) -> Option<&str> {
        self.current_leaf_id.as_deref()
    }
}

pub(crate) fn now_rfc3339() -> Result<String, SessionStoreError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(SessionStoreError::ClockFormat)
}

pub(crate) fn parse_json_line(
    path: &Path,
    line_number: usize,
    line: &str,
) -> Result<JsonLine, SessionStoreError> {
    let to_error = |source| SessionStoreError::json_line(path, line_number, source);
    let value = serde_json::from_str::<Value>(line).map_err(to_error)?;
    // The record type stays inside the value so the typed structs still see
    // their own `type` field.
    match value.get("type").and_then(Value::as_str) {
        Some("session") => serde_json::from_value(value)
            .map(JsonLine::Session)
            .map_err(to_error),
        _ => serde_json::from_value(value)
            .map(JsonLine::Entry)
            .map_err(to_error),
    }
}

pub(crate) fn validate_header_line(
    path: &Path,
    line_number: usize,
    header: &SessionHeader,
) -> Result<(), SessionStoreError> {
    if header.version != 1 {
        return Err(SessionStoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            line: line_number,
            found: header.version,
        });
    }

    validate_rfc3339(path, line_number, "created_at", &header.created_at)
}

pub(crate) fn validate_entry_line(
    path: &Path,
    line_number: usize,
    entry: &SessionEntry,
    index_by_id: &HashMap<String, usize>,
) -> Result<(), SessionStoreError> {
    if entry.id.trim().is_empty() {
        return Err(SessionStoreError::EmptyEntryId {
            path: path.to_path_buf(),
            line: line_number,
        });
    }
    if index_by_id.contains_key(&entry.id) {
        return Err(SessionStoreError::DuplicateEntryId {
            path: path.to_path_buf(),
            line: line_number,
            id: entry.id.clone(),
        });
    }
    validate_rfc3339(path, line_number, "ts", &entry.ts)
}

pub(crate) fn validate_rfc3339(
    path: &Path,
    line_number: usize,
    field: &'static str,
    value: &str,
) -> Result<(), SessionStoreError> {
    if OffsetDateTime::parse(value, &Rfc3339).is_err() {
        return Err(SessionStoreError::InvalidTimestamp {
            path: path.to_path_buf(),
            line: line_number,
            field,
            value: value.to_string(),
        });
    }

    Ok(())
}
