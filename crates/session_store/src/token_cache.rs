use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SessionStoreError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    access_tokens: BTreeMap<String, String>,
}

/// Access tokens cached per account in a small JSON document:
/// `{"access_tokens": {"<account>": "<token>"}}`.
#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
    contents: CacheFile,
}

impl TokenCache {
    /// Loads the cache at `path`. A missing file is an empty cache.
    pub fn load(path: &Path) -> Result<Self, SessionStoreError> {
        let contents = match fs::read_to_string(path) {
            Ok(raw) if raw.trim().is_empty() => CacheFile::default(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| SessionStoreError::JsonParse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => CacheFile::default(),
            Err(source) => return Err(SessionStoreError::io("reading token cache", path, source)),
        };

        Ok(Self {
            path: path.to_path_buf(),
            contents,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn get(&self, account: &str) -> Option<&str> {
        self.contents
            .access_tokens
            .get(account)
            .map(String::as_str)
            .filter(|token| !token.trim().is_empty())
    }

    pub fn insert(&mut self, account: impl Into<String>, token: impl Into<String>) {
        self.contents
            .access_tokens
            .insert(account.into(), token.into());
    }

    pub fn remove(&mut self, account: &str) -> Option<String> {
        self.contents.access_tokens.remove(account)
    }

    /// Writes the cache through a sibling temp file and a rename so readers
    /// never observe a partial document.
    pub fn save(&self) -> Result<(), SessionStoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|source| SessionStoreError::io("creating cache dir", parent, source))?;
        }

        let rendered = serde_json::to_string_pretty(&self.contents)
            .map_err(|source| SessionStoreError::json_serialize(&self.path, source))?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, rendered)
            .map_err(|source| SessionStoreError::io("writing token cache", &staging, source))?;
        fs::rename(&staging, &self.path)
            .map_err(|source| SessionStoreError::io("replacing token cache", &self.path, source))?;

        debug!(path = %self.path.display(), "token cache saved");
        Ok(())
    }
}
