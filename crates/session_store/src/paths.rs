use std::path::{Path, PathBuf};

pub const SESSION_DIR: &str = "sessions";
pub const TOKEN_CACHE_FILE: &str = "cache.json";

/// Directory holding turn journals under a configuration directory.
#[must_use]
pub fn session_root(config_dir: &Path) -> PathBuf {
    config_dir.join(SESSION_DIR)
}

#[must_use]
pub fn token_cache_path(config_dir: &Path) -> PathBuf {
    config_dir.join(TOKEN_CACHE_FILE)
}

#[must_use]
pub fn sanitize_timestamp_for_filename(timestamp: &str) -> String {
    timestamp
        .chars()
        .map(|c| match c {
            ':' | '/' | '\\' | ' ' => '-',
            _ => c,
        })
        .collect()
}

/// Journal file name; the timestamp prefix makes lexical order chronological.
#[must_use]
pub fn session_file_name(created_at: &str, session_id: &str) -> String {
    format!(
        "{}_{}.jsonl",
        sanitize_timestamp_for_filename(created_at),
        session_id
    )
}
