//! File and environment configuration.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chat_wire::{ApiConfig, ApiError, Authenticator, SessionCookieAuthenticator, DEFAULT_MODEL};
use serde::{Deserialize, Serialize};
use session_store::{token_cache_path, SessionStoreError, TokenCache};
use thiserror::Error;

use crate::auth::{CachedAuthenticator, StaticTokenAuthenticator};
use crate::graph::DEFAULT_HISTORY_CAP;
use crate::reply::DeltaMode;

pub const CONFIG_DIR_NAME: &str = "revChatGPT";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const BASE_URL_ENV: &str = "CHATGPT_BASE_URL";
pub const DEFAULT_SESSION_URL: &str = "https://chat.openai.com/api/auth/session";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(360);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no config file found; searched {}", .searched.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    NotFound { searched: Vec<PathBuf> },

    #[error("config requires access_token or session_token")]
    MissingCredential,

    #[error("{field} must be greater than zero")]
    InvalidTimeout { field: &'static str },

    #[error("history_cap must be greater than zero")]
    InvalidHistoryCap,

    #[error(transparent)]
    Wire(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] SessionStoreError),
}

/// On-disk client configuration (`config.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// Key of the cached access token; typically the account email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub disable_history: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_cap: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_mode: Option<DeltaMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_timeout_sec: Option<u64>,
    /// Asks once for the rest of a reply cut off by the token limit.
    #[serde(default)]
    pub auto_continue: bool,
}

impl ClientConfig {
    pub fn from_json(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        let config = serde_json::from_str::<Self>(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw, path)
    }

    /// Loads the first config file found in [`config_search_paths`].
    pub fn discover() -> Result<(PathBuf, Self), ConfigError> {
        let searched = config_search_paths();
        for path in &searched {
            if path.is_file() {
                return Ok((path.clone(), Self::load(path)?));
            }
        }
        Err(ConfigError::NotFound { searched })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if non_blank(self.access_token.as_deref()).is_none()
            && non_blank(self.session_token.as_deref()).is_none()
        {
            return Err(ConfigError::MissingCredential);
        }
        if self.timeout_sec == Some(0) {
            return Err(ConfigError::InvalidTimeout {
                field: "timeout_sec",
            });
        }
        if self.auth_timeout_sec == Some(0) {
            return Err(ConfigError::InvalidTimeout {
                field: "auth_timeout_sec",
            });
        }
        if self.history_cap == Some(0) {
            return Err(ConfigError::InvalidHistoryCap);
        }
        Ok(())
    }

    /// Runtime settings, with `CHATGPT_BASE_URL` overriding `base_url`.
    #[must_use]
    pub fn settings(&self) -> SessionSettings {
        let base_url = env_string_opt(BASE_URL_ENV)
            .or_else(|| non_blank(self.base_url.as_deref()).map(ToOwned::to_owned));
        self.settings_with_base_url(base_url)
    }

    #[must_use]
    pub fn settings_with_base_url(&self, base_url: Option<String>) -> SessionSettings {
        let defaults = SessionSettings::default();
        let request_timeout = self
            .timeout_sec
            .map(Duration::from_secs)
            .or(defaults.request_timeout);

        let mut api = match base_url {
            Some(base_url) => ApiConfig::new(base_url),
            None => ApiConfig::default(),
        };
        if let Some(proxy) = non_blank(self.proxy.as_deref()) {
            api = api.with_proxy(proxy);
        }
        if let Some(timeout) = request_timeout {
            api = api.with_timeout(timeout);
        }

        SessionSettings {
            model: non_blank(self.model.as_deref())
                .map(ToOwned::to_owned)
                .unwrap_or(defaults.model),
            history_cap: self.history_cap.unwrap_or(defaults.history_cap),
            delta_mode: self.delta_mode.unwrap_or(defaults.delta_mode),
            request_timeout,
            auth_timeout: self
                .auth_timeout_sec
                .map(Duration::from_secs)
                .or(defaults.auth_timeout),
            disable_history: self.disable_history,
            auto_continue: self.auto_continue,
            conversation_id: non_blank(self.conversation_id.as_deref()).map(ToOwned::to_owned),
            parent_id: non_blank(self.parent_id.as_deref()).map(ToOwned::to_owned),
            api,
        }
    }

    /// Builds the authenticator the config describes. A static access token
    /// wins over a session cookie. With an `account` and a cache directory,
    /// issued tokens are cached on disk.
    pub fn authenticator(
        &self,
        settings: &SessionSettings,
        cache_dir: Option<&Path>,
    ) -> Result<Arc<dyn Authenticator>, ConfigError> {
        let account = non_blank(self.account.as_deref());

        if let Some(token) = non_blank(self.access_token.as_deref()) {
            return Ok(Arc::new(StaticTokenAuthenticator::new(token)));
        }

        let session_token =
            non_blank(self.session_token.as_deref()).ok_or(ConfigError::MissingCredential)?;
        let session_url =
            non_blank(self.session_url.as_deref()).unwrap_or(DEFAULT_SESSION_URL);
        let cookie = SessionCookieAuthenticator::new(&settings.api, session_url, session_token)?;

        match (account, cache_dir) {
            (Some(account), Some(cache_dir)) => {
                let cache = TokenCache::load(&token_cache_path(cache_dir))?;
                Ok(Arc::new(CachedAuthenticator::new(cookie, account, cache)))
            }
            _ => Ok(Arc::new(cookie)),
        }
    }
}

/// Runtime settings of one conversation session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub model: String,
    pub history_cap: usize,
    pub delta_mode: DeltaMode,
    /// Deadline for sending a turn and for each read of its body.
    pub request_timeout: Option<Duration>,
    /// Deadline for one authenticator call.
    pub auth_timeout: Option<Duration>,
    pub disable_history: bool,
    /// `ask` follows a `max_tokens` reply with one `continue` turn.
    pub auto_continue: bool,
    pub conversation_id: Option<String>,
    pub parent_id: Option<String>,
    pub api: ApiConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_owned(),
            history_cap: DEFAULT_HISTORY_CAP,
            delta_mode: DeltaMode::Cumulative,
            request_timeout: Some(DEFAULT_TIMEOUT),
            auth_timeout: Some(DEFAULT_TIMEOUT),
            disable_history: false,
            auto_continue: false,
            conversation_id: None,
            parent_id: None,
            api: ApiConfig::default(),
        }
    }
}

impl SessionSettings {
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub fn with_history_cap(mut self, history_cap: usize) -> Self {
        self.history_cap = history_cap;
        self
    }

    #[must_use]
    pub fn with_delta_mode(mut self, delta_mode: DeltaMode) -> Self {
        self.delta_mode = delta_mode;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_auth_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.auth_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_pointer(
        mut self,
        conversation_id: Option<String>,
        parent_id: Option<String>,
    ) -> Self {
        self.conversation_id = conversation_id;
        self.parent_id = parent_id;
        self
    }

    #[must_use]
    pub fn with_history_disabled(mut self, disabled: bool) -> Self {
        self.disable_history = disabled;
        self
    }

    #[must_use]
    pub fn with_auto_continue(mut self, enabled: bool) -> Self {
        self.auto_continue = enabled;
        self
    }

    #[must_use]
    pub fn with_api(mut self, api: ApiConfig) -> Self {
        self.api = api;
        self
    }
}

/// `$XDG_CONFIG_HOME/revChatGPT`, else `$HOME/.config/revChatGPT`.
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    env_string_opt("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .map(|base| base.join(CONFIG_DIR_NAME))
}

/// Config file candidates, in lookup order.
#[must_use]
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(xdg) = env_string_opt("XDG_CONFIG_HOME") {
        paths.push(
            PathBuf::from(xdg)
                .join(CONFIG_DIR_NAME)
                .join(CONFIG_FILE_NAME),
        );
    }
    if let Some(home) = dirs::home_dir() {
        paths.push(
            home.join(".config")
                .join(CONFIG_DIR_NAME)
                .join(CONFIG_FILE_NAME),
        );
    }
    paths.push(PathBuf::from(CONFIG_FILE_NAME));
    paths.dedup();
    paths
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn env_string_opt(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        if value.trim().is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    struct EnvGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.previous {
                env::set_var(self.key, value);
            } else {
                env::remove_var(self.key);
            }
        }
    }

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .expect("env lock poisoned")
    }

    fn set_env_guard(key: &'static str, value: Option<&str>) -> EnvGuard {
        let previous = env::var(key).ok();
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
        EnvGuard { key, previous }
    }

    fn parse(raw: &str) -> Result<ClientConfig, ConfigError> {
        ClientConfig::from_json(raw, Path::new("config.json"))
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let _lock = env_lock();
        let _base = set_env_guard(BASE_URL_ENV, None);

        let config = parse(r#"{"access_token":"tok"}"#).expect("config");
        let settings = config.settings();

        assert_eq!(settings.model, DEFAULT_MODEL);
        assert_eq!(settings.history_cap, DEFAULT_HISTORY_CAP);
        assert_eq!(settings.delta_mode, DeltaMode::Cumulative);
        assert_eq!(settings.request_timeout, Some(DEFAULT_TIMEOUT));
        assert!(!settings.auto_continue);
        assert_eq!(settings.api.base_url, chat_wire::DEFAULT_BASE_URL);
        assert_eq!(settings.api.timeout, Some(DEFAULT_TIMEOUT));
    }

    #[test]
    fn config_requires_a_credential() {
        assert!(matches!(
            parse(r#"{"model":"m"}"#),
            Err(ConfigError::MissingCredential)
        ));
        assert!(matches!(
            parse(r#"{"access_token":"  "}"#),
            Err(ConfigError::MissingCredential)
        ));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        assert!(matches!(
            parse(r#"{"access_token":"t","timeout_sec":0}"#),
            Err(ConfigError::InvalidTimeout {
                field: "timeout_sec"
            })
        ));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            parse(r#"{"access_token":"t","plugin_ids":[]}"#),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn explicit_fields_flow_into_settings() {
        let _lock = env_lock();
        let _base = set_env_guard(BASE_URL_ENV, None);

        let config = parse(
            r#"{
                "session_token": "cookie",
                "base_url": "http://127.0.0.1:9/api",
                "model": "gpt-4",
                "proxy": "http://proxy:8080",
                "conversation_id": "c1",
                "parent_id": "m1",
                "disable_history": true,
                "history_cap": 4,
                "delta_mode": "incremental",
                "timeout_sec": 30,
                "auth_timeout_sec": 5,
                "auto_continue": true
            }"#,
        )
        .expect("config");
        let settings = config.settings();

        assert_eq!(settings.model, "gpt-4");
        assert_eq!(settings.history_cap, 4);
        assert_eq!(settings.delta_mode, DeltaMode::Incremental);
        assert_eq!(settings.request_timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.auth_timeout, Some(Duration::from_secs(5)));
        assert!(settings.disable_history);
        assert!(settings.auto_continue);
        assert_eq!(settings.conversation_id.as_deref(), Some("c1"));
        assert_eq!(settings.parent_id.as_deref(), Some("m1"));
        assert_eq!(settings.api.base_url, "http://127.0.0.1:9/api");
        assert_eq!(settings.api.proxy.as_deref(), Some("http://proxy:8080"));
    }

    #[test]
    fn base_url_env_overrides_file() {
        let _lock = env_lock();
        let _base = set_env_guard(BASE_URL_ENV, Some("http://override/api"));

        let config =
            parse(r#"{"access_token":"t","base_url":"http://file/api"}"#).expect("config");
        assert_eq!(config.settings().api.base_url, "http://override/api");
    }

    #[test]
    fn search_paths_prefer_xdg_then_home_then_cwd() {
        let _lock = env_lock();
        let _xdg = set_env_guard("XDG_CONFIG_HOME", Some("/xdg"));

        let paths = config_search_paths();
        assert_eq!(
            paths.first(),
            Some(&PathBuf::from("/xdg/revChatGPT/config.json"))
        );
        assert_eq!(paths.last(), Some(&PathBuf::from("config.json")));
        assert_eq!(
            default_config_dir(),
            Some(PathBuf::from("/xdg/revChatGPT"))
        );
    }

    #[test]
    fn load_reads_file_and_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        assert!(matches!(
            ClientConfig::load(&path),
            Err(ConfigError::Io { .. })
        ));

        std::fs::write(&path, r#"{"access_token":"t"}"#).expect("write");
        let config = ClientConfig::load(&path).expect("load");
        assert_eq!(config.access_token.as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn access_token_config_builds_static_authenticator() {
        let config = parse(r#"{"access_token":"tok"}"#).expect("config");
        let authenticator = config
            .authenticator(&SessionSettings::default(), None)
            .expect("authenticator");
        let credential = authenticator.login().await.expect("login");
        assert_eq!(credential.bearer_token, "tok");
    }
}
