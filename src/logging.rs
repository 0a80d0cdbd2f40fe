//! Diagnostic logging setup.
//!
//! The library only emits `tracing` events; embedding applications decide
//! whether to install a subscriber. [`init_from_env`] is a convenience for
//! binaries that want the default stderr formatter.

use tracing_subscriber::EnvFilter;

/// Filter directives, e.g. `REVCHAT_LOG=revchat=debug,chat_wire=trace`.
pub const LOG_ENV: &str = "REVCHAT_LOG";
pub const DEFAULT_DIRECTIVES: &str = "warn";

/// Builds the filter from [`LOG_ENV`], falling back to [`DEFAULT_DIRECTIVES`]
/// when the variable is unset or does not parse.
#[must_use]
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Installs a stderr subscriber. Returns `false` if one was already set.
pub fn init_from_env() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .is_ok()
}
