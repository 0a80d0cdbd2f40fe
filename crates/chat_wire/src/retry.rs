use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// Credential refreshes allowed per turn. A rejected credential is refreshed
/// and the send retried at most this many times.
pub const AUTH_RETRY_LIMIT: u32 = 1;
/// Base delay suggested to callers after a rate-limit response.
pub const BASE_DELAY_MS: u64 = 1000;

fn rate_limit_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"(?i)too.?many.?requests|rate.?limit|usage.?limit|overloaded")
            .expect("rate limit regex must compile")
    })
}

fn concurrency_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"(?i)only one message at a time|concurrent.?(request|conversation)")
            .expect("concurrency regex must compile")
    })
}

/// Error text signalling the service is throttling this credential.
pub fn is_rate_limit_text(text: &str) -> bool {
    rate_limit_regex().is_match(text)
}

/// Error text signalling another turn is still in flight for this account.
pub fn is_concurrency_text(text: &str) -> bool {
    concurrency_regex().is_match(text)
}

/// Exponential backoff hint surfaced with rate-limit errors. The core never
/// sleeps on it; callers decide whether to wait and resend.
pub fn rate_limit_backoff(attempt: u32) -> Duration {
    let exponent = attempt.min(30);
    Duration::from_millis(BASE_DELAY_MS.saturating_mul(2u64.saturating_pow(exponent)))
}
