use chat_wire::retry::*;

#[test]
fn rate_limit_text_is_recognised() {
    assert!(is_rate_limit_text("Too many requests in 1 hour"));
    assert!(is_rate_limit_text("rate limit exceeded"));
    assert!(is_rate_limit_text("The server is overloaded"));
    assert!(!is_rate_limit_text("conversation not found"));
}

#[test]
fn concurrency_text_is_recognised() {
    assert!(is_concurrency_text("Only one message at a time."));
    assert!(!is_concurrency_text("Too many requests"));
}

#[test]
fn backoff_hint_is_exponential() {
    assert_eq!(rate_limit_backoff(0).as_millis(), 1000);
    assert_eq!(rate_limit_backoff(1).as_millis(), 2000);
    assert_eq!(rate_limit_backoff(2).as_millis(), 4000);
}

#[test]
fn auth_retry_limit_allows_a_single_refresh() {
    assert_eq!(AUTH_RETRY_LIMIT, 1);
}
