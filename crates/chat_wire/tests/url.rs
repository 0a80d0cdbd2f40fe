use chat_wire::url::{conversation_history_url, conversation_url, DEFAULT_BASE_URL};

#[test]
fn conversation_url_appends_endpoint_to_base() {
    assert_eq!(
        conversation_url("https://example.test/backend-api/"),
        "https://example.test/backend-api/conversation"
    );
}

#[test]
fn conversation_url_keeps_existing_endpoint() {
    assert_eq!(
        conversation_url("https://example.test/api/conversation"),
        "https://example.test/api/conversation"
    );
}

#[test]
fn blank_base_falls_back_to_default() {
    assert_eq!(
        conversation_url("  "),
        format!("{DEFAULT_BASE_URL}/conversation")
    );
}

#[test]
fn history_url_targets_one_conversation() {
    assert_eq!(
        conversation_history_url("http://127.0.0.1:9", " c-1 "),
        "http://127.0.0.1:9/conversation/c-1"
    );
}
