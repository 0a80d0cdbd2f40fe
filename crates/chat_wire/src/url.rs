/// Default base URL for conversation requests.
pub const DEFAULT_BASE_URL: &str = "https://chat.openai.com/backend-api";

const CONVERSATION_SEGMENT: &str = "/conversation";

/// Normalize a base URL to the conversation endpoint.
///
/// Normalization rules:
/// 1) blank input falls back to [`DEFAULT_BASE_URL`]
/// 2) keep a URL already ending in `/conversation` unchanged
/// 3) append `/conversation` otherwise
pub fn conversation_url(input: &str) -> String {
    let trimmed = base_url(input);
    if trimmed.ends_with(CONVERSATION_SEGMENT) {
        return trimmed.to_owned();
    }
    format!("{trimmed}{CONVERSATION_SEGMENT}")
}

/// URL of one conversation's stored history.
pub fn conversation_history_url(input: &str, conversation_id: &str) -> String {
    format!("{}/{}", conversation_url(input), conversation_id.trim())
}

fn base_url(input: &str) -> &str {
    let base = if input.trim().is_empty() {
        DEFAULT_BASE_URL
    } else {
        input.trim()
    };
    base.trim_end_matches('/')
}
