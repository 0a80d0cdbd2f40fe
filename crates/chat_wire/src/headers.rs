use std::collections::BTreeMap;

use crate::config::ApiConfig;
use crate::credential::Credential;
use crate::error::ApiError;

pub const HEADER_ACCEPT: &str = "accept";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_USER_AGENT: &str = "user-agent";

/// Build a deterministic header map for conversation requests. Extra headers
/// may replace defaults such as `accept`, but never `authorization`.
pub fn build_headers(
    config: &ApiConfig,
    credential: &Credential,
) -> Result<BTreeMap<String, String>, ApiError> {
    if credential.is_empty() {
        return Err(ApiError::MissingAccessToken);
    }

    let mut headers = BTreeMap::new();
    headers.insert(
        HEADER_AUTHORIZATION.to_owned(),
        format!("Bearer {}", credential.bearer_token.trim()),
    );
    headers.insert(HEADER_ACCEPT.to_owned(), "text/event-stream".to_owned());
    headers.insert(
        HEADER_CONTENT_TYPE.to_owned(),
        "application/json".to_owned(),
    );
    headers.insert(HEADER_USER_AGENT.to_owned(), config.user_agent().to_owned());

    for (key, value) in &config.extra_headers {
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(ApiError::InvalidHeader("empty header name".to_owned()));
        }
        if key == HEADER_AUTHORIZATION {
            return Err(ApiError::InvalidHeader(format!(
                "{key} is set from the credential and cannot be overridden"
            )));
        }
        headers.insert(key, value.trim().to_owned());
    }

    Ok(headers)
}

/// Render cookies as a single `Cookie` header value, or `None` when empty.
pub fn cookie_header(cookies: &BTreeMap<String, String>) -> Option<String> {
    let rendered = cookies
        .iter()
        .filter(|(name, _)| !name.trim().is_empty())
        .map(|(name, value)| format!("{}={}", name.trim(), value.trim()))
        .collect::<Vec<_>>();

    if rendered.is_empty() {
        None
    } else {
        Some(rendered.join("; "))
    }
}
