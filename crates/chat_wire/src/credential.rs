use std::collections::BTreeMap;

use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use time::OffsetDateTime;

/// Authentication material attached to every request.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential {
    /// Bearer token; empty until the first successful authentication.
    pub bearer_token: String,
    /// Cookies sent alongside the bearer token, keyed by cookie name.
    pub transport_cookies: BTreeMap<String, String>,
    /// Local expiry. `None` means the credential is only invalidated by the
    /// remote rejecting it.
    pub expiry: Option<OffsetDateTime>,
}

impl Credential {
    /// Credential for a bearer token with no local expiry.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer_token: token.into(),
            ..Self::default()
        }
    }

    /// Credential for an access token, taking the expiry from the JWT `exp`
    /// claim when the token is a decodable JWT.
    #[must_use]
    pub fn from_access_token(token: impl Into<String>) -> Self {
        let token = token.into();
        let expiry = token_expiry(&token);
        Self {
            bearer_token: token,
            transport_cookies: BTreeMap::new(),
            expiry,
        }
    }

    #[must_use]
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.transport_cookies.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_expiry(mut self, expiry: OffsetDateTime) -> Self {
        self.expiry = Some(expiry);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bearer_token.trim().is_empty()
    }

    /// True once `now` has reached the local expiry.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expiry.is_some_and(|expiry| now >= expiry)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("bearer_token", &redact(&self.bearer_token))
            .field(
                "transport_cookies",
                &self.transport_cookies.keys().collect::<Vec<_>>(),
            )
            .field("expiry", &self.expiry)
            .finish()
    }
}

fn redact(token: &str) -> &'static str {
    if token.is_empty() {
        "<empty>"
    } else {
        "<redacted>"
    }
}

/// Reads the `exp` claim from a JWT access token.
pub fn token_expiry(token: &str) -> Option<OffsetDateTime> {
    let mut parts = token.trim().split('.');
    let _header = parts.next()?;
    let payload_segment = parts.next()?;
    let _signature = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let decoded = decode_jwt_segment(payload_segment)?;
    let claims = serde_json::from_slice::<TokenClaims>(&decoded).ok()?;
    OffsetDateTime::from_unix_timestamp(claims.exp?).ok()
}

fn decode_jwt_segment(segment: &str) -> Option<Vec<u8>> {
    general_purpose::URL_SAFE_NO_PAD
        .decode(segment)
        .or_else(|_| general_purpose::URL_SAFE.decode(segment))
        .ok()
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    exp: Option<i64>,
}
