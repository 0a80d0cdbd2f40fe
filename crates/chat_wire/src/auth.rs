use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use reqwest::header::{COOKIE, SET_COOKIE, USER_AGENT};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::config::ApiConfig;
use crate::credential::Credential;
use crate::error::ApiError;

/// Cookie carrying the long-lived web session.
pub const SESSION_COOKIE_NAME: &str = "__Secure-next-auth.session-token";

/// Produces and renews credentials on behalf of a session.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Obtains a credential from scratch.
    async fn login(&self) -> Result<Credential, ApiError>;

    /// Renews `existing`. Authenticators without a refresh capability fail.
    async fn refresh(&self, existing: &Credential) -> Result<Credential, ApiError>;
}

/// Exchanges a stored web-session cookie for a bearer token.
///
/// The session endpoint answers with `{"accessToken": ...}` and may rotate
/// the cookie through `Set-Cookie`; the rotated value is kept for the next
/// exchange.
#[derive(Debug)]
pub struct SessionCookieAuthenticator {
    http: Client,
    session_url: String,
    cookie_name: String,
    user_agent: String,
    session_token: Mutex<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_token: Option<String>,
    error: Option<serde_json::Value>,
}

impl SessionCookieAuthenticator {
    pub fn new(
        config: &ApiConfig,
        session_url: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Result<Self, ApiError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(proxy) = config.proxy.as_deref() {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            http: builder.build()?,
            session_url: session_url.into(),
            cookie_name: SESSION_COOKIE_NAME.to_owned(),
            user_agent: config.user_agent().to_owned(),
            session_token: Mutex::new(session_token.into()),
        })
    }

    pub fn with_cookie_name(mut self, cookie_name: impl Into<String>) -> Self {
        self.cookie_name = cookie_name.into();
        self
    }

    pub fn session_token(&self) -> String {
        lock_unpoisoned(&self.session_token).clone()
    }

    async fn exchange(&self, session_token: String) -> Result<Credential, ApiError> {
        if session_token.trim().is_empty() {
            return Err(ApiError::Auth("no session cookie available".to_owned()));
        }

        debug!(url = %self.session_url, "exchanging session cookie for access token");
        let response = self
            .http
            .get(&self.session_url)
            .header(USER_AGENT, &self.user_agent)
            .header(COOKIE, format!("{}={}", self.cookie_name, session_token.trim()))
            .send()
            .await?;

        let status = response.status().as_u16();
        let rotated = rotated_cookie(response.headers(), &self.cookie_name);
        let body = response.text().await?;
        if !(200..300).contains(&status) {
            return Err(ApiError::from_status(status, &body, None));
        }

        let parsed = serde_json::from_str::<SessionResponse>(&body)?;
        if let Some(error) = parsed.error.filter(|error| !error.is_null()) {
            return Err(ApiError::Auth(format!("session endpoint rejected cookie: {error}")));
        }
        let access_token = parsed
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| ApiError::Auth("session response carried no accessToken".to_owned()))?;

        let session_token = rotated.unwrap_or(session_token);
        *lock_unpoisoned(&self.session_token) = session_token.clone();

        Ok(Credential::from_access_token(access_token).with_cookie(&self.cookie_name, session_token))
    }
}

#[async_trait]
impl Authenticator for SessionCookieAuthenticator {
    async fn login(&self) -> Result<Credential, ApiError> {
        self.exchange(self.session_token()).await
    }

    async fn refresh(&self, existing: &Credential) -> Result<Credential, ApiError> {
        let token = existing
            .transport_cookies
            .get(&self.cookie_name)
            .cloned()
            .unwrap_or_else(|| self.session_token());
        self.exchange(token).await
    }
}

fn rotated_cookie(headers: &reqwest::header::HeaderMap, cookie_name: &str) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| parse_set_cookie(value, cookie_name))
}

/// Extracts the value of `cookie_name` from one `Set-Cookie` header value.
pub fn parse_set_cookie(header: &str, cookie_name: &str) -> Option<String> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    if name.trim() != cookie_name {
        return None;
    }
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
