//! Authenticators built on top of the wire-level contract.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chat_wire::{ApiError, Authenticator, Credential};
use session_store::TokenCache;
use tracing::{debug, warn};

/// A fixed bearer token. There is nothing to refresh it with, so a rejected
/// token is final.
#[derive(Debug, Clone)]
pub struct StaticTokenAuthenticator {
    credential: Credential,
}

impl StaticTokenAuthenticator {
    #[must_use]
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            credential: Credential::from_access_token(access_token),
        }
    }

    #[must_use]
    pub fn from_credential(credential: Credential) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn login(&self) -> Result<Credential, ApiError> {
        if self.credential.is_empty() {
            return Err(ApiError::MissingAccessToken);
        }
        Ok(self.credential.clone())
    }

    async fn refresh(&self, _existing: &Credential) -> Result<Credential, ApiError> {
        Err(ApiError::Auth(
            "static access token cannot be refreshed".to_owned(),
        ))
    }
}

/// Wraps an authenticator with the on-disk access-token cache, keyed by
/// account. `login` reuses a cached token that has not expired locally.
#[derive(Debug)]
pub struct CachedAuthenticator<A> {
    inner: A,
    account: String,
    cache: Mutex<TokenCache>,
}

impl<A: Authenticator> CachedAuthenticator<A> {
    pub fn new(inner: A, account: impl Into<String>, cache: TokenCache) -> Self {
        Self {
            inner,
            account: account.into(),
            cache: Mutex::new(cache),
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    fn cached(&self) -> Option<Credential> {
        let cache = lock_unpoisoned(&self.cache);
        let credential = Credential::from_access_token(cache.get(&self.account)?);
        if credential.is_expired() {
            debug!(account = %self.account, "cached access token expired");
            return None;
        }
        Some(credential)
    }

    fn store(&self, credential: &Credential) {
        let mut cache = lock_unpoisoned(&self.cache);
        cache.insert(self.account.clone(), credential.bearer_token.clone());
        // A cache that cannot be written only costs a login next run.
        if let Err(error) = cache.save() {
            warn!(%error, "failed to persist access token cache");
        }
    }
}

#[async_trait]
impl<A: Authenticator> Authenticator for CachedAuthenticator<A> {
    async fn login(&self) -> Result<Credential, ApiError> {
        if let Some(credential) = self.cached() {
            debug!(account = %self.account, "using cached access token");
            return Ok(credential);
        }

        let credential = self.inner.login().await?;
        self.store(&credential);
        Ok(credential)
    }

    async fn refresh(&self, existing: &Credential) -> Result<Credential, ApiError> {
        let credential = self.inner.refresh(existing).await?;
        self.store(&credential);
        Ok(credential)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
