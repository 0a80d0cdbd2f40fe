//! Credential lifecycle: keeps one session's credential valid with a bounded
//! number of authenticator round trips.

use std::time::Duration;

use chat_wire::retry::AUTH_RETRY_LIMIT;
use chat_wire::{ApiError, Authenticator, Credential};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    Unauthenticated,
    Authenticated,
    Refreshing,
    Failed,
}

impl CredentialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticated => "authenticated",
            Self::Refreshing => "refreshing",
            Self::Failed => "failed",
        }
    }
}

/// Refresh attempts left for one turn. Threaded through the orchestrator so a
/// rejected credential is refreshed a bounded number of times, never
/// recursively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    remaining: u32,
}

impl RetryBudget {
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self { remaining: limit }
    }

    /// Budget for one `ask`: a single immediate refresh.
    #[must_use]
    pub fn per_turn() -> Self {
        Self::new(AUTH_RETRY_LIMIT)
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    fn try_spend(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::per_turn()
    }
}

#[derive(Debug, Clone)]
pub struct CredentialLifecycle {
    state: CredentialState,
    credential: Credential,
}

impl Default for CredentialLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialLifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: CredentialState::Unauthenticated,
            credential: Credential::default(),
        }
    }

    /// Starts from an already issued credential.
    #[must_use]
    pub fn with_credential(credential: Credential) -> Self {
        let state = if credential.is_empty() {
            CredentialState::Unauthenticated
        } else {
            CredentialState::Authenticated
        };
        Self { state, credential }
    }

    #[must_use]
    pub fn state(&self) -> CredentialState {
        self.state
    }

    #[must_use]
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Returns a usable credential, calling the authenticator at most once:
    /// `login` when nothing was ever issued, otherwise `refresh`, which draws
    /// on `budget`.
    pub async fn ensure_valid(
        &mut self,
        authenticator: &dyn Authenticator,
        budget: &mut RetryBudget,
        timeout: Option<Duration>,
    ) -> Result<Credential, SessionError> {
        self.ensure_valid_at(authenticator, budget, timeout, OffsetDateTime::now_utc())
            .await
    }

    pub async fn ensure_valid_at(
        &mut self,
        authenticator: &dyn Authenticator,
        budget: &mut RetryBudget,
        timeout: Option<Duration>,
        now: OffsetDateTime,
    ) -> Result<Credential, SessionError> {
        if self.state == CredentialState::Authenticated {
            if !self.credential.is_expired_at(now) {
                return Ok(self.credential.clone());
            }
            debug!("credential expired locally; refreshing");
            self.state = CredentialState::Refreshing;
        }

        if self.state == CredentialState::Unauthenticated || self.credential.is_empty() {
            info!("logging in");
            let outcome = with_deadline(authenticator.login(), timeout, "login").await;
            return self.settle(outcome);
        }

        if !budget.try_spend() {
            self.state = CredentialState::Failed;
            return Err(SessionError::Authentication(
                "credential rejected and the refresh budget is exhausted".to_owned(),
            ));
        }

        self.state = CredentialState::Refreshing;
        info!("refreshing credential");
        let outcome =
            with_deadline(authenticator.refresh(&self.credential), timeout, "refresh").await;
        self.settle(outcome)
    }

    /// Forces a refresh on the next `ensure_valid`; the remote rejecting a
    /// credential overrides any local expiry.
    pub fn invalidate(&mut self) {
        if self.state != CredentialState::Unauthenticated {
            warn!("credential rejected by remote");
            self.expire();
        }
    }

    /// Marks the credential stale so the next `ensure_valid` refreshes it.
    pub fn expire(&mut self) {
        if self.state != CredentialState::Unauthenticated {
            self.state = CredentialState::Refreshing;
        }
    }

    /// Gives up on the current credential after the remote rejected it with no
    /// refresh left. The next turn starts over with a fresh budget.
    pub fn fail(&mut self) {
        self.state = CredentialState::Failed;
    }

    /// Installs a credential obtained outside the lifecycle.
    pub fn replace(&mut self, credential: Credential) {
        *self = Self::with_credential(credential);
    }

    fn settle(
        &mut self,
        outcome: Result<Credential, ApiError>,
    ) -> Result<Credential, SessionError> {
        match outcome {
            Ok(credential) if credential.is_empty() => {
                self.state = CredentialState::Failed;
                Err(SessionError::Authentication(
                    "authenticator returned an empty credential".to_owned(),
                ))
            }
            Ok(credential) => {
                self.credential = credential.clone();
                self.state = CredentialState::Authenticated;
                debug!(expiry = ?credential.expiry, "credential issued");
                Ok(credential)
            }
            Err(error) if error.is_network() => {
                warn!(%error, "authenticator unreachable");
                Err(SessionError::Network(error.to_string()))
            }
            Err(error) => {
                warn!(%error, "authentication failed");
                self.state = CredentialState::Failed;
                Err(SessionError::Authentication(error.to_string()))
            }
        }
    }
}

async fn with_deadline<F>(
    call: F,
    timeout: Option<Duration>,
    operation: &'static str,
) -> Result<Credential, ApiError>
where
    F: std::future::Future<Output = Result<Credential, ApiError>>,
{
    match timeout {
        Some(after) => tokio::time::timeout(after, call)
            .await
            .map_err(|_| ApiError::Timeout { operation, after })?,
        None => call.await,
    }
}
