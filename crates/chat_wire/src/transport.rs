//! Collaborator contracts the session core is built against.
//!
//! Implementations own the actual I/O; the core only needs to send one
//! request, observe the status code, and read the body incrementally.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde_json::Value;

use crate::config::ApiConfig;
use crate::credential::Credential;
use crate::error::ApiError;
use crate::headers::build_headers;
use crate::payload::ConversationRequest;
use crate::url::conversation_url;

/// Response body delivered chunk by chunk.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, ApiError>>;

/// Fully resolved request handed to a [`Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub body: Value,
}

impl OutboundRequest {
    /// Builds the POST for one conversation turn.
    pub fn conversation(
        config: &ApiConfig,
        credential: &Credential,
        request: &ConversationRequest,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            url: conversation_url(&config.base_url),
            headers: build_headers(config, credential)?,
            cookies: credential.transport_cookies.clone(),
            body: serde_json::to_value(request)?,
        })
    }

    /// Decodes the body back into a conversation request.
    pub fn conversation_request(&self) -> Result<ConversationRequest, ApiError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Status plus streaming body of one transport exchange.
pub struct TransportResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: ByteStream,
}

impl TransportResponse {
    pub fn new(status: u16, body: ByteStream) -> Self {
        Self {
            status,
            retry_after: None,
            body,
        }
    }

    /// Response whose body is already fully known.
    pub fn from_bytes(status: u16, body: impl Into<Vec<u8>>) -> Self {
        let chunk: Result<Vec<u8>, ApiError> = Ok(body.into());
        Self::new(status, stream::iter(vec![chunk]).boxed())
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drains the body into a string.
    pub async fn into_text(mut self) -> Result<String, ApiError> {
        let mut collected = Vec::new();
        while let Some(chunk) = self.body.next().await {
            collected.extend_from_slice(&chunk?);
        }
        Ok(String::from_utf8_lossy(&collected).into_owned())
    }

    /// Converts a non-success response into its classified error.
    pub async fn into_error(self) -> ApiError {
        let status = self.status;
        let retry_after = self.retry_after;
        match self.into_text().await {
            Ok(body) => ApiError::from_status(status, &body, retry_after),
            Err(error) => error,
        }
    }
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("retry_after", &self.retry_after)
            .finish_non_exhaustive()
    }
}

/// Sends one request and streams its response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, ApiError>;
}

/// Resolves the current node of a remote conversation when resuming by id.
#[async_trait]
pub trait HistoryLookup: Send + Sync {
    async fn current_node(
        &self,
        conversation_id: &str,
        credential: &Credential,
    ) -> Result<String, ApiError>;
}
