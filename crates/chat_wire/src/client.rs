use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE, RETRY_AFTER};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::config::ApiConfig;
use crate::credential::Credential;
use crate::error::ApiError;
use crate::headers::{build_headers, cookie_header};
use crate::transport::{HistoryLookup, OutboundRequest, Transport, TransportResponse};
use crate::url::conversation_history_url;

/// reqwest-backed [`Transport`] and [`HistoryLookup`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: Client,
    config: ApiConfig,
}

impl HttpTransport {
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(proxy) = config.proxy.as_deref() {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let http = builder.build().map_err(ApiError::from)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn build_request(
        &self,
        request: &OutboundRequest,
    ) -> Result<reqwest::RequestBuilder, ApiError> {
        let mut headers = header_map(&request.headers)?;
        if let Some(cookies) = cookie_header(&request.cookies) {
            headers.insert(
                COOKIE,
                HeaderValue::from_str(&cookies)
                    .map_err(|_| ApiError::InvalidHeader("invalid cookie value".to_owned()))?,
            );
        }

        Ok(self
            .http
            .post(&request.url)
            .headers(headers)
            .json(&request.body))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, ApiError> {
        debug!(url = %request.url, "sending conversation request");
        let response = self.build_request(&request)?.send().await?;
        let status = response.status().as_u16();
        let retry_after = retry_after(response.headers());
        debug!(status, "conversation response received");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ApiError::from))
            .boxed();

        Ok(TransportResponse::new(status, body).with_retry_after(retry_after))
    }
}

#[async_trait]
impl HistoryLookup for HttpTransport {
    async fn current_node(
        &self,
        conversation_id: &str,
        credential: &Credential,
    ) -> Result<String, ApiError> {
        let url = conversation_history_url(&self.config.base_url, conversation_id);
        let mut headers = header_map(&build_headers(&self.config, credential)?)?;
        if let Some(cookies) = cookie_header(&credential.transport_cookies) {
            if let Ok(value) = HeaderValue::from_str(&cookies) {
                headers.insert(COOKIE, value);
            }
        }

        debug!(%url, "looking up conversation current node");
        let response = self.http.get(&url).headers(headers).send().await?;
        let status = response.status().as_u16();
        let retry_after = retry_after(response.headers());
        let body = response.text().await?;
        if !(200..300).contains(&status) {
            return Err(ApiError::from_status(status, &body, retry_after));
        }

        let history = serde_json::from_str::<Value>(&body)?;
        history
            .get("current_node")
            .and_then(Value::as_str)
            .filter(|node| !node.is_empty())
            .map(ToOwned::to_owned)
            .ok_or_else(|| {
                ApiError::MalformedResponse("conversation history has no current_node".to_owned())
            })
    }
}

fn header_map(
    headers: &std::collections::BTreeMap<String, String>,
) -> Result<HeaderMap, ApiError> {
    let mut out = HeaderMap::new();
    for (key, value) in headers {
        out.insert(
            HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| ApiError::InvalidHeader(format!("invalid header key: {key}")))?,
            HeaderValue::from_str(value)
                .map_err(|_| ApiError::InvalidHeader(format!("invalid header value for {key}")))?,
        );
    }
    Ok(out)
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
