//! Deterministic in-memory collaborators for the conversation session.
//!
//! This crate contains no network code and is intended for contract-level
//! testing: every reply is scripted up front, and every request is recorded
//! for later inspection.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chat_wire::{
    ApiError, Authenticator, ByteStream, Credential, HistoryLookup, OutboundRequest, Transport,
    TransportResponse,
};
use futures_util::stream::{self, StreamExt};
use serde_json::json;

/// One scripted reply for [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Respond with `status` and stream `lines`, one line per chunk, waiting
    /// `delay` before each chunk.
    Lines {
        status: u16,
        lines: Vec<String>,
        delay: Duration,
        retry_after: Option<Duration>,
    },
    /// Stream `lines`, then fail the body with a transport error.
    BrokenBody { lines: Vec<String> },
    /// Respond 200 and never deliver a byte.
    Stall,
    /// Fail before any response is available.
    Unreachable(String),
}

impl ScriptedReply {
    pub fn ok(lines: Vec<String>) -> Self {
        Self::Lines {
            status: 200,
            lines,
            delay: Duration::ZERO,
            retry_after: None,
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Lines {
            status,
            lines: vec![body.into()],
            delay: Duration::ZERO,
            retry_after: None,
        }
    }

    pub fn slow(lines: Vec<String>, delay: Duration) -> Self {
        Self::Lines {
            status: 200,
            lines,
            delay,
            retry_after: None,
        }
    }

    #[must_use]
    pub fn with_retry_after(self, after: Duration) -> Self {
        match self {
            Self::Lines {
                status,
                lines,
                delay,
                ..
            } => Self::Lines {
                status,
                lines,
                delay,
                retry_after: Some(after),
            },
            other => other,
        }
    }
}

/// [`Transport`] replaying queued [`ScriptedReply`] values in order.
///
/// Unscripted sends answer 500 so a test never hangs on a missing script.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<OutboundRequest>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn push(&self, reply: ScriptedReply) {
        lock_unpoisoned(&self.replies).push_back(reply);
    }

    /// Every request sent so far, oldest first.
    pub fn requests(&self) -> Vec<OutboundRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    pub fn send_count(&self) -> usize {
        lock_unpoisoned(&self.requests).len()
    }

    /// Highest number of response bodies that were open at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::Acquire)
    }

    fn open_body(&self) -> InFlight {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_in_flight.fetch_max(now, Ordering::AcqRel);
        InFlight(Arc::clone(&self.in_flight))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, ApiError> {
        lock_unpoisoned(&self.requests).push(request);
        let reply = lock_unpoisoned(&self.replies)
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::status(500, r#"{"detail":"no scripted reply"}"#));

        match reply {
            ScriptedReply::Unreachable(message) => Err(ApiError::Transport(message)),
            ScriptedReply::Lines {
                status,
                lines,
                delay,
                retry_after,
            } => {
                let body = stream::iter(lines)
                    .then(move |line| async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        Ok(format!("{line}\n").into_bytes())
                    })
                    .boxed();
                Ok(
                    TransportResponse::new(status, guarded(body, self.open_body()))
                        .with_retry_after(retry_after),
                )
            }
            ScriptedReply::BrokenBody { lines } => {
                let mut chunks = lines
                    .into_iter()
                    .map(|line| Ok(format!("{line}\n").into_bytes()))
                    .collect::<Vec<_>>();
                chunks.push(Err(ApiError::Transport("connection reset".to_owned())));
                let body = stream::iter(chunks).boxed();
                Ok(TransportResponse::new(200, guarded(body, self.open_body())))
            }
            ScriptedReply::Stall => {
                let body = stream::pending().boxed();
                Ok(TransportResponse::new(200, guarded(body, self.open_body())))
            }
        }
    }
}

/// Keeps `guard` alive exactly as long as the body stream.
fn guarded(body: ByteStream, guard: InFlight) -> ByteStream {
    stream::unfold((body, guard), |(mut body, guard)| async move {
        let chunk = body.next().await?;
        Some((chunk, (body, guard)))
    })
    .boxed()
}

#[derive(Debug)]
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Scripted outcome of one [`ScriptedAuthenticator`] call.
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Grant(Credential),
    Reject(String),
    /// Never answers; exercises authenticator deadlines.
    Hang,
}

/// [`Authenticator`] replaying queued outcomes and counting calls.
///
/// An exhausted queue rejects.
#[derive(Debug, Default)]
pub struct ScriptedAuthenticator {
    logins: Mutex<VecDeque<AuthOutcome>>,
    refreshes: Mutex<VecDeque<AuthOutcome>>,
    login_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl ScriptedAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_login(self, outcome: AuthOutcome) -> Self {
        lock_unpoisoned(&self.logins).push_back(outcome);
        self
    }

    #[must_use]
    pub fn with_refresh(self, outcome: AuthOutcome) -> Self {
        lock_unpoisoned(&self.refreshes).push_back(outcome);
        self
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::Acquire)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::Acquire)
    }

    /// Total authenticator round trips.
    pub fn calls(&self) -> usize {
        self.login_calls() + self.refresh_calls()
    }

    async fn resolve(outcome: Option<AuthOutcome>) -> Result<Credential, ApiError> {
        match outcome {
            Some(AuthOutcome::Grant(credential)) => Ok(credential),
            Some(AuthOutcome::Reject(message)) => Err(ApiError::Auth(message)),
            Some(AuthOutcome::Hang) => {
                futures_util::future::pending::<()>().await;
                Err(ApiError::Auth("unreachable".to_owned()))
            }
            None => Err(ApiError::Auth("no scripted credential".to_owned())),
        }
    }
}

#[async_trait]
impl Authenticator for ScriptedAuthenticator {
    async fn login(&self) -> Result<Credential, ApiError> {
        self.login_calls.fetch_add(1, Ordering::AcqRel);
        let outcome = lock_unpoisoned(&self.logins).pop_front();
        Self::resolve(outcome).await
    }

    async fn refresh(&self, _existing: &Credential) -> Result<Credential, ApiError> {
        self.refresh_calls.fetch_add(1, Ordering::AcqRel);
        let outcome = lock_unpoisoned(&self.refreshes).pop_front();
        Self::resolve(outcome).await
    }
}

/// [`HistoryLookup`] answering from a fixed conversation → node table.
#[derive(Debug, Default)]
pub struct FixedLookup {
    nodes: BTreeMap<String, String>,
    calls: AtomicUsize,
}

impl FixedLookup {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_node(mut self, conversation_id: &str, node: &str) -> Self {
        self.nodes
            .insert(conversation_id.to_owned(), node.to_owned());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl HistoryLookup for FixedLookup {
    async fn current_node(
        &self,
        conversation_id: &str,
        _credential: &Credential,
    ) -> Result<String, ApiError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        self.nodes.get(conversation_id).cloned().ok_or_else(|| {
            ApiError::from_status(404, r#"{"detail":"conversation not found"}"#, None)
        })
    }
}

/// One assistant record line as the conversation endpoint streams it.
pub fn assistant_line(conversation_id: &str, message_id: &str, text: &str) -> String {
    let record = json!({
        "message": {
            "id": message_id,
            "author": {"role": "assistant"},
            "content": {"content_type": "text", "parts": [text]},
            "end_turn": null,
        },
        "conversation_id": conversation_id,
        "error": null,
    });
    format!("data: {record}")
}

/// Final assistant record of a reply that stopped for `finish`
/// (`stop`, `max_tokens`).
pub fn finished_line(conversation_id: &str, message_id: &str, text: &str, finish: &str) -> String {
    let record = json!({
        "message": {
            "id": message_id,
            "author": {"role": "assistant"},
            "content": {"content_type": "text", "parts": [text]},
            "end_turn": finish != "max_tokens",
            "metadata": {"finish_details": {"type": finish}},
        },
        "conversation_id": conversation_id,
        "error": null,
    });
    format!("data: {record}")
}

pub fn done_line() -> String {
    "data: [DONE]".to_owned()
}

/// Error record carried inside an otherwise successful stream.
pub fn detail_line(detail: &str) -> String {
    format!("data: {}", json!({ "detail": detail }))
}

/// Cumulative reply stream: one line per prefix in `prefixes`, then `[DONE]`.
pub fn reply_lines(conversation_id: &str, message_id: &str, prefixes: &[&str]) -> Vec<String> {
    prefixes
        .iter()
        .map(|text| assistant_line(conversation_id, message_id, text))
        .chain(std::iter::once(done_line()))
        .collect()
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use chat_wire::{StreamDecoder, StreamEvent};
    use futures_util::StreamExt;

    use super::*;

    fn request() -> OutboundRequest {
        OutboundRequest {
            url: "http://mock/conversation".to_owned(),
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            body: json!({}),
        }
    }

    #[tokio::test]
    async fn scripted_lines_decode_into_reply_events() {
        let transport = ScriptedTransport::new([ScriptedReply::ok(reply_lines(
            "c1",
            "m1",
            &["He", "Hello"],
        ))]);

        let response = transport.send(request()).await.expect("scripted reply");
        let text = response.into_text().await.expect("body");
        let events = StreamDecoder::decode_str(&text);

        assert_eq!(events.len(), 3);
        assert_eq!(events.last(), Some(&StreamEvent::Done));
        assert_eq!(transport.send_count(), 1);
    }

    #[tokio::test]
    async fn unscripted_sends_answer_server_error() {
        let transport = ScriptedTransport::default();
        let response = transport.send(request()).await.expect("fallback reply");
        assert_eq!(response.status, 500);
    }

    #[tokio::test]
    async fn in_flight_counter_tracks_open_bodies() {
        let transport =
            ScriptedTransport::new([ScriptedReply::ok(vec![done_line()]), ScriptedReply::Stall]);

        let first = transport.send(request()).await.expect("first");
        let second = transport.send(request()).await.expect("second");
        assert_eq!(transport.max_in_flight(), 2);

        drop(second);
        let mut body = first.body;
        while body.next().await.is_some() {}
        drop(body);

        let third = transport.send(request()).await.expect("third");
        drop(third);
        assert_eq!(transport.max_in_flight(), 2);
    }

    #[tokio::test]
    async fn authenticator_replays_outcomes_and_counts_calls() {
        let authenticator = ScriptedAuthenticator::new()
            .with_login(AuthOutcome::Grant(Credential::bearer("a")))
            .with_refresh(AuthOutcome::Reject("denied".to_owned()));

        let credential = authenticator.login().await.expect("login");
        assert_eq!(credential.bearer_token, "a");
        assert!(authenticator.refresh(&credential).await.is_err());
        assert!(authenticator.login().await.is_err());
        assert_eq!(authenticator.calls(), 3);
    }

    #[tokio::test]
    async fn fixed_lookup_misses_with_not_found() {
        let lookup = FixedLookup::new().with_node("c1", "n1");
        let credential = Credential::bearer("t");
        assert_eq!(
            lookup.current_node("c1", &credential).await.expect("hit"),
            "n1"
        );
        assert!(lookup.current_node("c2", &credential).await.is_err());
        assert_eq!(lookup.calls(), 2);
    }
}
