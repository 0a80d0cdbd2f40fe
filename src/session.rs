//! Conversation session orchestrator.
//!
//! A [`ConversationSession`] owns one conversation graph and one credential
//! lifecycle behind a single async mutex. A turn holds that lock from
//! preparation until its event stream finishes or is dropped, so turns on
//! the same session never interleave.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chat_wire::error::is_auth_failure_status;
use chat_wire::{
    ApiError, Authenticator, ByteStream, ConversationRequest, Credential, HistoryLookup,
    OutboundRequest, StreamDecoder, StreamErrorKind, StreamEvent, Transport, TransportResponse,
    Turn,
};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::SessionSettings;
use crate::credential::{CredentialLifecycle, CredentialState, RetryBudget};
use crate::error::SessionError;
use crate::graph::{ConversationGraph, Pointer, PreparedTurn};
use crate::reply::{DeltaMode, Reply, ReplyBuffer};

/// Lazy event sequence of one turn. Yields every `Delta`, then `Done`; an
/// `Err` ends the sequence.
pub type TurnStream = BoxStream<'static, Result<StreamEvent, SessionError>>;

/// Per-turn overrides of the conversation pointer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AskOptions {
    pub conversation_id: Option<String>,
    pub parent_id: Option<String>,
    /// Id for the user message; generated when absent.
    pub message_id: Option<String>,
}

impl AskOptions {
    #[must_use]
    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

struct SessionCore {
    graph: ConversationGraph,
    lifecycle: CredentialLifecycle,
}

#[derive(Clone)]
struct Collaborators {
    transport: Arc<dyn Transport>,
    authenticator: Arc<dyn Authenticator>,
    lookup: Option<Arc<dyn HistoryLookup>>,
    settings: Arc<SessionSettings>,
}

/// One conversation against the remote service.
///
/// Accessors wait for the session lock; calling one while holding an
/// unfinished [`TurnStream`] of the same session waits until that stream is
/// finished or dropped.
#[derive(Clone)]
pub struct ConversationSession {
    core: Arc<Mutex<SessionCore>>,
    collaborators: Collaborators,
}

impl ConversationSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        authenticator: Arc<dyn Authenticator>,
        settings: SessionSettings,
    ) -> Self {
        let graph = ConversationGraph::resume(
            settings.history_cap,
            settings.conversation_id.clone(),
            settings.parent_id.clone(),
        );
        Self {
            core: Arc::new(Mutex::new(SessionCore {
                graph,
                lifecycle: CredentialLifecycle::new(),
            })),
            collaborators: Collaborators {
                transport,
                authenticator,
                lookup: None,
                settings: Arc::new(settings),
            },
        }
    }

    /// Resolves unmapped conversations through `lookup` when resuming by id.
    #[must_use]
    pub fn with_history_lookup(mut self, lookup: Arc<dyn HistoryLookup>) -> Self {
        self.collaborators.lookup = Some(lookup);
        self
    }

    /// Installs an already issued credential so the next turn skips login.
    pub async fn set_credential(&self, credential: Credential) {
        self.core.lock().await.lifecycle.replace(credential);
    }

    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.collaborators.settings
    }

    /// Sends `prompt` as a new user turn and streams the reply. With
    /// `auto_continue` set, a reply cut off by the token limit is followed by
    /// one `continue` within the same stream.
    pub fn ask_stream(&self, prompt: impl Into<String>, options: AskOptions) -> TurnStream {
        let turn = match &options.message_id {
            Some(id) => Turn::user_with_id(id.clone(), prompt),
            None => Turn::user(prompt),
        };
        self.turn_stream(TurnKind::Ask(turn), options)
    }

    /// Sends `prompt` and waits for the complete reply.
    pub async fn ask(
        &self,
        prompt: impl Into<String>,
        options: AskOptions,
    ) -> Result<Reply, SessionError> {
        self.collect(self.ask_stream(prompt, options)).await
    }

    /// Asks the remote to continue its last reply on the current branch.
    pub fn continue_stream(&self, options: AskOptions) -> TurnStream {
        self.turn_stream(TurnKind::Continue, options)
    }

    /// Resolved form of [`Self::continue_stream`].
    pub async fn continue_reply(&self, options: AskOptions) -> Result<Reply, SessionError> {
        self.collect(self.continue_stream(options)).await
    }

    /// Replaces the graph with a pointer persisted by an earlier run. The
    /// undo history starts empty.
    pub async fn resume(&self, conversation_id: impl Into<String>, parent_id: impl Into<String>) {
        let mut core = self.core.lock().await;
        let cap = core.graph.history_cap();
        core.graph = ConversationGraph::resume(
            cap,
            Some(conversation_id.into()),
            Some(parent_id.into()),
        );
    }

    pub async fn conversation_id(&self) -> Option<String> {
        self.core
            .lock()
            .await
            .graph
            .conversation_id()
            .map(ToOwned::to_owned)
    }

    pub async fn parent_id(&self) -> Option<String> {
        self.core
            .lock()
            .await
            .graph
            .parent_id()
            .map(ToOwned::to_owned)
    }

    pub async fn pointer(&self) -> Pointer {
        self.core.lock().await.graph.pointer()
    }

    pub async fn history_depth(&self) -> usize {
        self.core.lock().await.graph.history_depth()
    }

    pub async fn credential_state(&self) -> CredentialState {
        self.core.lock().await.lifecycle.state()
    }

    pub async fn rollback(&self, n: usize) -> Result<(), SessionError> {
        self.core.lock().await.graph.rollback(n)
    }

    pub async fn reset(&self) {
        self.core.lock().await.graph.reset();
    }

    /// Refreshes the credential ahead of expiry. Takes the same lock as a
    /// turn, so it never races one.
    pub async fn refresh_credential(&self) -> Result<(), SessionError> {
        let mut core = self.core.lock().await;
        core.lifecycle.expire();
        core.lifecycle
            .ensure_valid(
                self.collaborators.authenticator.as_ref(),
                &mut RetryBudget::per_turn(),
                self.collaborators.settings.auth_timeout,
            )
            .await
            .map(|_| ())
    }

    fn turn_stream(&self, kind: TurnKind, options: AskOptions) -> TurnStream {
        let plan = TurnPlan {
            core: Arc::clone(&self.core),
            collaborators: self.collaborators.clone(),
            kind,
            options,
        };
        stream::unfold(TurnState::Start(Box::new(plan)), |state| async move {
            match state {
                TurnState::Start(plan) => match TurnPlan::start(*plan).await {
                    Ok(active) => Some(active.step().await),
                    Err(error) => Some((Err(error), TurnState::Finished)),
                },
                TurnState::Streaming(active) => Some(active.step().await),
                TurnState::Finished => None,
            }
        })
        .boxed()
    }

    async fn collect(&self, mut events: TurnStream) -> Result<Reply, SessionError> {
        let mut buffer = ReplyBuffer::new(self.collaborators.settings.delta_mode);
        let mut ids = None;
        let mut finish = None;
        while let Some(event) = events.next().await {
            match event? {
                StreamEvent::Delta {
                    text,
                    conversation_id,
                    message_id,
                    finish_details,
                    ..
                } => {
                    buffer.push(&text);
                    ids = Some((conversation_id, message_id));
                    finish = finish_details;
                }
                StreamEvent::Done => break,
                StreamEvent::Error { kind, detail } => {
                    return Err(SessionError::from_stream(kind, detail));
                }
            }
        }

        let (conversation_id, message_id) = ids.ok_or_else(|| {
            SessionError::Server("response finished without an assistant reply".to_owned())
        })?;
        Ok(Reply {
            text: buffer.into_text(),
            conversation_id,
            message_id,
            finish_details: finish,
        })
    }
}

enum TurnKind {
    Ask(Turn),
    Continue,
}

enum TurnState {
    Start(Box<TurnPlan>),
    Streaming(Box<ActiveTurn>),
    Finished,
}

struct TurnPlan {
    core: Arc<Mutex<SessionCore>>,
    collaborators: Collaborators,
    kind: TurnKind,
    options: AskOptions,
}

impl TurnPlan {
    /// Takes the session lock, prepares the turn and opens its response.
    async fn start(self) -> Result<Box<ActiveTurn>, SessionError> {
        let Self {
            core,
            collaborators,
            kind,
            options,
        } = self;
        let settings = Arc::clone(&collaborators.settings);
        let mut core = core.lock_owned().await;
        let mut budget = RetryBudget::per_turn();

        let mut credential = core
            .lifecycle
            .ensure_valid(
                collaborators.authenticator.as_ref(),
                &mut budget,
                settings.auth_timeout,
            )
            .await?;

        let pending = core
            .graph
            .pending_lookup(options.conversation_id.as_deref(), options.parent_id.as_deref());
        if let Some(conversation_id) = pending {
            resolve_current_node(
                &mut core.graph,
                collaborators.lookup.as_deref(),
                &conversation_id,
                &credential,
                settings.request_timeout,
            )
            .await;
        }

        let auto_continue = settings.auto_continue && matches!(kind, TurnKind::Ask(_));
        let prepared = match kind {
            TurnKind::Ask(turn) => core.graph.prepare_turn(
                turn,
                options.conversation_id.as_deref(),
                options.parent_id.as_deref(),
            )?,
            TurnKind::Continue => core.graph.prepare_continue(
                options.conversation_id.as_deref(),
                options.parent_id.as_deref(),
            )?,
        };
        let body = open_response(
            &mut core,
            &collaborators,
            &mut budget,
            &mut credential,
            &prepared,
        )
        .await?;

        Ok(Box::new(ActiveTurn {
            core,
            collaborators,
            budget,
            credential,
            body,
            decoder: StreamDecoder::default(),
            queued: VecDeque::new(),
            read_timeout: settings.request_timeout,
            saw_delta: false,
            body_finished: false,
            auto_continue,
            truncated: false,
            last_text: String::new(),
            prefix: None,
        }))
    }
}

/// A turn whose response body is being decoded. Holds the session lock until
/// dropped.
struct ActiveTurn {
    core: OwnedMutexGuard<SessionCore>,
    collaborators: Collaborators,
    budget: RetryBudget,
    credential: Credential,
    body: ByteStream,
    decoder: StreamDecoder,
    queued: VecDeque<StreamEvent>,
    read_timeout: Option<Duration>,
    saw_delta: bool,
    body_finished: bool,
    /// A `max_tokens` reply may still be continued once.
    auto_continue: bool,
    truncated: bool,
    last_text: String,
    /// Earlier reply text put in front of cumulative continuation deltas.
    prefix: Option<String>,
}

impl ActiveTurn {
    async fn step(mut self: Box<Self>) -> (Result<StreamEvent, SessionError>, TurnState) {
        loop {
            match self.next_event().await {
                Ok(event @ StreamEvent::Delta { .. }) => {
                    return (Ok(event), TurnState::Streaming(self));
                }
                Ok(StreamEvent::Error { kind, detail }) => {
                    if kind == StreamErrorKind::InvalidCredential {
                        self.core.lifecycle.invalidate();
                    }
                    return (
                        Err(SessionError::from_stream(kind, detail)),
                        TurnState::Finished,
                    );
                }
                Ok(StreamEvent::Done) if self.auto_continue && self.truncated => {
                    if let Err(error) = self.open_continuation().await {
                        return (Err(error), TurnState::Finished);
                    }
                }
                Ok(StreamEvent::Done) => return (Ok(StreamEvent::Done), TurnState::Finished),
                Err(error) => return (Err(error), TurnState::Finished),
            }
        }
    }

    /// Sends one `continue` for a reply cut off by the token limit, under the
    /// lock and refresh budget of the turn that produced it.
    async fn open_continuation(&mut self) -> Result<(), SessionError> {
        self.auto_continue = false;
        let prepared = self.core.graph.prepare_continuation()?;
        info!(parent_id = %prepared.parent_id, "reply hit the token limit; continuing");

        self.body = open_response(
            &mut self.core,
            &self.collaborators,
            &mut self.budget,
            &mut self.credential,
            &prepared,
        )
        .await?;
        self.decoder = StreamDecoder::default();
        self.queued.clear();
        self.saw_delta = false;
        self.body_finished = false;
        self.truncated = false;
        if self.collaborators.settings.delta_mode == DeltaMode::Cumulative {
            self.prefix = Some(self.last_text.trim_end_matches('\n').to_owned());
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Result<StreamEvent, SessionError> {
        loop {
            if let Some(mut event) = self.queued.pop_front() {
                if let StreamEvent::Delta {
                    text,
                    conversation_id,
                    message_id,
                    ..
                } = &mut event
                {
                    self.core.graph.apply(conversation_id, message_id);
                    self.saw_delta = true;
                    if let Some(prefix) = &self.prefix {
                        text.insert_str(0, prefix);
                    }
                    if self.auto_continue {
                        self.last_text.clone_from(text);
                    }
                }
                if matches!(event, StreamEvent::Delta { .. }) {
                    self.truncated = event.is_truncated();
                }
                return Ok(event);
            }

            if self.body_finished {
                if self.saw_delta {
                    debug!("response ended without a terminal line");
                    return Ok(StreamEvent::Done);
                }
                return Err(SessionError::Server(
                    "response ended without an assistant reply".to_owned(),
                ));
            }

            match self.read_chunk().await? {
                Some(chunk) => {
                    let events = self.decoder.feed(&chunk);
                    self.queued.extend(events);
                }
                None => {
                    let events = self.decoder.finish();
                    self.queued.extend(events);
                    self.body_finished = true;
                }
            }

            if self.decoder.is_finished() {
                self.body_finished = true;
            }
        }
    }

    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        let next = self.body.next();
        let chunk = match self.read_timeout {
            Some(after) => tokio::time::timeout(after, next)
                .await
                .map_err(|_| ApiError::Timeout {
                    operation: "read response",
                    after,
                })?,
            None => next.await,
        };
        Ok(chunk.transpose()?)
    }
}

/// Sends a prepared turn. A 401/403 invalidates the credential and retries
/// once with a refreshed one while `budget` allows; a second rejection marks
/// the credential failed.
async fn open_response(
    core: &mut SessionCore,
    collaborators: &Collaborators,
    budget: &mut RetryBudget,
    credential: &mut Credential,
    prepared: &PreparedTurn,
) -> Result<ByteStream, SessionError> {
    let settings = collaborators.settings.as_ref();
    let request = prepared.to_request(&settings.model, settings.disable_history);
    log_turn(prepared);

    loop {
        let response = send(
            collaborators.transport.as_ref(),
            settings,
            credential,
            &request,
        )
        .await?;
        debug!(status = response.status, "conversation response");

        if response.is_success() {
            return Ok(response.body);
        }

        if !is_auth_failure_status(response.status) {
            return Err(response.into_error().await.into());
        }

        let error = response.into_error().await;
        core.lifecycle.invalidate();
        if budget.is_exhausted() {
            core.lifecycle.fail();
            return Err(error.into());
        }
        *credential = core
            .lifecycle
            .ensure_valid(
                collaborators.authenticator.as_ref(),
                budget,
                settings.auth_timeout,
            )
            .await?;
        info!("retrying turn with refreshed credential");
    }
}

async fn send(
    transport: &dyn Transport,
    settings: &SessionSettings,
    credential: &Credential,
    request: &ConversationRequest,
) -> Result<TransportResponse, SessionError> {
    let outbound = OutboundRequest::conversation(&settings.api, credential, request)?;
    let response = match settings.request_timeout {
        Some(after) => tokio::time::timeout(after, transport.send(outbound))
            .await
            .map_err(|_| ApiError::Timeout {
                operation: "send turn",
                after,
            })??,
        None => transport.send(outbound).await?,
    };
    Ok(response)
}

/// Looks up the current node of a resumed conversation. A failed lookup
/// leaves the conversation unmapped, which starts a new conversation.
async fn resolve_current_node(
    graph: &mut ConversationGraph,
    lookup: Option<&dyn HistoryLookup>,
    conversation_id: &str,
    credential: &Credential,
    timeout: Option<Duration>,
) {
    let Some(lookup) = lookup else {
        debug!(%conversation_id, "no history lookup configured");
        return;
    };

    let outcome = match timeout {
        Some(after) => {
            tokio::time::timeout(after, lookup.current_node(conversation_id, credential))
                .await
                .unwrap_or(Err(ApiError::Timeout {
                    operation: "history lookup",
                    after,
                }))
        }
        None => lookup.current_node(conversation_id, credential).await,
    };

    match outcome {
        Ok(node) => {
            debug!(%conversation_id, %node, "resolved current node");
            graph.remember_current_node(conversation_id, node);
        }
        Err(error) => warn!(%conversation_id, %error, "history lookup failed"),
    }
}

fn log_turn(prepared: &PreparedTurn) {
    info!(
        action = ?prepared.action,
        conversation_id = ?prepared.conversation_id,
        parent_id = %prepared.parent_id,
        "sending turn"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chat_mock::{reply_lines, ScriptedAuthenticator, ScriptedReply, ScriptedTransport};
    use chat_wire::Credential;
    use futures_util::StreamExt;

    use super::{AskOptions, ConversationSession};
    use crate::config::SessionSettings;
    use crate::error::SessionError;

    async fn session(transport: Arc<ScriptedTransport>) -> ConversationSession {
        let session = ConversationSession::new(
            transport,
            Arc::new(ScriptedAuthenticator::new()),
            SessionSettings::default(),
        );
        session.set_credential(Credential::bearer("tok")).await;
        session
    }

    #[tokio::test]
    async fn stream_is_lazy_until_polled() {
        let transport = Arc::new(ScriptedTransport::new([ScriptedReply::ok(reply_lines(
            "c1",
            "m1",
            &["Hi"],
        ))]));
        let session = session(Arc::clone(&transport)).await;

        let mut events = session.ask_stream("hello", AskOptions::default());
        assert_eq!(transport.send_count(), 0);

        assert!(events.next().await.is_some());
        assert_eq!(transport.send_count(), 1);
    }

    #[tokio::test]
    async fn request_carries_bearer_and_user_message() {
        let transport = Arc::new(ScriptedTransport::new([ScriptedReply::ok(reply_lines(
            "c1",
            "m1",
            &["Hi"],
        ))]));
        let session = session(Arc::clone(&transport)).await;

        session
            .ask("hello", AskOptions::default().with_message_id("u1"))
            .await
            .expect("ask");

        let request = &transport.requests()[0];
        assert_eq!(
            request.headers.get("authorization").map(String::as_str),
            Some("Bearer tok")
        );
        let body = request.conversation_request().expect("body");
        assert_eq!(body.messages[0].id, "u1");
        assert!(body.conversation_id.is_none());
    }

    #[tokio::test]
    async fn terminated_stream_yields_nothing_more() {
        let transport = Arc::new(ScriptedTransport::new([ScriptedReply::ok(reply_lines(
            "c1",
            "m1",
            &["Hi"],
        ))]));
        let session = session(transport).await;

        let events = session
            .ask_stream("hello", AskOptions::default())
            .collect::<Vec<_>>()
            .await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn explicit_parent_without_conversation_is_user_error() {
        let session = session(Arc::new(ScriptedTransport::new([]))).await;
        let error = session
            .ask("hello", AskOptions::default().with_parent("p1"))
            .await
            .expect_err("user error");
        assert!(matches!(error, SessionError::User(_)));
        assert_eq!(session.history_depth().await, 0);
    }
}
