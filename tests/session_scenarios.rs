
use std::sync::Arc;
use std::time::Duration;

use chat_mock::{
    assistant_line, detail_line, done_line, finished_line, reply_lines, AuthOutcome,
    FixedLookup, ScriptedAuthenticator, ScriptedReply,
};
use chat_wire::{Credential, StreamEvent, TurnAction};
use futures_util::StreamExt;
use harness::{bearer, sent, session, session_with, settings, transport};
use revchat::{AskOptions, CredentialState, DeltaMode, Pointer, SessionError};

#[tokio::test]
async fn fresh_session_applies_single_reply() {
    let transport = transport([ScriptedReply::ok(reply_lines("c1", "m1", &["Hi!"]))]);
    let session = session(&transport).await;

    let events = session
        .ask_stream("hello", AskOptions::default())
        .collect::<Vec<_>>()
        .await;

    let events = events
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .expect("turn succeeds");
    assert_eq!(
        events,
        vec![
            StreamEvent::delta("Hi!", "c1", "m1"),
            StreamEvent::Done,
        ]
    );
    assert_eq!(session.conversation_id().await.as_deref(), Some("c1"));
    assert_eq!(session.parent_id().await.as_deref(), Some("m1"));
}

#[tokio::test]
async fn switching_conversation_never_reuses_old_parent() {
    let transport = transport([
        ScriptedReply::ok(reply_lines("c1", "m1", &["Hi!"])),
        ScriptedReply::ok(reply_lines("c2", "m2", &["Again"])),
    ]);
    let session = session(&transport).await;

    session
        .ask("hello", AskOptions::default())
        .await
        .expect("first turn");
    session
        .ask("again", AskOptions::default().in_conversation("c2"))
        .await
        .expect("second turn");

    let second = sent(&transport, 1);
    assert_ne!(second.parent_message_id, "m1");
    assert!(!second.parent_message_id.is_empty());
    assert_eq!(session.conversation_id().await.as_deref(), Some("c2"));
    assert_eq!(session.parent_id().await.as_deref(), Some("m2"));
}

#[tokio::test]
async fn switching_conversation_uses_looked_up_node() {
    let transport = transport([
        ScriptedReply::ok(reply_lines("c1", "m1", &["Hi!"])),
        ScriptedReply::ok(reply_lines("c2", "m9", &["Back"])),
    ]);
    let lookup = Arc::new(FixedLookup::new().with_node("c2", "n5"));
    let session = session(&transport).await.with_history_lookup(lookup.clone());

    session
        .ask("hello", AskOptions::default())
        .await
        .expect("first turn");
    session
        .ask("again", AskOptions::default().in_conversation("c2"))
        .await
        .expect("second turn");

    let second = sent(&transport, 1);
    assert_eq!(second.conversation_id.as_deref(), Some("c2"));
    assert_eq!(second.parent_message_id, "n5");
    assert_eq!(lookup.calls(), 1);
}

#[tokio::test]
async fn rollback_underflow_leaves_state_unchanged() {
    let transport = transport([ScriptedReply::ok(reply_lines("c1", "m1", &["Hi!"]))]);
    let session = session(&transport).await;
    session
        .ask("hello", AskOptions::default())
        .await
        .expect("turn");

    let before = session.pointer().await;
    let error = session.rollback(2).await.expect_err("underflow");
    assert!(matches!(
        error,
        SessionError::RollbackUnderflow {
            requested: 2,
            available: 1
        }
    ));
    assert_eq!(session.pointer().await, before);
    assert_eq!(session.history_depth().await, 1);
}

#[tokio::test]
async fn rejected_credential_is_refreshed_once_and_turn_retried() {
    let transport = transport([
        ScriptedReply::status(401, r#"{"detail":"token_expired"}"#),
        ScriptedReply::ok(reply_lines("c1", "m1", &["Hi!"])),
    ]);
    let authenticator = Arc::new(
        ScriptedAuthenticator::new().with_refresh(AuthOutcome::Grant(Credential::bearer("new"))),
    );
    let session = session_with(&transport, &authenticator, settings()).await;

    let reply = session
        .ask("hello", AskOptions::default())
        .await
        .expect("retried turn");

    assert_eq!(reply.text, "Hi!");
    assert_eq!(reply.message_id, "m1");
    assert_eq!(authenticator.refresh_calls(), 1);
    assert_eq!(authenticator.login_calls(), 0);
    assert_eq!(transport.send_count(), 2);
    assert_eq!(bearer(&transport, 0), "Bearer tok");
    assert_eq!(bearer(&transport, 1), "Bearer new");
    assert_eq!(
        sent(&transport, 0).parent_message_id,
        sent(&transport, 1).parent_message_id
    );
    assert_eq!(session.history_depth().await, 1);
    assert_eq!(session.credential_state().await, CredentialState::Authenticated);
}

#[tokio::test]
async fn failing_refresh_is_attempted_once_per_turn() {
    let transport = transport([
        ScriptedReply::status(401, ""),
        ScriptedReply::status(401, ""),
    ]);
    let authenticator = Arc::new(
        ScriptedAuthenticator::new()
            .with_refresh(AuthOutcome::Reject("expired".into()))
            .with_refresh(AuthOutcome::Reject("expired".into())),
    );
    let session = session_with(&transport, &authenticator, settings()).await;

    let first = session.ask("hello", AskOptions::default()).await;
    assert!(matches!(first, Err(SessionError::Authentication(_))));
    assert_eq!(authenticator.refresh_calls(), 1);
    assert_eq!(transport.send_count(), 1);
    assert_eq!(session.credential_state().await, CredentialState::Failed);

    let second = session.ask("hello", AskOptions::default()).await;
    assert!(matches!(second, Err(SessionError::Authentication(_))));
    assert_eq!(authenticator.refresh_calls(), 2);
    assert_eq!(transport.send_count(), 1);
}

#[tokio::test]
async fn second_rejection_after_refresh_is_final() {
    let transport = transport([
        ScriptedReply::status(403, ""),
        ScriptedReply::status(403, ""),
        ScriptedReply::ok(reply_lines("c1", "m1", &["never"])),
    ]);
    let authenticator = Arc::new(
        ScriptedAuthenticator::new()
            .with_refresh(AuthOutcome::Grant(Credential::bearer("new")))
            .with_refresh(AuthOutcome::Grant(Credential::bearer("newer"))),
    );
    let session = session_with(&transport, &authenticator, settings()).await;

    let error = session
        .ask("hello", AskOptions::default())
        .await
        .expect_err("rejected twice");
    assert!(matches!(error, SessionError::Authentication(_)));
    assert_eq!(authenticator.refresh_calls(), 1);
    assert_eq!(transport.send_count(), 2);
    assert_eq!(session.credential_state().await, CredentialState::Failed);
}

#[tokio::test]
async fn consecutive_turns_chain_parent_ids() {
    let transport = transport([
        ScriptedReply::ok(reply_lines("c1", "m1", &["one"])),
        ScriptedReply::ok(reply_lines("c1", "m2", &["two"])),
        ScriptedReply::ok(reply_lines("c1", "m3", &["three"])),
    ]);
    let session = session(&transport).await;

    for prompt in ["a", "b", "c"] {
        session
            .ask(prompt, AskOptions::default())
            .await
            .expect("turn");
    }

    assert!(sent(&transport, 0).conversation_id.is_none());
    assert_eq!(sent(&transport, 1).conversation_id.as_deref(), Some("c1"));
    assert_eq!(sent(&transport, 1).parent_message_id, "m1");
    assert_eq!(sent(&transport, 2).parent_message_id, "m2");
    assert_eq!(session.history_depth().await, 3);
}

#[tokio::test]
async fn rollback_restores_pre_turn_pointer() {
    let transport = transport([
        ScriptedReply::ok(reply_lines("c1", "m1", &["one"])),
        ScriptedReply::ok(reply_lines("c1", "m2", &["two"])),
        ScriptedReply::ok(reply_lines("c1", "m3", &["branch"])),
    ]);
    let session = session(&transport).await;

    session.ask("a", AskOptions::default()).await.expect("a");
    session.ask("b", AskOptions::default()).await.expect("b");
    session.rollback(1).await.expect("rollback");

    assert_eq!(
        session.pointer().await,
        Pointer {
            conversation_id: Some("c1".to_owned()),
            parent_id: Some("m1".to_owned()),
        }
    );

    session
        .ask("b'", AskOptions::default())
        .await
        .expect("branch");
    assert_eq!(sent(&transport, 2).parent_message_id, "m1");
}

#[tokio::test]
async fn failed_turn_keeps_pointer_and_is_undoable() {
    let transport = transport([
        ScriptedReply::ok(reply_lines("c1", "m1", &["one"])),
        ScriptedReply::status(500, r#"{"detail":"upstream exploded"}"#),
    ]);
    let session = session(&transport).await;
    session.ask("a", AskOptions::default()).await.expect("a");
    let before = session.pointer().await;

    let error = session
        .ask("b", AskOptions::default())
        .await
        .expect_err("server error");
    assert!(matches!(error, SessionError::Server(message) if message == "upstream exploded"));
    assert_eq!(session.pointer().await, before);
    assert_eq!(session.history_depth().await, 2);

    session.rollback(1).await.expect("rollback");
    assert_eq!(session.pointer().await, before);
}

#[tokio::test]
async fn noise_before_terminal_line_is_skipped() {
    let lines = vec![
        String::new(),
        ": keep-alive".to_owned(),
        "data: {not json".to_owned(),
        assistant_line("c1", "m1", "Hel"),
        String::new(),
        assistant_line("c1", "m1", "Hello"),
        done_line(),
        assistant_line("c1", "m1", "after done"),
    ];
    let transport = transport([ScriptedReply::ok(lines)]);
    let session = session(&transport).await;

    let events = session
        .ask_stream("hi", AskOptions::default())
        .collect::<Vec<_>>()
        .await;
    assert_eq!(events.len(), 3);
    assert!(matches!(events.last(), Some(Ok(StreamEvent::Done))));
}

#[tokio::test]
async fn cumulative_and_incremental_replies_resolve_to_full_text() {
    let transport_cumulative = transport([ScriptedReply::ok(reply_lines(
        "c1",
        "m1",
        &["He", "Hell", "Hello"],
    ))]);
    let reply = session(&transport_cumulative)
        .await
        .ask("hi", AskOptions::default())
        .await
        .expect("cumulative");
    assert_eq!(reply.text, "Hello");

    let transport_incremental = transport([ScriptedReply::ok(vec![
        assistant_line("c1", "m1", "He"),
        assistant_line("c1", "m1", "llo"),
        done_line(),
    ])]);
    let reply = session_with(
        &transport_incremental,
        &Arc::new(ScriptedAuthenticator::new()),
        settings().with_delta_mode(DeltaMode::Incremental),
    )
    .await
    .ask("hi", AskOptions::default())
    .await
    .expect("incremental");
    assert_eq!(reply.text, "Hello");
}

#[tokio::test]
async fn revised_cumulative_reply_resolves_to_latest_text() {
    let transport = transport([ScriptedReply::ok(reply_lines(
        "c1",
        "m1",
        &["Hello", "Hello wrld", "Hello world, how are you?"],
    ))]);
    let reply = session(&transport)
        .await
        .ask("hi", AskOptions::default())
        .await
        .expect("revised reply");
    assert_eq!(reply.text, "Hello world, how are you?");
}

#[tokio::test]
async fn missing_terminal_line_is_tolerated_after_a_delta() {
    let transport = transport([
        ScriptedReply::ok(vec![assistant_line("c1", "m1", "Hi")]),
        ScriptedReply::ok(vec!["data: {\"message\": null}".to_owned()]),
    ]);
    let session = session(&transport).await;

    let reply = session
        .ask("a", AskOptions::default())
        .await
        .expect("synthesized done");
    assert_eq!(reply.text, "Hi");

    let error = session
        .ask("b", AskOptions::default())
        .await
        .expect_err("empty reply");
    assert!(matches!(error, SessionError::Server(_)));
    assert_eq!(session.parent_id().await.as_deref(), Some("m1"));
}

#[tokio::test]
async fn stream_error_records_map_to_taxonomy() {
    let transport = transport([
        ScriptedReply::ok(vec![detail_line("Too many requests in 1 hour. Try again later.")]),
        ScriptedReply::ok(vec![detail_line(
            "Only one message at a time. Please allow any other responses to complete",
        )]),
        ScriptedReply::ok(vec!["Internal Server Error".to_owned()]),
    ]);
    let session = session(&transport).await;

    let rate_limited = session.ask("a", AskOptions::default()).await;
    assert!(matches!(rate_limited, Err(SessionError::RateLimit { .. })));

    let concurrent = session.ask("b", AskOptions::default()).await;
    assert!(matches!(concurrent, Err(SessionError::RateLimit { .. })));

    let server = session.ask("c", AskOptions::default()).await;
    assert!(matches!(server, Err(SessionError::Server(_))));
}

#[tokio::test]
async fn rate_limit_status_carries_retry_after() {
    let transport = transport([ScriptedReply::status(429, r#"{"detail":"Too many requests"}"#)
        .with_retry_after(Duration::from_secs(7))]);
    let session = session(&transport).await;

    let error = session
        .ask("a", AskOptions::default())
        .await
        .expect_err("rate limited");
    assert!(matches!(
        error,
        SessionError::RateLimit { retry_after: Some(after), .. } if after == Duration::from_secs(7)
    ));
    assert!(error.is_retryable_by_caller());
}

#[tokio::test]
async fn continue_extends_current_branch() {
    let transport = transport([
        ScriptedReply::ok(reply_lines("c1", "m1", &["Once upon"])),
        ScriptedReply::ok(reply_lines("c1", "m2", &[" a time"])),
    ]);
    let session = session(&transport).await;
    session.ask("story", AskOptions::default()).await.expect("ask");

    let reply = session
        .continue_reply(AskOptions::default())
        .await
        .expect("continue");

    let request = sent(&transport, 1);
    assert_eq!(request.action, TurnAction::Continue);
    assert!(request.messages.is_empty());
    assert_eq!(request.conversation_id.as_deref(), Some("c1"));
    assert_eq!(request.parent_message_id, "m1");
    assert_eq!(reply.message_id, "m2");
    assert_eq!(session.history_depth().await, 2);
}

fn truncated_reply() -> ScriptedReply {
    ScriptedReply::ok(vec![
        assistant_line("c1", "m1", "Once upon a"),
        finished_line("c1", "m1", "Once upon a\n", "max_tokens"),
        done_line(),
    ])
}

fn continuation_reply() -> ScriptedReply {
    ScriptedReply::ok(vec![
        assistant_line("c1", "m2", " time"),
        finished_line("c1", "m2", " time there was", "stop"),
        done_line(),
    ])
}

#[tokio::test]
async fn token_limited_reply_is_continued_once_when_enabled() {
    let transport = transport([truncated_reply(), continuation_reply()]);
    let session = session_with(
        &transport,
        &Arc::new(ScriptedAuthenticator::new()),
        settings().with_auto_continue(true),
    )
    .await;

    let reply = session.ask("story", AskOptions::default()).await.expect("ask");

    assert_eq!(reply.text, "Once upon a time there was");
    assert_eq!(reply.message_id, "m2");
    assert_eq!(reply.finish_details.as_deref(), Some("stop"));
    assert_eq!(transport.send_count(), 2);
    let request = sent(&transport, 1);
    assert_eq!(request.action, TurnAction::Continue);
    assert!(request.messages.is_empty());
    assert_eq!(request.conversation_id.as_deref(), Some("c1"));
    assert_eq!(request.parent_message_id, "m1");
    assert_eq!(session.parent_id().await.as_deref(), Some("m2"));
    assert_eq!(session.history_depth().await, 1);
}

#[tokio::test]
async fn continued_stream_ends_with_a_single_done() {
    let transport = transport([truncated_reply(), continuation_reply()]);
    let session = session_with(
        &transport,
        &Arc::new(ScriptedAuthenticator::new()),
        settings().with_auto_continue(true),
    )
    .await;

    let events = session
        .ask_stream("story", AskOptions::default())
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .expect("turn succeeds");

    assert_eq!(events.len(), 5);
    assert_eq!(events.last(), Some(&StreamEvent::Done));
    assert!(matches!(
        &events[2],
        StreamEvent::Delta { text, .. } if text == "Once upon a time"
    ));
}

#[tokio::test]
async fn token_limited_reply_is_kept_when_auto_continue_is_off() {
    let transport = transport([truncated_reply(), continuation_reply()]);
    let session = session(&transport).await;

    let reply = session.ask("story", AskOptions::default()).await.expect("ask");

    assert_eq!(reply.text, "Once upon a\n");
    assert_eq!(reply.finish_details.as_deref(), Some("max_tokens"));
    assert_eq!(transport.send_count(), 1);
}

#[tokio::test]
async fn continuation_shares_the_turn_refresh_budget() {
    let transport = transport([
        ScriptedReply::status(403, ""),
        truncated_reply(),
        ScriptedReply::status(403, ""),
        continuation_reply(),
    ]);
    let authenticator = Arc::new(
        ScriptedAuthenticator::new()
            .with_refresh(AuthOutcome::Grant(Credential::bearer("new")))
            .with_refresh(AuthOutcome::Grant(Credential::bearer("newer"))),
    );
    let session =
        session_with(&transport, &authenticator, settings().with_auto_continue(true)).await;

    let error = session
        .ask("story", AskOptions::default())
        .await
        .expect_err("continuation rejected");
    assert!(matches!(error, SessionError::Authentication(_)));
    assert_eq!(authenticator.refresh_calls(), 1);
    assert_eq!(transport.send_count(), 3);
    assert_eq!(session.credential_state().await, CredentialState::Failed);
}

#[tokio::test]
async fn continue_without_conversation_is_user_error() {
    let transport = transport([]);
    let session = session(&transport).await;

    let error = session
        .continue_reply(AskOptions::default())
        .await
        .expect_err("nothing to continue");
    assert!(matches!(error, SessionError::User(_)));
    assert_eq!(transport.send_count(), 0);
}

#[tokio::test]
async fn reset_starts_new_conversation_and_is_not_undone() {
    let transport = transport([
        ScriptedReply::ok(reply_lines("c1", "m1", &["one"])),
        ScriptedReply::ok(reply_lines("c2", "m2", &["two"])),
    ]);
    let session = session(&transport).await;
    session.ask("a", AskOptions::default()).await.expect("a");

    session.reset().await;
    assert_eq!(session.conversation_id().await, None);
    let fresh_parent = session.parent_id().await.expect("fresh parent");
    assert_ne!(fresh_parent, "m1");
    assert_eq!(session.history_depth().await, 1);

    session.ask("b", AskOptions::default()).await.expect("b");
    let request = sent(&transport, 1);
    assert!(request.conversation_id.is_none());
    assert_eq!(request.parent_message_id, fresh_parent);
}

#[tokio::test]
async fn disabled_history_and_model_reach_the_request() {
    let transport = transport([ScriptedReply::ok(reply_lines("c1", "m1", &["ok"]))]);
    let session = session_with(
        &transport,
        &Arc::new(ScriptedAuthenticator::new()),
        settings().with_model("gpt-4").with_history_disabled(true),
    )
    .await;

    session.ask("a", AskOptions::default()).await.expect("a");
    let request = sent(&transport, 0);
    assert_eq!(request.model, "gpt-4");
    assert!(request.history_and_training_disabled);
}
