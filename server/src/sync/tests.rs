use std::sync::Arc;

use futures_util::future::join_all;
use httpmock::prelude::*;
use serde_json::json;

use super::*;
use crate::test_support::{
    attach, seed_conversation, seed_owner, test_state, test_state_with, RecordingCompletion,
    StaticFetcher,
};
use crate::types::ChannelBinding;

async fn bind(state: &AppState, conversation: &Conversation, channel_id: &str) {
    state
        .store
        .bind_channel(
            &conversation.id,
            &ChannelBinding {
                channel_id: channel_id.to_string(),
                channel_name: format!("esme-{}", channel_id.to_ascii_lowercase()),
            },
        )
        .await
        .expect("bind");
}

fn inbound(channel_id: &str, sender_id: &str, text: &str, ts: &str) -> InboundMessage {
    InboundMessage {
        channel_id: channel_id.to_string(),
        sender_id: sender_id.to_string(),
        text: text.to_string(),
        ts: ts.to_string(),
    }
}

fn mock_token_endpoint(server: &MockServer) -> httpmock::Mock<'_> {
    server.mock(|when, then| {
        when.method(POST).path("/token").body_includes("refresh_token=rt-owner");
        then.status(200)
            .json_body(json!({"access_token": "at-fresh", "expires_in": 3599}));
    })
}

#[test]
fn accepts_plain_channel_messages_and_strips_mentions() {
    let event = MessageEvent {
        kind: "message".to_string(),
        channel: Some("C1".to_string()),
        channel_type: Some("group".to_string()),
        user: Some("U1".to_string()),
        text: Some("<@U0BOT> What's the budget?".to_string()),
        ts: Some("100.1".to_string()),
        ..MessageEvent::default()
    };
    assert_eq!(
        event.accept(),
        Ok(inbound("C1", "U1", "What's the budget?", "100.1"))
    );

    let parent_with_replies = MessageEvent {
        thread_ts: Some("100.1".to_string()),
        ..event.clone()
    };
    assert!(parent_with_replies.accept().is_ok());
}

#[test]
fn filters_bot_threaded_direct_and_empty_messages() {
    let base = MessageEvent {
        kind: "message".to_string(),
        channel: Some("C1".to_string()),
        channel_type: Some("channel".to_string()),
        user: Some("U1".to_string()),
        text: Some("hello".to_string()),
        ts: Some("100.1".to_string()),
        ..MessageEvent::default()
    };
    let cases = [
        (
            MessageEvent {
                bot_id: Some("B1".to_string()),
                ..base.clone()
            },
            "bot message",
        ),
        (
            MessageEvent {
                subtype: Some("message_changed".to_string()),
                ..base.clone()
            },
            "message subtype",
        ),
        (
            MessageEvent {
                thread_ts: Some("99.0".to_string()),
                ..base.clone()
            },
            "thread reply",
        ),
        (
            MessageEvent {
                channel_type: Some("im".to_string()),
                ..base.clone()
            },
            "not a channel message",
        ),
        (
            MessageEvent {
                text: Some("<@U0BOT>  ".to_string()),
                ..base.clone()
            },
            "empty text",
        ),
        (
            MessageEvent {
                kind: "app_mention".to_string(),
                ..base.clone()
            },
            "not a message event",
        ),
    ];
    for (event, reason) in cases {
        assert_eq!(event.accept(), Err(reason));
    }
}

#[tokio::test]
async fn inbound_question_is_recorded_answered_and_posted_in_order() {
    let server = MockServer::start();
    let token = mock_token_endpoint(&server);
    let reply = server.mock(|when, then| {
        when.method(POST)
            .path("/chat.postMessage")
            .body_includes("\"channel\":\"C1\"")
            .body_includes("\"thread_ts\":\"100.1\"")
            .body_includes("Marketing gets $120k.");
        then.status(200)
            .json_body(json!({"ok": true, "channel": "C1", "ts": "100.2"}));
    });

    let completion = RecordingCompletion::answering("Marketing gets $120k.");
    let fetcher = StaticFetcher::default()
        .with("sheet-1", Ok("team,amount\nmarketing,120000"))
        .with("doc-2", Ok("Roadmap: ship in Q3"));
    let state = test_state_with(&server, completion.clone(), Arc::new(fetcher));
    let owner = seed_owner(&state, "U-OWNER", Some("rt-owner")).await;
    let conversation = seed_conversation(&state, &owner, "Q3 Planning").await;
    bind(&state, &conversation, "C1").await;
    attach(&state, &conversation, "sheet-1", "Budget FY25").await;
    attach(&state, &conversation, "doc-2", "Roadmap").await;

    let outcome =
        process_inbound_message(&state, &inbound("C1", "U-OWNER", "What's the budget?", "100.1"))
            .await;

    let messages = state.store.list_messages(&conversation.id).await.expect("messages");
    assert_eq!(messages.len(), 2);
    let (human, assistant) = (&messages[0], &messages[1]);
    assert_eq!(human.role, MessageRole::Human);
    assert_eq!(human.text, "What's the budget?");
    assert_eq!(human.slack.ts.as_deref(), Some("100.1"));
    assert!(human.slack.synced);
    assert_eq!(assistant.role, MessageRole::Assistant);
    assert_eq!(assistant.text, "Marketing gets $120k.");
    assert_eq!(assistant.slack.ts.as_deref(), Some("100.2"));
    assert_eq!(assistant.slack.thread_ts.as_deref(), Some("100.1"));
    assert!(assistant.slack.synced);

    assert_eq!(
        outcome,
        InboundOutcome::Answered {
            human_message_id: human.id.clone(),
            assistant_message_id: assistant.id.clone(),
            reply_ts: "100.2".to_string(),
        }
    );

    let prompts = completion.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("team,amount\nmarketing,120000"));
    assert!(prompts[0].contains("Roadmap: ship in Q3"));
    assert!(prompts[0].contains("What's the budget?"));
    token.assert_calls(1);
    reply.assert_calls(1);

    let stored = state
        .store
        .get_conversation(&conversation.id)
        .await
        .expect("get")
        .expect("conversation");
    assert!(stored.files_locked);
}

#[tokio::test]
async fn redelivered_event_creates_a_single_message() {
    let server = MockServer::start();
    let token = mock_token_endpoint(&server);
    server.mock(|when, then| {
        when.method(POST).path("/chat.postMessage");
        then.status(200).json_body(json!({"ok": true, "ts": "200.2"}));
    });
    let completion = RecordingCompletion::answering("Yes.");
    let state = test_state_with(&server, completion.clone(), Arc::new(StaticFetcher::default()));
    let owner = seed_owner(&state, "U-OWNER", Some("rt-owner")).await;
    let conversation = seed_conversation(&state, &owner, "Ops").await;
    bind(&state, &conversation, "C2").await;
    let event = inbound("C2", "U-OWNER", "Is the launch on?", "200.1");

    let first = process_inbound_message(&state, &event).await;
    assert!(matches!(first, InboundOutcome::Answered { .. }));
    assert_eq!(
        process_inbound_message(&state, &event).await,
        InboundOutcome::Duplicate
    );

    let concurrent = join_all((0..4).map(|_| process_inbound_message(&state, &event))).await;
    assert!(concurrent
        .iter()
        .all(|outcome| *outcome == InboundOutcome::Duplicate));

    let messages = state.store.list_messages(&conversation.id).await.expect("messages");
    let carrying_ts = messages
        .iter()
        .filter(|message| message.slack.ts.as_deref() == Some("200.1"))
        .count();
    assert_eq!(carrying_ts, 1);
    assert_eq!(completion.prompts().len(), 1);
    token.assert_calls(1);
}

#[tokio::test]
async fn concurrent_first_deliveries_race_to_one_message() {
    let server = MockServer::start();
    let _token = mock_token_endpoint(&server);
    server.mock(|when, then| {
        when.method(POST).path("/chat.postMessage");
        then.status(200).json_body(json!({"ok": true, "ts": "300.2"}));
    });
    let completion = RecordingCompletion::answering("Done.");
    let state = test_state_with(&server, completion.clone(), Arc::new(StaticFetcher::default()));
    let owner = seed_owner(&state, "U-OWNER", Some("rt-owner")).await;
    let conversation = seed_conversation(&state, &owner, "Ops").await;
    bind(&state, &conversation, "C3").await;
    let event = inbound("C3", "U-OWNER", "Status?", "300.1");

    let outcomes = join_all((0..5).map(|_| process_inbound_message(&state, &event))).await;
    let answered = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, InboundOutcome::Answered { .. }))
        .count();
    assert_eq!(answered, 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| **outcome == InboundOutcome::Duplicate)
            .count(),
        4
    );
    let humans = state
        .store
        .list_messages(&conversation.id)
        .await
        .expect("messages")
        .into_iter()
        .filter(|message| message.role == MessageRole::Human)
        .count();
    assert_eq!(humans, 1);
}

#[tokio::test]
async fn missing_refresh_token_posts_notice_and_no_answer() {
    let server = MockServer::start();
    let token = server.mock(|when, then| {
        when.method(POST).path("/token");
        then.status(200).json_body(json!({"access_token": "unused"}));
    });
    let notice = server.mock(|when, then| {
        when.method(POST)
            .path("/chat.postMessage")
            .body_includes("reconnect Google Drive")
            .body_includes(RETRY_ACTION_ID)
            .body_includes("\"value\":\"400.1\"");
        then.status(200).json_body(json!({"ok": true, "ts": "400.2"}));
    });
    let completion = RecordingCompletion::answering("unused");
    let state = test_state_with(&server, completion.clone(), Arc::new(StaticFetcher::default()));
    let owner = seed_owner(&state, "U-OWNER", None).await;
    let conversation = seed_conversation(&state, &owner, "Ops").await;
    bind(&state, &conversation, "C4").await;

    let outcome =
        process_inbound_message(&state, &inbound("C4", "U-OWNER", "Anything new?", "400.1")).await;
    assert_eq!(outcome, InboundOutcome::Failed { notice_posted: true });
    notice.assert_calls(1);
    token.assert_calls(0);
    assert!(completion.prompts().is_empty());

    let messages = state.store.list_messages(&conversation.id).await.expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, MessageRole::Human);
}

#[tokio::test]
async fn unmapped_channel_and_sender_are_discarded() {
    let server = MockServer::start();
    let post = server.mock(|when, then| {
        when.method(POST).path("/chat.postMessage");
        then.status(200).json_body(json!({"ok": true, "ts": "1.0"}));
    });
    let state = test_state(&server);
    let owner = seed_owner(&state, "U-OWNER", Some("rt-owner")).await;
    let conversation = seed_conversation(&state, &owner, "Ops").await;
    bind(&state, &conversation, "C5").await;

    assert_eq!(
        process_inbound_message(&state, &inbound("C-OTHER", "U-OWNER", "hi", "1.1")).await,
        InboundOutcome::UnmappedChannel
    );
    assert_eq!(
        process_inbound_message(&state, &inbound("C5", "U-STRANGER", "hi", "1.2")).await,
        InboundOutcome::UnmappedSender
    );
    assert!(state
        .store
        .list_messages(&conversation.id)
        .await
        .expect("messages")
        .is_empty());
    post.assert_calls(0);
}

#[tokio::test]
async fn retry_answers_a_recorded_question() {
    let server = MockServer::start();
    let _token = mock_token_endpoint(&server);
    let reply = server.mock(|when, then| {
        when.method(POST)
            .path("/chat.postMessage")
            .body_includes("Second try works.");
        then.status(200).json_body(json!({"ok": true, "ts": "500.3"}));
    });
    let completion = RecordingCompletion::answering("Second try works.");
    let state = test_state_with(&server, completion.clone(), Arc::new(StaticFetcher::default()));
    let owner = seed_owner(&state, "U-OWNER", Some("rt-owner")).await;
    let conversation = seed_conversation(&state, &owner, "Ops").await;
    bind(&state, &conversation, "C6").await;
    let question = state
        .store
        .insert_message(
            NewMessage::human(&conversation.id, &owner.id, "Who signs off?")
                .synced_from("500.1", None),
        )
        .await
        .expect("question");

    match retry_generation(&state, "C6", "U-OWNER", "500.1").await {
        InboundOutcome::Answered {
            human_message_id,
            reply_ts,
            ..
        } => {
            assert_eq!(human_message_id, question.id);
            assert_eq!(reply_ts, "500.3");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    reply.assert_calls(1);
    let prompts = completion.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(!prompts[0].contains("human: Who signs off?"));

    assert_eq!(
        retry_generation(&state, "C6", "U-OWNER", "999.9").await,
        InboundOutcome::Ignored
    );
}

#[tokio::test]
async fn retry_after_failed_push_reposts_the_stored_answer() {
    let server = MockServer::start();
    let _token = mock_token_endpoint(&server);
    let mut rejected = server.mock(|when, then| {
        when.method(POST)
            .path("/chat.postMessage")
            .body_includes("Marketing gets $120k.");
        then.status(200)
            .json_body(json!({"ok": false, "error": "not_in_channel"}));
    });
    let notice = server.mock(|when, then| {
        when.method(POST)
            .path("/chat.postMessage")
            .body_includes(RETRY_ACTION_ID)
            .body_includes("\"value\":\"700.1\"");
        then.status(200).json_body(json!({"ok": true, "ts": "700.9"}));
    });
    let completion = RecordingCompletion::answering("Marketing gets $120k.");
    let state = test_state_with(&server, completion.clone(), Arc::new(StaticFetcher::default()));
    let owner = seed_owner(&state, "U-OWNER", Some("rt-owner")).await;
    let conversation = seed_conversation(&state, &owner, "Ops").await;
    bind(&state, &conversation, "C9").await;

    let assistants = |messages: Vec<ChatMessage>| -> Vec<ChatMessage> {
        messages
            .into_iter()
            .filter(|message| message.role == MessageRole::Assistant)
            .collect()
    };

    let outcome =
        process_inbound_message(&state, &inbound("C9", "U-OWNER", "Budget split?", "700.1")).await;
    assert_eq!(outcome, InboundOutcome::Failed { notice_posted: true });
    assert_eq!(
        retry_generation(&state, "C9", "U-OWNER", "700.1").await,
        InboundOutcome::Failed { notice_posted: true }
    );
    rejected.assert_calls(2);
    notice.assert_calls(2);
    assert_eq!(completion.prompts().len(), 1);
    let stored = assistants(state.store.list_messages(&conversation.id).await.expect("messages"));
    assert_eq!(stored.len(), 1);
    assert!(!stored[0].slack.synced);

    rejected.delete();
    let accepted = server.mock(|when, then| {
        when.method(POST)
            .path("/chat.postMessage")
            .body_includes("Marketing gets $120k.")
            .body_includes("\"thread_ts\":\"700.1\"");
        then.status(200).json_body(json!({"ok": true, "ts": "700.2"}));
    });
    assert_eq!(
        retry_generation(&state, "C9", "U-OWNER", "700.1").await,
        InboundOutcome::Answered {
            human_message_id: state
                .store
                .find_message_by_slack_ts(&conversation.id, "700.1")
                .await
                .expect("lookup")
                .expect("question")
                .id,
            assistant_message_id: stored[0].id.clone(),
            reply_ts: "700.2".to_string(),
        }
    );

    // Once the answer is in the channel another click does nothing.
    assert_eq!(
        retry_generation(&state, "C9", "U-OWNER", "700.1").await,
        InboundOutcome::Ignored
    );
    accepted.assert_calls(1);
    assert_eq!(completion.prompts().len(), 1);
    let stored = assistants(state.store.list_messages(&conversation.id).await.expect("messages"));
    assert_eq!(stored.len(), 1);
    assert!(stored[0].slack.synced);
    assert_eq!(stored[0].slack.ts.as_deref(), Some("700.2"));
}

#[tokio::test]
async fn completion_failure_keeps_question_and_offers_retry() {
    let server = MockServer::start();
    let _token = mock_token_endpoint(&server);
    let notice = server.mock(|when, then| {
        when.method(POST)
            .path("/chat.postMessage")
            .body_includes("answer service is unavailable");
        then.status(200).json_body(json!({"ok": true, "ts": "600.2"}));
    });
    let state = test_state_with(
        &server,
        RecordingCompletion::failing(),
        Arc::new(StaticFetcher::default()),
    );
    let owner = seed_owner(&state, "U-OWNER", Some("rt-owner")).await;
    let conversation = seed_conversation(&state, &owner, "Ops").await;
    bind(&state, &conversation, "C7").await;

    let outcome =
        process_inbound_message(&state, &inbound("C7", "U-OWNER", "Status?", "600.1")).await;
    assert_eq!(outcome, InboundOutcome::Failed { notice_posted: true });
    notice.assert_calls(1);
    let messages = state.store.list_messages(&conversation.id).await.expect("messages");
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn mirror_exchange_creates_channel_and_threads_the_answer() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/conversations.create");
        then.status(200)
            .json_body(json!({"ok": true, "channel": {"id": "C8", "name": "esme-ops-x"}}));
    });
    for path in ["/conversations.invite", "/conversations.setTopic"] {
        server.mock(|when, then| {
            when.method(POST).path(path);
            then.status(200).json_body(json!({"ok": true}));
        });
    }
    server.mock(|when, then| {
        when.method(POST)
            .path("/chat.postMessage")
            .body_includes("mirrors the Esme conversation");
        then.status(200).json_body(json!({"ok": true, "ts": "700.0"}));
    });
    let question = server.mock(|when, then| {
        when.method(POST)
            .path("/chat.postMessage")
            .body_includes("*Owner* asked: Ready?");
        then.status(200).json_body(json!({"ok": true, "ts": "700.1"}));
    });
    let answer = server.mock(|when, then| {
        when.method(POST)
            .path("/chat.postMessage")
            .body_includes("\"thread_ts\":\"700.1\"")
            .body_includes("Almost.");
        then.status(200).json_body(json!({"ok": true, "ts": "700.2"}));
    });

    let state = test_state(&server);
    let owner = seed_owner(&state, "U-OWNER", None).await;
    let conversation = seed_conversation(&state, &owner, "Ops").await;
    let human = state
        .store
        .insert_message(NewMessage::human(&conversation.id, &owner.id, "Ready?"))
        .await
        .expect("human");
    let assistant = state
        .store
        .insert_message(NewMessage::assistant(&conversation.id, "Almost."))
        .await
        .expect("assistant");

    mirror_exchange(&state, &conversation, "Owner", &human, &assistant).await;
    question.assert_calls(1);
    answer.assert_calls(1);

    let messages = state.store.list_messages(&conversation.id).await.expect("messages");
    assert_eq!(messages[0].slack.ts.as_deref(), Some("700.1"));
    assert_eq!(messages[1].slack.ts.as_deref(), Some("700.2"));
    assert_eq!(messages[1].slack.thread_ts.as_deref(), Some("700.1"));
}

#[tokio::test]
async fn slash_command_answers_through_response_url() {
    let server = MockServer::start();
    let _token = mock_token_endpoint(&server);
    let respond = server.mock(|when, then| {
        when.method(POST)
            .path("/respond/abc")
            .body_includes("\"response_type\":\"in_channel\"")
            .body_includes("$460k total.");
        then.status(200);
    });
    let state = test_state_with(
        &server,
        RecordingCompletion::answering("$460k total."),
        Arc::new(StaticFetcher::default()),
    );
    let owner = seed_owner(&state, "U-OWNER", Some("rt-owner")).await;
    let conversation = seed_conversation(&state, &owner, "Budget").await;
    bind(&state, &conversation, "C9").await;

    answer_command(
        &state,
        &SlashCommand {
            channel_id: "C9".to_string(),
            user_id: "U-OWNER".to_string(),
            text: "What's the budget?".to_string(),
            response_url: server.url("/respond/abc"),
        },
    )
    .await;
    respond.assert_calls(1);

    let messages = state.store.list_messages(&conversation.id).await.expect("messages");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].text, "$460k total.");
}

#[tokio::test]
async fn slash_command_in_unlinked_channel_replies_ephemerally() {
    let server = MockServer::start();
    let respond = server.mock(|when, then| {
        when.method(POST)
            .path("/respond/xyz")
            .body_includes("\"response_type\":\"ephemeral\"")
            .body_includes("isn't linked");
        then.status(200);
    });
    let state = test_state(&server);

    answer_command(
        &state,
        &SlashCommand {
            channel_id: "C-NOPE".to_string(),
            user_id: "U1".to_string(),
            text: "hello".to_string(),
            response_url: server.url("/respond/xyz"),
        },
    )
    .await;
    respond.assert_calls(1);
}
