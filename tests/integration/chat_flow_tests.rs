//! End-to-end prompt turns through `AcpChat` against a scripted agent.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use acp_bridge::acp::permission::PermissionGate;
use acp_bridge::event_bus::EventBus;
use acp_bridge::models::conversation::ConversationKey;
use acp_bridge::models::event::{DomainEvent, EventPayload};
use acp_bridge::session::chat::{ConnectFuture, SessionConnector};
use acp_bridge::session::{AcpChat, ChatMessage, SessionContext};
use acp_bridge::{AppError, BridgeConfig};

use super::test_helpers::{AgentInbox, FakeAgent, WAIT};

/// Connects every new session to a fresh in-memory agent handed to the test.
struct DuplexConnector {
    config: BridgeConfig,
    agents: mpsc::UnboundedSender<FakeAgent>,
}

impl SessionConnector for DuplexConnector {
    fn connect<'a>(
        &'a self,
        conversation: &'a ConversationKey,
        permissions: PermissionGate,
    ) -> ConnectFuture<'a> {
        let (agent, client) = FakeAgent::pair();
        self.agents.send(agent).expect("test is listening");
        Box::pin(SessionContext::attach(
            &self.config,
            conversation.clone(),
            client.input,
            client.output,
            permissions,
        ))
    }
}

fn chat() -> (AcpChat, AgentInbox, broadcast::Receiver<DomainEvent>) {
    let bus = EventBus::new();
    let events = bus.subscribe();
    let (agents, inbox) = mpsc::unbounded_channel();
    let connector = DuplexConnector {
        config: BridgeConfig::for_command("fake-agent"),
        agents,
    };
    (
        AcpChat::with_connector(Arc::new(connector), Arc::new(bus)),
        inbox,
        events,
    )
}

async fn next_agent(inbox: &mut AgentInbox) -> FakeAgent {
    tokio::time::timeout(WAIT, inbox.recv())
        .await
        .expect("agent in time")
        .expect("connector alive")
}

fn drain(rx: &mut broadcast::Receiver<DomainEvent>) -> Vec<DomainEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn thought_then_message_yields_event_and_generation() {
    let (chat, mut inbox, mut events) = chat();
    let key = ConversationKey::new("c1");
    let messages = [ChatMessage::system("Be brief."), ChatMessage::user("Say hello")];

    let (response, _agent) = tokio::join!(chat.prompt(&key, &messages), async {
        let mut agent = next_agent(&mut inbox).await;
        agent.handshake("sess-1").await;
        let request = agent.expect_prompt().await;
        assert_eq!(request["params"]["sessionId"], "sess-1");
        assert_eq!(
            FakeAgent::prompt_text(&request),
            "SYSTEM Be brief.\nUSER Say hello"
        );

        agent.chunk("sess-1", "agent_thought_chunk", "Thinking").await;
        agent.chunk("sess-1", "agent_thought_chunk", "...").await;
        agent.chunk("sess-1", "agent_message_chunk", "Hello").await;
        agent.respond(&request, json!({"stopReason": "end_turn"})).await;
        agent
    });

    let response = response.expect("turn succeeds");
    assert_eq!(response.text(), "Hello");
    assert_eq!(response.generations.len(), 1);
    assert_eq!(response.stop_reason, "end_turn");

    let published = drain(&mut events);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].conversation, key);
    assert_eq!(
        published[0].payload,
        EventPayload::ThoughtDelta {
            text: "Thinking...".into(),
            token_count: 2
        }
    );
    let session = chat.sessions().get(&key).expect("registered");
    assert!(session.buffer().open_kinds(&key).is_empty());
}

#[tokio::test]
async fn follow_up_sends_only_the_last_message() {
    let (chat, mut inbox, _events) = chat();
    let key = ConversationKey::new("c1");

    let messages = [ChatMessage::user("first")];
    let (first, mut agent) = tokio::join!(chat.prompt(&key, &messages), async {
        let mut agent = next_agent(&mut inbox).await;
        agent.handshake("sess-1").await;
        let request = agent.expect_prompt().await;
        agent.chunk("sess-1", "agent_message_chunk", "one").await;
        agent.respond(&request, json!({"stopReason": "end_turn"})).await;
        agent
    });
    assert_eq!(first.expect("first turn").text(), "one");

    let history = [
        ChatMessage::user("first"),
        ChatMessage::assistant("one"),
        ChatMessage::user("second"),
    ];
    let (second, ()) = tokio::join!(chat.prompt(&key, &history), async {
        let request = agent.expect_prompt().await;
        assert_eq!(FakeAgent::prompt_text(&request), "USER second");
        agent.chunk("sess-1", "agent_message_chunk", "two").await;
        agent.respond(&request, json!({"stopReason": "max_tokens"})).await;
    });

    let second = second.expect("second turn");
    assert_eq!(second.text(), "two");
    assert_eq!(second.stop_reason, "max_tokens");
    assert_eq!(chat.sessions().len(), 1);
    assert!(inbox.try_recv().is_err(), "no second session was created");
}

#[tokio::test]
async fn failed_turn_discards_open_windows() {
    let (chat, mut inbox, mut events) = chat();
    let key = ConversationKey::new("c1");

    let messages = [ChatMessage::user("go")];
    let (result, _agent) = tokio::join!(chat.prompt(&key, &messages), async {
        let mut agent = next_agent(&mut inbox).await;
        agent.handshake("sess-1").await;
        let request = agent.expect_prompt().await;
        agent.chunk("sess-1", "agent_thought_chunk", "half a thought").await;
        agent.chunk("sess-1", "agent_message_chunk", "half a reply").await;
        agent.respond_error(&request, -32603, "model overloaded").await;
        agent
    });

    assert_eq!(
        result.expect_err("turn fails"),
        AppError::Rpc {
            code: -32603,
            message: "model overloaded".into()
        }
    );
    let published = drain(&mut events);
    assert_eq!(published.len(), 1, "the thought flushed before the failure stays");
    let session = chat.sessions().get(&key).expect("registered");
    assert!(session.buffer().open_kinds(&key).is_empty());
    assert!(chat.sessions().contains(&key), "the session survives a failed turn");
}

#[tokio::test]
async fn handshake_failure_registers_nothing() {
    let (chat, mut inbox, _events) = chat();
    let key = ConversationKey::new("c1");

    let messages = [ChatMessage::user("hi")];
    let (result, ()) = tokio::join!(chat.prompt(&key, &messages), async {
        let mut agent = next_agent(&mut inbox).await;
        let init = agent.expect_request("initialize").await;
        agent.respond_error(&init, -32600, "unsupported protocol").await;
    });

    let message = match result {
        Err(AppError::SessionInit(message)) => message,
        other => panic!("expected a session init failure, got {other:?}"),
    };
    assert!(message.contains("failed to initialize ACP session"), "{message}");
    assert!(message.contains("unsupported protocol"), "{message}");
    assert!(chat.sessions().is_empty());

    let messages = [ChatMessage::user("hi")];
    let (retry, _agent) = tokio::join!(chat.prompt(&key, &messages), async {
        let mut agent = next_agent(&mut inbox).await;
        agent.handshake("sess-2").await;
        let request = agent.expect_prompt().await;
        agent.respond(&request, json!({"stopReason": "end_turn"})).await;
        agent
    });
    let retry = retry.expect("second attempt connects");
    assert!(retry.generations.is_empty());
    assert_eq!(chat.sessions().len(), 1);
}

#[tokio::test]
async fn closed_session_is_replaced_with_full_history() {
    let (chat, mut inbox, _events) = chat();
    let key = ConversationKey::new("c1");

    let messages = [ChatMessage::user("first")];
    let (first, agent) = tokio::join!(chat.prompt(&key, &messages), async {
        let mut agent = next_agent(&mut inbox).await;
        agent.handshake("sess-1").await;
        let request = agent.expect_prompt().await;
        agent.respond(&request, json!({"stopReason": "end_turn"})).await;
        agent
    });
    first.expect("first turn");

    let session = chat.sessions().get(&key).expect("registered");
    drop(agent);
    tokio::time::timeout(WAIT, async {
        while session.is_open() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session closed");

    let history = [ChatMessage::user("first"), ChatMessage::user("again")];
    let (second, _agent) = tokio::join!(chat.prompt(&key, &history), async {
        let mut agent = next_agent(&mut inbox).await;
        agent.handshake("sess-2").await;
        let request = agent.expect_prompt().await;
        assert_eq!(FakeAgent::prompt_text(&request), "USER first\nUSER again");
        agent.chunk("sess-2", "agent_message_chunk", "back").await;
        agent.respond(&request, json!({"stopReason": "end_turn"})).await;
        agent
    });

    assert_eq!(second.expect("reconnected turn").text(), "back");
    let current = chat.sessions().get(&key).expect("registered");
    assert_eq!(current.session_id(), "sess-2");
}

#[tokio::test]
async fn end_conversation_closes_the_agent_stream() {
    let (chat, mut inbox, _events) = chat();
    let key = ConversationKey::new("c1");

    let messages = [ChatMessage::user("hi")];
    let (first, mut agent) = tokio::join!(chat.prompt(&key, &messages), async {
        let mut agent = next_agent(&mut inbox).await;
        agent.handshake("sess-1").await;
        let request = agent.expect_prompt().await;
        agent.respond(&request, json!({"stopReason": "end_turn"})).await;
        agent
    });
    first.expect("turn");

    assert!(chat.end_conversation(&key));

    assert!(agent.try_recv().await.is_none(), "agent sees EOF");
    assert!(chat.sessions().is_empty());
    assert!(!chat.end_conversation(&key));
}

#[tokio::test]
async fn idle_sessions_are_replaced_before_the_next_turn() {
    let (chat, mut inbox, _events) = chat();
    let chat = chat.with_idle_ttl(Some(Duration::ZERO));
    let key = ConversationKey::new("c1");

    let messages = [ChatMessage::user("first")];
    let (first, mut old_agent) = tokio::join!(chat.prompt(&key, &messages), async {
        let mut agent = next_agent(&mut inbox).await;
        agent.handshake("sess-1").await;
        let request = agent.expect_prompt().await;
        agent.respond(&request, json!({"stopReason": "end_turn"})).await;
        agent
    });
    first.expect("first turn");

    let history = [ChatMessage::user("first"), ChatMessage::user("second")];
    let (second, _agent) = tokio::join!(chat.prompt(&key, &history), async {
        let mut agent = next_agent(&mut inbox).await;
        agent.handshake("sess-2").await;
        let request = agent.expect_prompt().await;
        assert_eq!(FakeAgent::prompt_text(&request), "USER first\nUSER second");
        agent.respond(&request, json!({"stopReason": "end_turn"})).await;
        agent
    });

    second.expect("second turn");
    assert!(old_agent.try_recv().await.is_none(), "evicted agent sees EOF");
    assert_eq!(chat.evict_idle(), vec![key]);
    assert!(chat.sessions().is_empty());
}
