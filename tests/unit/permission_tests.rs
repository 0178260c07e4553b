//! Unit tests for the permission gate.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use acp_bridge::acp::permission::{PermissionGate, PermissionOutcome, PermissionPrompt};
use acp_bridge::event_bus::EventBus;
use acp_bridge::models::conversation::ConversationKey;
use acp_bridge::models::event::{EventPayload, PermissionOption};

fn options() -> Vec<PermissionOption> {
    vec![
        PermissionOption {
            option_id: "allow".into(),
            name: "Allow once".into(),
            kind: "allow_once".into(),
        },
        PermissionOption {
            option_id: "reject".into(),
            name: "Reject".into(),
            kind: "reject_once".into(),
        },
    ]
}

fn prompt(tool_call_id: Option<&str>) -> PermissionPrompt {
    PermissionPrompt {
        session_id: "sess-1".into(),
        tool_call_id: tool_call_id.map(str::to_owned),
        title: Some("Run tests".into()),
        options: options(),
    }
}

#[tokio::test]
async fn request_publishes_event_and_resolves_with_selection() {
    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let gate = PermissionGate::new(Arc::new(bus));
    let key = ConversationKey::new("conv");

    let waiter = {
        let gate = gate.clone();
        let key = key.clone();
        tokio::spawn(async move { gate.request(&key, prompt(Some("call-7"))).await })
    };

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event in time")
        .expect("event");
    let EventPayload::PermissionRequested(request) = event.payload else {
        panic!("expected a permission request");
    };
    assert_eq!(request.request_id, "call-7");
    assert_eq!(request.session_id, "sess-1");
    assert_eq!(request.options.len(), 2);
    assert_eq!(event.conversation, key);

    assert!(gate.resolve_selected("call-7", "allow").await);

    let outcome = waiter.await.expect("join");
    assert_eq!(
        outcome,
        PermissionOutcome::Selected {
            option_id: "allow".into()
        }
    );
    assert!(gate.pending_ids().await.is_empty());
}

#[tokio::test]
async fn option_not_offered_resolves_as_cancelled() {
    let gate = PermissionGate::new(Arc::new(EventBus::new()));
    let key = ConversationKey::new("conv");

    let (id, rx) = gate.publish_request(&key, prompt(Some("call-1"))).await;
    assert!(gate.resolve_selected(&id, "allow_everything").await);

    assert_eq!(gate.await_response(&id, rx).await, PermissionOutcome::Cancelled);
}

#[tokio::test]
async fn explicit_cancel_resolves_as_cancelled() {
    let gate = PermissionGate::new(Arc::new(EventBus::new()));
    let key = ConversationKey::new("conv");

    let (id, rx) = gate.publish_request(&key, prompt(None)).await;
    assert!(gate.resolve_cancelled(&id).await);

    assert_eq!(gate.await_response(&id, rx).await, PermissionOutcome::Cancelled);
}

#[tokio::test]
async fn unknown_request_ids_are_reported() {
    let gate = PermissionGate::new(Arc::new(EventBus::new()));

    assert!(!gate.resolve_selected("nope", "allow").await);
    assert!(!gate.resolve_cancelled("nope").await);
}

#[tokio::test]
async fn duplicate_tool_call_ids_get_distinct_request_ids() {
    let gate = PermissionGate::new(Arc::new(EventBus::new()));
    let key = ConversationKey::new("conv");

    let (first, _rx1) = gate.publish_request(&key, prompt(Some("same"))).await;
    let (second, _rx2) = gate.publish_request(&key, prompt(Some("same"))).await;

    assert_eq!(first, "same");
    assert_ne!(second, first);
    let mut pending = gate.pending_ids().await;
    pending.sort();
    assert_eq!(pending.len(), 2);
}

#[test]
fn outcome_wire_shape() {
    let selected = serde_json::to_value(PermissionOutcome::Selected {
        option_id: "allow".into(),
    })
    .expect("serialize");
    let cancelled = serde_json::to_value(PermissionOutcome::Cancelled).expect("serialize");

    assert_eq!(selected, json!({"outcome": "selected", "optionId": "allow"}));
    assert_eq!(cancelled, json!({"outcome": "cancelled"}));
}
