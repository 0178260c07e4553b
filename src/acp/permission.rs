//! Permission gate for agent tool-call approvals.
//!
//! The agent asks via `session/request_permission`. The gate publishes a
//! [`PermissionRequested`](crate::models::event::EventPayload::PermissionRequested)
//! event and parks the request until an operator answers through
//! [`PermissionGate::resolve_selected`] or
//! [`PermissionGate::resolve_cancelled`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event_bus::EventSink;
use crate::models::conversation::ConversationKey;
use crate::models::event::{DomainEvent, EventPayload, PermissionOption, PermissionRequestEvent};

/// Answer to a permission request, in wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PermissionOutcome {
    /// The operator picked one of the offered options.
    Selected {
        /// Chosen option id.
        #[serde(rename = "optionId")]
        option_id: String,
    },
    /// No choice was made.
    Cancelled,
}

/// What a caller needs to raise a permission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionPrompt {
    /// Agent-side session.
    pub session_id: String,
    /// Tool call the request is about.
    pub tool_call_id: Option<String>,
    /// Tool call title.
    pub title: Option<String>,
    /// Offered options.
    pub options: Vec<PermissionOption>,
}

struct PendingPermission {
    options: Vec<PermissionOption>,
    tx: oneshot::Sender<PermissionOutcome>,
}

/// Publishes permission requests and awaits correlated answers.
///
/// Cheap to clone; clones share the pending map.
#[derive(Clone)]
pub struct PermissionGate {
    sink: Arc<dyn EventSink>,
    pending: Arc<Mutex<HashMap<String, PendingPermission>>>,
}

impl std::fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGate").finish_non_exhaustive()
    }
}

impl PermissionGate {
    /// Gate publishing requests to `sink`.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publish a request and wait for its answer.
    ///
    /// The request id is the tool call id when it is not already pending,
    /// otherwise a fresh UUID. If the gate drops the request without an
    /// answer the outcome is [`PermissionOutcome::Cancelled`].
    pub async fn request(
        &self,
        conversation: &ConversationKey,
        prompt: PermissionPrompt,
    ) -> PermissionOutcome {
        let (request_id, rx) = self.publish_request(conversation, prompt).await;
        self.await_response(&request_id, rx).await
    }

    /// Sink the gate publishes to.
    #[must_use]
    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.sink)
    }

    /// Register and publish a request; returns its id and answer channel.
    pub async fn publish_request(
        &self,
        conversation: &ConversationKey,
        prompt: PermissionPrompt,
    ) -> (String, oneshot::Receiver<PermissionOutcome>) {
        let (tx, rx) = oneshot::channel();

        let request_id = {
            let mut pending = self.pending.lock().await;
            let request_id = match &prompt.tool_call_id {
                Some(id) if !pending.contains_key(id) => id.clone(),
                _ => Uuid::new_v4().to_string(),
            };
            pending.insert(
                request_id.clone(),
                PendingPermission {
                    options: prompt.options.clone(),
                    tx,
                },
            );
            request_id
        };

        info!(
            conversation = %conversation,
            request_id = %request_id,
            session_id = %prompt.session_id,
            options = prompt.options.len(),
            "permission requested"
        );

        self.sink.publish(DomainEvent::new(
            conversation.clone(),
            EventPayload::PermissionRequested(PermissionRequestEvent {
                request_id: request_id.clone(),
                session_id: prompt.session_id,
                tool_call_id: prompt.tool_call_id,
                title: prompt.title,
                options: prompt.options,
            }),
        ));

        (request_id, rx)
    }

    /// Wait for the answer to a published request.
    pub async fn await_response(
        &self,
        request_id: &str,
        rx: oneshot::Receiver<PermissionOutcome>,
    ) -> PermissionOutcome {
        if let Ok(outcome) = rx.await {
            debug!(request_id, ?outcome, "permission resolved");
            outcome
        } else {
            warn!(request_id, "permission request dropped without answer");
            self.pending.lock().await.remove(request_id);
            PermissionOutcome::Cancelled
        }
    }

    /// Answer `request_id` with `option_id`.
    ///
    /// An option that was not offered resolves the request as cancelled.
    /// Returns `false` if no such request is pending.
    pub async fn resolve_selected(&self, request_id: &str, option_id: &str) -> bool {
        let Some(entry) = self.pending.lock().await.remove(request_id) else {
            debug!(request_id, "no pending permission request");
            return false;
        };

        let outcome = if entry.options.iter().any(|o| o.option_id == option_id) {
            PermissionOutcome::Selected {
                option_id: option_id.to_owned(),
            }
        } else {
            warn!(request_id, option_id, "option was not offered, cancelling");
            PermissionOutcome::Cancelled
        };

        if entry.tx.send(outcome).is_err() {
            debug!(request_id, "permission requester already gone");
        }
        true
    }

    /// Answer `request_id` as cancelled. Returns `false` if not pending.
    pub async fn resolve_cancelled(&self, request_id: &str) -> bool {
        let Some(entry) = self.pending.lock().await.remove(request_id) else {
            debug!(request_id, "no pending permission request");
            return false;
        };
        if entry.tx.send(PermissionOutcome::Cancelled).is_err() {
            debug!(request_id, "permission requester already gone");
        }
        true
    }

    /// Ids of requests awaiting an answer.
    pub async fn pending_ids(&self) -> Vec<String> {
        self.pending.lock().await.keys().cloned().collect()
    }
}
