//! Thin agent client: handshake, session creation, and prompt turns.
//!
//! Request and result payloads stay close to the wire; the bridge only reads
//! the few fields it needs (`sessionId`, `stopReason`).

use std::path::Path;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::acp::protocol::{PendingResponse, Protocol, SubscriptionId};
use crate::acp::update::{ContentBlock, SessionUpdate};
use crate::config::McpServerConfig;
use crate::{AppError, Result};

/// Protocol version this client speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Client name sent in `initialize`.
pub const CLIENT_NAME: &str = "acp-bridge";

/// Agent client over a started [`Protocol`].
#[derive(Debug, Clone)]
pub struct AcpClient {
    protocol: Protocol,
}

impl AcpClient {
    /// Wrap a started protocol.
    #[must_use]
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }

    /// The underlying protocol.
    #[must_use]
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// `initialize`: declare file-system and terminal capabilities.
    ///
    /// Returns the agent's raw initialize result.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Rpc`] or [`AppError::Transport`] from the request.
    pub async fn initialize(&self) -> Result<Value> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientCapabilities": {
                "fs": { "readTextFile": true, "writeTextFile": true },
                "terminal": true
            },
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let result = self.protocol.request("initialize", params).await?;
        info!(
            agent_protocol = ?result.get("protocolVersion").and_then(serde_json::Value::as_u64),
            "agent initialized"
        );
        Ok(result)
    }

    /// `authenticate` with the given method id.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Rpc`] or [`AppError::Transport`] from the request.
    pub async fn authenticate(&self, method_id: &str) -> Result<()> {
        self.protocol
            .request("authenticate", json!({ "methodId": method_id }))
            .await?;
        debug!(method_id, "agent authenticated");
        Ok(())
    }

    /// `session/new`; returns the agent's session id.
    ///
    /// # Errors
    ///
    /// - [`AppError::Rpc`] / [`AppError::Transport`] from the request.
    /// - [`AppError::Decode`] if the result has no `sessionId`.
    pub async fn new_session(&self, cwd: &Path, mcp_servers: &[McpServerConfig]) -> Result<String> {
        let servers: Vec<Value> = mcp_servers.iter().map(mcp_server_json).collect();
        let result = self
            .protocol
            .request(
                "session/new",
                json!({ "cwd": cwd.display().to_string(), "mcpServers": servers }),
            )
            .await?;

        let session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Decode("session/new result missing sessionId".into()))?
            .to_owned();
        info!(session_id = %session_id, cwd = %cwd.display(), "agent session created");
        Ok(session_id)
    }

    /// `session/prompt`: submit `prompt` and stream the turn.
    ///
    /// The update subscription is registered before the request is sent, so
    /// no update of this turn is missed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] if the request cannot be sent.
    pub fn prompt(&self, session_id: &str, prompt: Vec<ContentBlock>) -> Result<PromptTurn> {
        let (subscription, updates) = self.protocol.subscribe_tracked(session_id);
        let params = json!({ "sessionId": session_id, "prompt": prompt });
        let response = match self.protocol.start_request("session/prompt", params) {
            Ok(response) => response,
            Err(err) => {
                self.protocol.unsubscribe_if(session_id, subscription);
                return Err(err);
            }
        };
        debug!(session_id, "prompt submitted");
        Ok(PromptTurn {
            protocol: self.protocol.clone(),
            session_id: session_id.to_owned(),
            subscription,
            updates,
            updates_closed: false,
            state: TurnState::Running(response),
        })
    }

    /// `session/cancel`: ask the agent to stop the running turn.
    pub fn cancel(&self, session_id: &str) {
        self.protocol
            .notify("session/cancel", json!({ "sessionId": session_id }));
    }
}

fn mcp_server_json(server: &McpServerConfig) -> Value {
    let headers: Vec<Value> = server
        .headers
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    json!({
        "type": "http",
        "name": server.name,
        "url": server.url,
        "headers": headers
    })
}

// ── PromptTurn ────────────────────────────────────────────────────────────────

enum TurnState {
    Running(PendingResponse),
    Finished(Result<String>),
}

/// One running prompt turn.
///
/// Yields the turn's updates in arrival order, then ends once the
/// `session/prompt` response has arrived and every update before it has
/// been handed out.
pub struct PromptTurn {
    protocol: Protocol,
    session_id: String,
    subscription: SubscriptionId,
    updates: mpsc::UnboundedReceiver<SessionUpdate>,
    updates_closed: bool,
    state: TurnState,
}

impl std::fmt::Debug for PromptTurn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptTurn")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl PromptTurn {
    /// Agent session of this turn.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next update, or `Ok(None)` once the turn has completed.
    ///
    /// # Errors
    ///
    /// Returns the prompt request's failure ([`AppError::Rpc`] or
    /// [`AppError::Transport`]) after all earlier updates were returned.
    pub async fn next_update(&mut self) -> Result<Option<SessionUpdate>> {
        loop {
            let response = match &mut self.state {
                TurnState::Finished(outcome) => {
                    if let Ok(update) = self.updates.try_recv() {
                        return Ok(Some(update));
                    }
                    return outcome.clone().map(|_| None);
                }
                TurnState::Running(response) => response,
            };

            let outcome = tokio::select! {
                biased;

                update = self.updates.recv(), if !self.updates_closed => {
                    match update {
                        Some(update) => return Ok(Some(update)),
                        None => {
                            self.updates_closed = true;
                            continue;
                        }
                    }
                }

                outcome = response => outcome,
            };

            let finished = match outcome {
                Ok(Ok(result)) => Ok(stop_reason(&result)),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(AppError::Transport("session/prompt: response abandoned".into())),
            };
            debug!(session_id = %self.session_id, ?finished, "prompt turn finished");
            self.state = TurnState::Finished(finished);
        }
    }

    /// Stop reason once the turn completed successfully.
    #[must_use]
    pub fn stop_reason(&self) -> Option<&str> {
        match &self.state {
            TurnState::Finished(Ok(reason)) => Some(reason),
            _ => None,
        }
    }
}

impl Drop for PromptTurn {
    fn drop(&mut self) {
        // A newer turn on the same session keeps its own subscription.
        self.protocol.unsubscribe_if(&self.session_id, self.subscription);
    }
}

fn stop_reason(result: &Value) -> String {
    result
        .get("stopReason")
        .and_then(Value::as_str)
        .unwrap_or("end_turn")
        .to_owned()
}
