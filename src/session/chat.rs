//! Chat driver: conversation messages in, generations and events out.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::acp::permission::PermissionGate;
use crate::acp::update::ContentBlock;
use crate::config::BridgeConfig;
use crate::event_bus::EventSink;
use crate::models::conversation::ConversationKey;
use crate::session::context::SessionContext;
use crate::session::registry::SessionRegistry;
use crate::stream::{translate, ChatGeneration, OutputUnit};
use crate::Result;

// ── Messages ──────────────────────────────────────────────────────────────────

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatRole {
    /// Instructions for the agent.
    System,
    /// Human input.
    User,
    /// Earlier model output.
    Assistant,
    /// Tool results; never forwarded to the agent.
    Tool,
}

impl ChatRole {
    /// Upper-case role label used in the prompt text.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "SYSTEM",
            Self::User => "USER",
            Self::Assistant => "ASSISTANT",
            Self::Tool => "TOOL",
        }
    }
}

impl Display for ChatRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author.
    pub role: ChatRole,
    /// Plain text body.
    pub text: String,
}

impl ChatMessage {
    /// Message with an explicit role.
    #[must_use]
    pub fn new(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    /// `USER` message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(ChatRole::User, text)
    }

    /// `SYSTEM` message.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(ChatRole::System, text)
    }

    /// `ASSISTANT` message.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, text)
    }
}

/// Render messages as `"<ROLE> <text>"` lines; tool messages are skipped.
#[must_use]
pub fn format_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.role != ChatRole::Tool)
        .map(|m| format!("{} {}", m.role, m.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result of one completed prompt turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResponse {
    /// Message generations in flush order.
    pub generations: Vec<ChatGeneration>,
    /// Agent stop reason.
    pub stop_reason: String,
}

impl ChatResponse {
    /// All generation texts concatenated.
    #[must_use]
    pub fn text(&self) -> String {
        self.generations.iter().map(|g| g.text.as_str()).collect()
    }
}

// ── Connector ─────────────────────────────────────────────────────────────────

/// Future returned by [`SessionConnector::connect`].
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<SessionContext>> + Send + 'a>>;

/// Builds the session context for a conversation.
pub trait SessionConnector: Send + Sync {
    /// Open a new session for `conversation`.
    fn connect<'a>(
        &'a self,
        conversation: &'a ConversationKey,
        permissions: PermissionGate,
    ) -> ConnectFuture<'a>;
}

/// Connector spawning the configured agent process.
#[derive(Debug, Clone)]
pub struct AgentConnector {
    config: Arc<BridgeConfig>,
}

impl AgentConnector {
    /// Connector for agents described by `config`.
    #[must_use]
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        Self { config }
    }
}

impl SessionConnector for AgentConnector {
    fn connect<'a>(
        &'a self,
        conversation: &'a ConversationKey,
        permissions: PermissionGate,
    ) -> ConnectFuture<'a> {
        Box::pin(SessionContext::connect(
            &self.config,
            conversation.clone(),
            permissions,
        ))
    }
}

// ── AcpChat ───────────────────────────────────────────────────────────────────

/// Drives prompt turns for many conversations over per-conversation sessions.
pub struct AcpChat {
    connector: Arc<dyn SessionConnector>,
    sessions: SessionRegistry<SessionContext>,
    permissions: PermissionGate,
    idle_ttl: Option<Duration>,
}

impl std::fmt::Debug for AcpChat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcpChat")
            .field("sessions", &self.sessions)
            .field("idle_ttl", &self.idle_ttl)
            .finish_non_exhaustive()
    }
}

impl AcpChat {
    /// Chat driver spawning agents from `config`, publishing to `sink`.
    #[must_use]
    pub fn new(config: Arc<BridgeConfig>, sink: Arc<dyn EventSink>) -> Self {
        let idle_ttl = config.sessions.idle_ttl();
        Self::with_connector(Arc::new(AgentConnector::new(config)), sink).with_idle_ttl(idle_ttl)
    }

    /// Chat driver using a custom session connector.
    #[must_use]
    pub fn with_connector(connector: Arc<dyn SessionConnector>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            connector,
            sessions: SessionRegistry::new(),
            permissions: PermissionGate::new(sink),
            idle_ttl: None,
        }
    }

    /// Close sessions unused for longer than `ttl` before each turn.
    #[must_use]
    pub fn with_idle_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.idle_ttl = ttl;
        self
    }

    /// Session registry.
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry<SessionContext> {
        &self.sessions
    }

    /// Permission gate answering the agents' permission requests.
    #[must_use]
    pub fn permissions(&self) -> &PermissionGate {
        &self.permissions
    }

    /// Run one prompt turn for `conversation`.
    ///
    /// A new session receives the whole `messages` list, an existing one
    /// only the last message. Non-message windows are published to the
    /// event sink as they flush; message windows become generations.
    ///
    /// # Errors
    ///
    /// - [`AppError::SessionInit`](crate::AppError::SessionInit) if the
    ///   session cannot be created.
    /// - The turn's failure ([`AppError::Rpc`](crate::AppError::Rpc) or
    ///   [`AppError::Transport`](crate::AppError::Transport)); windows still
    ///   open at that point are discarded.
    pub async fn prompt(
        &self,
        conversation: &ConversationKey,
        messages: &[ChatMessage],
    ) -> Result<ChatResponse> {
        self.evict_idle();
        let (session, fresh) = self.session_for(conversation).await?;

        let to_send = if fresh {
            messages
        } else {
            messages.last().map_or(messages, std::slice::from_ref)
        };
        let text = format_prompt(to_send);
        debug!(
            conversation = %conversation,
            fresh,
            messages = to_send.len(),
            "submitting prompt"
        );

        let mut generations = Vec::new();
        match self
            .run_turn(&session, conversation, text, &mut generations)
            .await
        {
            Ok(stop_reason) => {
                collect(session.buffer().flush_all(conversation), &mut generations);
                info!(
                    conversation = %conversation,
                    stop_reason = %stop_reason,
                    generations = generations.len(),
                    "prompt turn completed"
                );
                Ok(ChatResponse {
                    generations,
                    stop_reason,
                })
            }
            Err(err) => {
                let dropped = session.buffer().discard_all(conversation);
                warn!(conversation = %conversation, %err, dropped, "prompt turn failed");
                Err(err)
            }
        }
    }

    /// Close and forget the session of `conversation`.
    pub fn end_conversation(&self, conversation: &ConversationKey) -> bool {
        self.sessions.remove(conversation)
    }

    /// Close sessions idle past the configured TTL. No-op without a TTL.
    pub fn evict_idle(&self) -> Vec<ConversationKey> {
        let Some(ttl) = self.idle_ttl else {
            return Vec::new();
        };
        self.sessions.evict_idle(ttl)
    }

    async fn session_for(&self, conversation: &ConversationKey) -> Result<(Arc<SessionContext>, bool)> {
        if let Some(existing) = self.sessions.get(conversation) {
            if existing.is_open() {
                return Ok((existing, false));
            }
            info!(conversation = %conversation, "session transport closed, reconnecting");
            self.sessions.remove(conversation);
        }

        let mut constructed = false;
        let session = self
            .sessions
            .get_or_create(conversation, || {
                constructed = true;
                self.connector.connect(conversation, self.permissions.clone())
            })
            .await?;
        Ok((session, constructed))
    }

    async fn run_turn(
        &self,
        session: &SessionContext,
        conversation: &ConversationKey,
        text: String,
        generations: &mut Vec<ChatGeneration>,
    ) -> Result<String> {
        let mut turn = session.prompt(vec![ContentBlock::text(text)])?;
        while let Some(update) = turn.next_update().await? {
            collect(translate(&update, conversation, session.buffer()), generations);
        }
        Ok(turn.stop_reason().unwrap_or_default().to_owned())
    }
}

fn collect(units: Vec<OutputUnit>, generations: &mut Vec<ChatGeneration>) {
    generations.extend(units.into_iter().filter_map(|unit| match unit {
        OutputUnit::Generation(generation) => Some(generation),
        OutputUnit::Published { .. } => None,
    }));
}
