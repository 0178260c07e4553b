//! One live agent session bound to a conversation.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tracing::{debug, info};

use crate::acp::client::{AcpClient, PromptTurn};
use crate::acp::operations::{ClientOperations, LocalOperations};
use crate::acp::permission::PermissionGate;
use crate::acp::protocol::Protocol;
use crate::acp::spawner::spawn_agent;
use crate::acp::transport::{Transport, TransportOptions, TransportState};
use crate::acp::update::ContentBlock;
use crate::config::BridgeConfig;
use crate::models::conversation::ConversationKey;
use crate::session::registry::ManagedSession;
use crate::stream::StreamWindowBuffer;
use crate::sync::lock;
use crate::{AppError, Result};

/// Transport, client, stream windows and agent session of one conversation.
///
/// Closing the context (or dropping it) closes the transport, kills the
/// terminals the agent created, and drops any open window. The agent
/// process is killed with it.
pub struct SessionContext {
    conversation: ConversationKey,
    session_id: String,
    client: AcpClient,
    transport: Transport,
    operations: Arc<LocalOperations>,
    buffer: StreamWindowBuffer,
    child: Mutex<Option<Child>>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("conversation", &self.conversation)
            .field("session_id", &self.session_id)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// Spawn the configured agent and open a session on it.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::SessionInit`] wrapping the first failure of
    /// spawning, handshake, authentication, or `session/new`.
    pub async fn connect(
        config: &BridgeConfig,
        conversation: ConversationKey,
        permissions: PermissionGate,
    ) -> Result<Self> {
        let spawned = spawn_agent(config, &conversation).map_err(init_error)?;
        let transport = Transport::new(
            format!("agent-{conversation}"),
            spawned.stdout,
            spawned.stdin,
            TransportOptions::from_config(config),
        );
        let mut context = Self::handshake(config, conversation, transport, permissions).await?;
        context.child = Mutex::new(Some(spawned.child));
        Ok(context)
    }

    /// Open a session over already connected agent streams.
    ///
    /// `input` carries agent output, `output` carries agent input.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn attach<R, W>(
        config: &BridgeConfig,
        conversation: ConversationKey,
        input: R,
        output: W,
        permissions: PermissionGate,
    ) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let transport = Transport::new(
            format!("agent-{conversation}"),
            input,
            output,
            TransportOptions::from_config(config),
        );
        Self::handshake(config, conversation, transport, permissions).await
    }

    async fn handshake(
        config: &BridgeConfig,
        conversation: ConversationKey,
        transport: Transport,
        permissions: PermissionGate,
    ) -> Result<Self> {
        let buffer = StreamWindowBuffer::new(permissions.sink());
        let operations = Arc::new(LocalOperations::new(conversation.clone(), permissions));
        let outcome = open_session(config, &transport, Arc::clone(&operations)).await;
        match outcome {
            Ok((client, session_id)) => {
                info!(conversation = %conversation, session_id = %session_id, "session context ready");
                Ok(Self {
                    conversation,
                    session_id,
                    client,
                    transport,
                    operations,
                    buffer,
                    child: Mutex::new(None),
                })
            }
            Err(err) => {
                transport.close();
                operations.shutdown();
                Err(init_error(err))
            }
        }
    }

    /// Conversation this session belongs to.
    #[must_use]
    pub fn conversation(&self) -> &ConversationKey {
        &self.conversation
    }

    /// Agent-side session id.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Agent client.
    #[must_use]
    pub fn client(&self) -> &AcpClient {
        &self.client
    }

    /// Transport state.
    #[must_use]
    pub fn state(&self) -> TransportState {
        self.transport.state()
    }

    /// Whether the transport is still usable.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Local operations serving agent requests of this session.
    #[must_use]
    pub fn operations(&self) -> &LocalOperations {
        &self.operations
    }

    /// Stream windows of this session's turns.
    #[must_use]
    pub fn buffer(&self) -> &StreamWindowBuffer {
        &self.buffer
    }

    /// Submit `prompt` to the agent session.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] if the transport is closed.
    pub fn prompt(&self, prompt: Vec<ContentBlock>) -> Result<PromptTurn> {
        self.client.prompt(&self.session_id, prompt)
    }

    /// Ask the agent to cancel the running turn.
    pub fn cancel(&self) {
        self.client.cancel(&self.session_id);
    }

    /// Close the transport, stop local operations, drop open windows and
    /// kill the agent process. Idempotent.
    pub fn close(&self) {
        self.transport.close();
        self.operations.shutdown();
        let dropped = self.buffer.discard_all(&self.conversation);
        if dropped > 0 {
            debug!(conversation = %self.conversation, dropped, "discarded open windows on close");
        }
        if let Some(mut child) = lock(&self.child).take() {
            if let Err(err) = child.start_kill() {
                debug!(conversation = %self.conversation, %err, "agent already exited");
            }
        }
    }
}

impl ManagedSession for SessionContext {
    fn close(&self) {
        SessionContext::close(self);
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.transport.close();
        self.operations.shutdown();
    }
}

async fn open_session(
    config: &BridgeConfig,
    transport: &Transport,
    operations: Arc<LocalOperations>,
) -> Result<(AcpClient, String)> {
    let protocol = Protocol::start(transport.clone(), operations)?;
    let client = AcpClient::new(protocol);
    client.initialize().await?;
    if let Some(method_id) = &config.auth_method {
        client.authenticate(method_id).await?;
    }
    let cwd: PathBuf = config.resolved_working_directory()?;
    let session_id = client.new_session(&cwd, &config.mcp_servers).await?;
    Ok((client, session_id))
}

fn init_error(err: AppError) -> AppError {
    match err {
        AppError::SessionInit(_) => err,
        other => AppError::SessionInit(format!("failed to initialize ACP session: {other}")),
    }
}
