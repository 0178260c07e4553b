//! Agent-initiated client operations.
//!
//! While a turn runs the agent calls back into the client for permission,
//! file access, and terminals. [`dispatch`] maps those JSON-RPC requests
//! onto a [`ClientOperations`] implementation; [`LocalOperations`] serves
//! them from the local machine.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::codec::{BytesCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::acp::message::RpcError;
use crate::acp::permission::{PermissionGate, PermissionOutcome, PermissionPrompt};
use crate::models::conversation::ConversationKey;
use crate::models::event::PermissionOption;
use crate::sync::lock;
use crate::{AppError, Result};

/// Content returned for a path that does not exist.
pub const MISSING_PATH_CONTENT: &str = "Path did not exist.";

/// Boxed future returned by [`ClientOperations`] methods.
pub type OpFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

// ── Request params ────────────────────────────────────────────────────────────

/// Tool call summary inside a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionToolCall {
    /// Tool call id.
    pub tool_call_id: String,
    /// Title.
    #[serde(default)]
    pub title: Option<String>,
}

/// `session/request_permission` params.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPermissionParams {
    /// Agent-side session.
    pub session_id: String,
    /// Tool call awaiting approval.
    pub tool_call: PermissionToolCall,
    /// Offered options.
    #[serde(default)]
    pub options: Vec<PermissionOption>,
}

/// `fs/read_text_file` params.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadTextFileParams {
    /// Agent-side session.
    pub session_id: String,
    /// File to read.
    pub path: PathBuf,
    /// 1-based first line.
    #[serde(default)]
    pub line: Option<usize>,
    /// Maximum number of lines.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `fs/write_text_file` params.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteTextFileParams {
    /// Agent-side session.
    pub session_id: String,
    /// File to write.
    pub path: PathBuf,
    /// New content.
    pub content: String,
}

/// Environment variable for a terminal command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EnvVariable {
    /// Name.
    pub name: String,
    /// Value.
    pub value: String,
}

/// `terminal/create` params.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalParams {
    /// Agent-side session.
    pub session_id: String,
    /// Program to run.
    pub command: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment.
    #[serde(default)]
    pub env: Vec<EnvVariable>,
    /// Working directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Retain at most this many bytes of output, dropping the oldest.
    #[serde(default)]
    pub output_byte_limit: Option<usize>,
}

/// Params of the terminal calls that only name a terminal.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalParams {
    /// Agent-side session.
    pub session_id: String,
    /// Terminal id from `terminal/create`.
    pub terminal_id: String,
}

/// Exit status of a terminal command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalExitStatus {
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal, if any.
    pub signal: Option<String>,
}

/// `terminal/output` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutput {
    /// Output captured so far.
    pub output: String,
    /// Whether older output was dropped.
    pub truncated: bool,
    /// Exit status once the command finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<TerminalExitStatus>,
}

// ── Trait ─────────────────────────────────────────────────────────────────────

/// Handler for agent-initiated requests.
pub trait ClientOperations: Send + Sync {
    /// Ask for approval of a tool call.
    fn request_permission(&self, params: RequestPermissionParams) -> OpFuture<'_, PermissionOutcome>;

    /// Read a text file.
    fn read_text_file(&self, params: ReadTextFileParams) -> OpFuture<'_, String>;

    /// Write a text file.
    fn write_text_file(&self, params: WriteTextFileParams) -> OpFuture<'_, ()>;

    /// Start a command; returns its terminal id.
    fn create_terminal(&self, params: CreateTerminalParams) -> OpFuture<'_, String>;

    /// Output captured so far.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown terminal id.
    fn terminal_output(&self, terminal_id: String) -> OpFuture<'_, TerminalOutput>;

    /// Wait for the command to finish.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown terminal id.
    fn wait_for_terminal_exit(&self, terminal_id: String) -> OpFuture<'_, TerminalExitStatus>;

    /// Kill the command, keeping the terminal.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown terminal id.
    fn kill_terminal(&self, terminal_id: String) -> OpFuture<'_, ()>;

    /// Kill the command and forget the terminal.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown terminal id.
    fn release_terminal(&self, terminal_id: String) -> OpFuture<'_, ()>;

    /// The connection is gone: cancel outstanding permission requests and
    /// stop every terminal. Called at least once; must be idempotent.
    fn shutdown(&self) {}
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Serve one agent request.
///
/// # Errors
///
/// - `-32601` for methods this client does not support.
/// - `-32602` when params do not match the method.
/// - `-32603` when the handler fails.
pub async fn dispatch(
    ops: &dyn ClientOperations,
    method: &str,
    params: Option<Value>,
) -> std::result::Result<Value, RpcError> {
    let outcome = match method {
        "session/request_permission" => {
            let outcome = ops.request_permission(parse(params)?).await;
            outcome.map(|o| json!({ "outcome": o }))
        }
        "fs/read_text_file" => ops
            .read_text_file(parse(params)?)
            .await
            .map(|content| json!({ "content": content })),
        "fs/write_text_file" => ops.write_text_file(parse(params)?).await.map(|()| json!({})),
        "terminal/create" => ops
            .create_terminal(parse(params)?)
            .await
            .map(|id| json!({ "terminalId": id })),
        "terminal/output" => {
            let p: TerminalParams = parse(params)?;
            ops.terminal_output(p.terminal_id).await.and_then(to_value)
        }
        "terminal/wait_for_exit" => {
            let p: TerminalParams = parse(params)?;
            ops.wait_for_terminal_exit(p.terminal_id).await.and_then(to_value)
        }
        "terminal/kill" => {
            let p: TerminalParams = parse(params)?;
            ops.kill_terminal(p.terminal_id).await.map(|()| json!({}))
        }
        "terminal/release" => {
            let p: TerminalParams = parse(params)?;
            ops.release_terminal(p.terminal_id).await.map(|()| json!({}))
        }
        other => {
            return Err(RpcError::new(
                RpcError::METHOD_NOT_FOUND,
                format!("Method not supported: {other}"),
            ))
        }
    };

    outcome.map_err(|err| RpcError::new(RpcError::INTERNAL_ERROR, err.to_string()))
}

fn parse<T: DeserializeOwned>(params: Option<Value>) -> std::result::Result<T, RpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| RpcError::new(RpcError::INVALID_PARAMS, format!("invalid params: {e}")))
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

// ── LocalOperations ───────────────────────────────────────────────────────────

/// [`ClientOperations`] served from the local machine.
///
/// Permission requests go through the shared [`PermissionGate`]; files and
/// terminals are local to the bridge process. After
/// [`shutdown`](ClientOperations::shutdown) pending permission requests
/// resolve as cancelled and no new terminal can be created.
#[derive(Clone)]
pub struct LocalOperations {
    conversation: ConversationKey,
    permissions: PermissionGate,
    terminals: Arc<Mutex<HashMap<String, Arc<LocalTerminal>>>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for LocalOperations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalOperations")
            .field("conversation", &self.conversation)
            .finish_non_exhaustive()
    }
}

impl LocalOperations {
    /// Operations for one conversation.
    pub fn new(conversation: ConversationKey, permissions: PermissionGate) -> Self {
        Self {
            conversation,
            permissions,
            terminals: Arc::new(Mutex::new(HashMap::new())),
            closed: CancellationToken::new(),
        }
    }

    /// Whether [`shutdown`](ClientOperations::shutdown) has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of live terminals.
    #[must_use]
    pub fn terminal_count(&self) -> usize {
        lock(&self.terminals).len()
    }

    fn terminal(&self, terminal_id: &str) -> Result<Arc<LocalTerminal>> {
        lock(&self.terminals)
            .get(terminal_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Terminal not found: {terminal_id}")))
    }
}

impl ClientOperations for LocalOperations {
    fn request_permission(&self, params: RequestPermissionParams) -> OpFuture<'_, PermissionOutcome> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Ok(PermissionOutcome::Cancelled);
            }
            let prompt = PermissionPrompt {
                session_id: params.session_id,
                tool_call_id: Some(params.tool_call.tool_call_id),
                title: params.tool_call.title,
                options: params.options,
            };
            let (request_id, rx) = self.permissions.publish_request(&self.conversation, prompt).await;
            tokio::select! {
                outcome = self.permissions.await_response(&request_id, rx) => Ok(outcome),
                () = self.closed.cancelled() => {
                    self.permissions.resolve_cancelled(&request_id).await;
                    debug!(
                        conversation = %self.conversation,
                        request_id = %request_id,
                        "permission request cancelled by shutdown"
                    );
                    Ok(PermissionOutcome::Cancelled)
                }
            }
        })
    }

    fn read_text_file(&self, params: ReadTextFileParams) -> OpFuture<'_, String> {
        Box::pin(async move {
            if params.path.as_os_str().is_empty() || !params.path.exists() {
                return Ok(MISSING_PATH_CONTENT.to_owned());
            }

            let text = tokio::fs::read_to_string(&params.path).await.map_err(|e| {
                AppError::Io(format!("failed to read {}: {e}", params.path.display()))
            })?;

            if params.line.is_none() && params.limit.is_none() {
                return Ok(text);
            }
            Ok(slice_lines(&text, params.line, params.limit))
        })
    }

    fn write_text_file(&self, params: WriteTextFileParams) -> OpFuture<'_, ()> {
        Box::pin(async move {
            tokio::fs::write(&params.path, params.content.as_bytes())
                .await
                .map_err(|e| AppError::Io(format!("failed to write {}: {e}", params.path.display())))?;
            debug!(path = %params.path.display(), "wrote text file");
            Ok(())
        })
    }

    fn create_terminal(&self, params: CreateTerminalParams) -> OpFuture<'_, String> {
        Box::pin(async move {
            let terminal = LocalTerminal::spawn(&params)?;
            let terminal_id = Uuid::new_v4().to_string();
            {
                // Checked under the map lock so shutdown's drain sees it.
                let mut terminals = lock(&self.terminals);
                if self.closed.is_cancelled() {
                    terminal.kill();
                    return Err(AppError::IllegalState("session is shut down".into()));
                }
                terminals.insert(terminal_id.clone(), Arc::new(terminal));
            }
            info!(
                conversation = %self.conversation,
                terminal_id = %terminal_id,
                command = %params.command,
                "terminal created"
            );
            Ok(terminal_id)
        })
    }

    fn terminal_output(&self, terminal_id: String) -> OpFuture<'_, TerminalOutput> {
        Box::pin(async move { Ok(self.terminal(&terminal_id)?.output()) })
    }

    fn wait_for_terminal_exit(&self, terminal_id: String) -> OpFuture<'_, TerminalExitStatus> {
        Box::pin(async move {
            let terminal = self.terminal(&terminal_id)?;
            terminal.wait().await
        })
    }

    fn kill_terminal(&self, terminal_id: String) -> OpFuture<'_, ()> {
        Box::pin(async move {
            self.terminal(&terminal_id)?.kill();
            debug!(terminal_id = %terminal_id, "terminal killed");
            Ok(())
        })
    }

    fn release_terminal(&self, terminal_id: String) -> OpFuture<'_, ()> {
        Box::pin(async move {
            let removed = lock(&self.terminals).remove(&terminal_id);
            let terminal = removed
                .ok_or_else(|| AppError::NotFound(format!("Terminal not found: {terminal_id}")))?;
            terminal.kill();
            debug!(terminal_id = %terminal_id, "terminal released");
            Ok(())
        })
    }

    fn shutdown(&self) {
        self.closed.cancel();
        let terminals: Vec<_> = lock(&self.terminals).drain().map(|(_, t)| t).collect();
        for terminal in &terminals {
            terminal.kill();
        }
        if !terminals.is_empty() {
            info!(
                conversation = %self.conversation,
                count = terminals.len(),
                "killed terminals on shutdown"
            );
        }
    }
}

/// Lines `[line, line + limit)` of `text`, 1-based, joined with `\n`.
#[must_use]
pub fn slice_lines(text: &str, line: Option<usize>, limit: Option<usize>) -> String {
    let start = line.unwrap_or(1).max(1) - 1;
    let lines = text.lines().skip(start);
    match limit {
        Some(limit) => lines.take(limit).collect::<Vec<_>>().join("\n"),
        None => lines.collect::<Vec<_>>().join("\n"),
    }
}

// ── Terminals ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CapturedOutput {
    stdout: String,
    stderr: String,
    truncated: bool,
    limit: Option<usize>,
}

impl CapturedOutput {
    fn push(&mut self, stderr: bool, chunk: &str) {
        let target = if stderr { &mut self.stderr } else { &mut self.stdout };
        target.push_str(chunk);
        if let Some(limit) = self.limit {
            self.truncated |= trim_front(&mut self.stdout, limit);
            self.truncated |= trim_front(&mut self.stderr, limit);
        }
    }

    fn render(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\nSTDERR:\n{}", self.stdout, self.stderr)
        }
    }
}

/// Drop bytes from the front of `text` until it fits `limit`, on a char
/// boundary. Returns whether anything was dropped.
fn trim_front(text: &mut String, limit: usize) -> bool {
    if text.len() <= limit {
        return false;
    }
    let mut cut = text.len() - limit;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
    true
}

struct LocalTerminal {
    output: Arc<Mutex<CapturedOutput>>,
    exit: watch::Receiver<Option<TerminalExitStatus>>,
    kill: CancellationToken,
}

impl LocalTerminal {
    fn spawn(params: &CreateTerminalParams) -> Result<Self> {
        let mut command = Command::new(&params.command);
        command
            .args(&params.args)
            .envs(params.env.iter().map(|v| (v.name.as_str(), v.value.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &params.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| AppError::Io(format!("failed to spawn '{}': {e}", params.command)))?;

        let output = Arc::new(Mutex::new(CapturedOutput {
            limit: params.output_byte_limit,
            ..CapturedOutput::default()
        }));
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, Arc::clone(&output), false)));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, Arc::clone(&output), true)));
        }

        let (exit_tx, exit) = watch::channel(None);
        let kill = CancellationToken::new();
        let kill_signal = kill.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                () = kill_signal.cancelled() => {
                    if let Err(err) = child.kill().await {
                        warn!(error = %err, "failed to kill terminal process");
                    }
                    child.wait().await
                }
            };
            // Output is complete once both pipes hit EOF.
            for pump in pumps {
                if let Err(err) = pump.await {
                    debug!(error = %err, "terminal output pump failed");
                }
            }
            let exit_status = match status {
                Ok(status) => exit_status(status),
                Err(err) => {
                    warn!(error = %err, "failed to wait for terminal process");
                    TerminalExitStatus {
                        exit_code: None,
                        signal: None,
                    }
                }
            };
            let _ = exit_tx.send(Some(exit_status));
        });

        Ok(Self { output, exit, kill })
    }

    fn output(&self) -> TerminalOutput {
        let captured = lock(&self.output);
        TerminalOutput {
            output: captured.render(),
            truncated: captured.truncated,
            exit_status: (*self.exit.borrow()).clone(),
        }
    }

    async fn wait(&self) -> Result<TerminalExitStatus> {
        let mut exit = self.exit.clone();
        let status = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| AppError::Io("terminal exited without status".into()))?;
        (*status)
            .clone()
            .ok_or_else(|| AppError::Io("terminal exited without status".into()))
    }

    fn kill(&self) {
        self.kill.cancel();
    }
}

async fn pump<R: AsyncRead + Unpin>(stream: R, output: Arc<Mutex<CapturedOutput>>, stderr: bool) {
    let mut chunks = FramedRead::new(stream, BytesCodec::new());
    let mut carry = BytesMut::new();
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(chunk) => {
                carry.extend_from_slice(&chunk);
                let text = take_utf8(&mut carry);
                if !text.is_empty() {
                    lock(&output).push(stderr, &text);
                }
            }
            Err(err) => {
                debug!(error = %err, "terminal output stream failed");
                break;
            }
        }
    }
    if !carry.is_empty() {
        lock(&output).push(stderr, &String::from_utf8_lossy(&carry));
    }
}

/// Decode the complete UTF-8 prefix of `pending`, leaving an unfinished
/// trailing sequence for the next read. Invalid bytes become U+FFFD.
fn take_utf8(pending: &mut BytesMut) -> String {
    let mut text = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(valid) => {
                text.push_str(valid);
                pending.clear();
                return text;
            }
            Err(err) => {
                let valid = pending.split_to(err.valid_up_to());
                text.push_str(&String::from_utf8_lossy(&valid));
                match err.error_len() {
                    None => return text,
                    Some(invalid) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        let _ = pending.split_to(invalid);
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
fn exit_status(status: std::process::ExitStatus) -> TerminalExitStatus {
    use std::os::unix::process::ExitStatusExt;
    TerminalExitStatus {
        exit_code: status.code(),
        signal: status.signal().map(|s| s.to_string()),
    }
}

#[cfg(not(unix))]
fn exit_status(status: std::process::ExitStatus) -> TerminalExitStatus {
    TerminalExitStatus {
        exit_code: status.code(),
        signal: None,
    }
}
