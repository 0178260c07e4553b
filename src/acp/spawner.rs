//! Agent process spawner.
//!
//! Spawns the configured agent with:
//! - `kill_on_drop(true)` so the process dies with its session.
//! - `env_clear()` plus a small allowlist and the configured `env` table, so
//!   secrets in the bridge's environment never reach the agent.
//! - Piped stdio. Stdout and stdin carry the protocol; stderr is drained by
//!   a background task and logged out of band.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::models::conversation::ConversationKey;
use crate::{AppError, Result};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Environment variables inherited by the spawned agent process.
///
/// Every other variable is stripped via `env_clear()`; the configured `env`
/// table is applied on top.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "TERM",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Environment variable carrying the conversation key into the agent.
pub const CONVERSATION_ENV_VAR: &str = "ACP_BRIDGE_CONVERSATION";

// ── Process handle ───────────────────────────────────────────────────────────

/// A spawned agent with its protocol streams.
///
/// `child` must stay alive for as long as the session; dropping it kills the
/// process.
#[derive(Debug)]
pub struct AgentProcess {
    /// Child process handle.
    pub child: Child,
    /// Agent stdin: outbound protocol stream.
    pub stdin: ChildStdin,
    /// Agent stdout: inbound protocol stream.
    pub stdout: ChildStdout,
    /// Task draining stderr into the log.
    pub stderr_task: Option<JoinHandle<()>>,
}

/// Spawn the agent described by `config` for `conversation`.
///
/// # Errors
///
/// - `AppError::Config` if `config` fails validation.
/// - `AppError::Io("failed to spawn agent: …")` on OS spawn failure.
/// - `AppError::Io("failed to capture agent …")` if a pipe is missing.
pub fn spawn_agent(config: &BridgeConfig, conversation: &ConversationKey) -> Result<AgentProcess> {
    config.validate()?;
    let cwd = config.resolved_working_directory()?;

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
    cmd.envs(&config.env);
    cmd.env(CONVERSATION_ENV_VAR, conversation.as_str());

    cmd.current_dir(&cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Io(format!("failed to spawn agent '{}': {err}", config.command)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Io("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Io("failed to capture agent stdout".into()))?;
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| drain_stderr(conversation.clone(), stderr));

    info!(
        conversation = %conversation,
        command = %config.command,
        pid = ?child.id(),
        cwd = %cwd.display(),
        "agent process spawned"
    );

    Ok(AgentProcess {
        child,
        stdin,
        stdout,
        stderr_task,
    })
}

/// Log every stderr line of the agent at `DEBUG` until EOF.
#[must_use]
pub fn drain_stderr(conversation: ConversationKey, stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(conversation = %conversation, line, "agent stderr"),
                Ok(None) => break,
                Err(err) => {
                    debug!(conversation = %conversation, %err, "agent stderr unreadable");
                    break;
                }
            }
        }
        debug!(conversation = %conversation, "agent stderr closed");
    })
}
