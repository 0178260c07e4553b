//! Bridge configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::acp::codec::MAX_LINE_BYTES;
use crate::{AppError, Result};

/// The only transport the bridge knows how to drive.
pub const STDIO_TRANSPORT: &str = "stdio";

fn default_transport() -> String {
    STDIO_TRANSPORT.into()
}

fn default_max_line_bytes() -> usize {
    MAX_LINE_BYTES
}

/// A tool server declared to the agent at `session/new`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct McpServerConfig {
    /// Server name as shown to the agent.
    pub name: String,
    /// HTTP endpoint of the tool server.
    pub url: String,
    /// Extra headers the agent should send to the tool server.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Outbound queue policy for the transport writer.
///
/// With no `capacity` the queue is unbounded. With a capacity, `send` on a
/// full queue drops the message and reports a transport error to the
/// listener instead of blocking the caller.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QueueConfig {
    /// Maximum number of queued outbound messages.
    #[serde(default)]
    pub capacity: Option<usize>,
}

/// Session lifetime policy.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionPolicyConfig {
    /// Idle time after which `SessionRegistry::evict_idle` closes a session.
    /// Absent means sessions live until removed explicitly.
    #[serde(default)]
    pub idle_ttl_seconds: Option<u64>,
}

impl SessionPolicyConfig {
    /// Idle TTL as a [`Duration`], if configured.
    #[must_use]
    pub fn idle_ttl(&self) -> Option<Duration> {
        self.idle_ttl_seconds.map(Duration::from_secs)
    }
}

/// Top-level configuration parsed from `bridge.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    /// Transport kind; only `stdio` is supported.
    #[serde(default = "default_transport")]
    pub transport: String,
    /// Agent binary to launch.
    pub command: String,
    /// Arguments passed to the agent binary.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the agent and for `session/new`.
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Extra environment variables injected into the agent process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Authentication method id; when set the client authenticates after
    /// `initialize`.
    #[serde(default)]
    pub auth_method: Option<String>,
    /// Tool servers forwarded to the agent.
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    /// Inbound line limit for the framing codec.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Outbound queue policy.
    #[serde(default)]
    pub transport_queue: QueueConfig,
    /// Session lifetime policy.
    #[serde(default)]
    pub sessions: SessionPolicyConfig,
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal configuration for `command`, useful for embedding and tests.
    #[must_use]
    pub fn for_command(command: impl Into<String>) -> Self {
        Self {
            transport: default_transport(),
            command: command.into(),
            args: Vec::new(),
            working_directory: None,
            env: HashMap::new(),
            auth_method: None,
            mcp_servers: Vec::new(),
            max_line_bytes: MAX_LINE_BYTES,
            transport_queue: QueueConfig::default(),
            sessions: SessionPolicyConfig::default(),
        }
    }

    /// Working directory for the agent, falling back to the current directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no directory is configured and the
    /// current directory cannot be determined.
    pub fn resolved_working_directory(&self) -> Result<PathBuf> {
        match &self.working_directory {
            Some(dir) if !dir.as_os_str().is_empty() => Ok(dir.clone()),
            _ => std::env::current_dir()
                .map_err(|err| AppError::Config(format!("cannot resolve working directory: {err}"))),
        }
    }

    /// Check the invariants a session needs before anything is spawned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for a non-stdio transport, a blank
    /// command, a zero line limit, or a zero queue capacity.
    pub fn validate(&self) -> Result<()> {
        if !self.transport.eq_ignore_ascii_case(STDIO_TRANSPORT) {
            return Err(AppError::Config(format!(
                "only stdio transport is supported, got '{}'",
                self.transport
            )));
        }

        if self.command.trim().is_empty() {
            return Err(AppError::Config("command must not be empty".into()));
        }

        if self.max_line_bytes == 0 {
            return Err(AppError::Config(
                "max_line_bytes must be greater than zero".into(),
            ));
        }

        if self.transport_queue.capacity == Some(0) {
            return Err(AppError::Config(
                "transport_queue.capacity must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
