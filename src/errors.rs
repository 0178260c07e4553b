//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Crate error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// A single inbound line could not be decoded into a protocol message.
    Decode(String),
    /// Read or write failure on the agent stream; terminal for the transport.
    Transport(String),
    /// Handshake, authentication, or session creation failure.
    SessionInit(String),
    /// Requested entity (terminal id, session, pending request) does not exist.
    NotFound(String),
    /// Operation invoked in a lifecycle state that does not allow it.
    IllegalState(String),
    /// The agent answered a request with a JSON-RPC error object.
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message reported by the agent.
        message: String,
    },
    /// Permission request was cancelled or could not be resolved.
    Permission(String),
    /// File-system or process I/O failure outside the transport.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Decode(msg) => write!(f, "decode: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::SessionInit(msg) => write!(f, "session init: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::IllegalState(msg) => write!(f, "illegal state: {msg}"),
            Self::Rpc { code, message } => write!(f, "rpc: {message} (code {code})"),
            Self::Permission(msg) => write!(f, "permission: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Stream I/O failures surface through the framing codec, so a bare
/// `io::Error` is a transport failure. File-system callers map to
/// [`AppError::Io`] explicitly.
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
