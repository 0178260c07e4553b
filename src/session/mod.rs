//! Conversation sessions: registry, live context, and the chat driver.

pub mod chat;
pub mod context;
pub mod registry;

pub use chat::{AcpChat, ChatMessage, ChatResponse, ChatRole};
pub use context::SessionContext;
pub use registry::{ManagedSession, SessionRegistry};
