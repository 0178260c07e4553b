//! Domain events published for external consumers.
//!
//! Every non-message window flush produces events of these shapes. They
//! serialise as flat JSON objects tagged by `kind`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::acp::update::{PlanEntry, ToolCallContent, ToolCallLocation, ToolCallStatus};
use crate::models::conversation::ConversationKey;

/// One published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique event id.
    pub id: Uuid,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Conversation the event belongs to.
    pub conversation: ConversationKey,
    /// Kind-specific payload.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl DomainEvent {
    /// Stamp `payload` with a fresh id and the current time.
    #[must_use]
    pub fn new(conversation: ConversationKey, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            conversation,
            payload,
        }
    }

    /// Event kind name as serialised.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

/// Event payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    /// Accumulated reasoning text.
    ThoughtDelta {
        /// Reasoning text.
        text: String,
        /// Number of chunks the text was assembled from.
        token_count: usize,
    },
    /// Accumulated user message echo.
    UserMessageChunk {
        /// Echoed text.
        text: String,
    },
    /// Tool call progress.
    ToolCall(ToolCallEvent),
    /// Plan replacement.
    PlanUpdate {
        /// Plan steps.
        entries: Vec<PlanEntry>,
    },
    /// Mode switch.
    CurrentModeUpdate {
        /// New mode id.
        mode_id: String,
    },
    /// Command list replacement.
    AvailableCommandsUpdate {
        /// Offered commands.
        commands: Vec<CommandInfo>,
    },
    /// The agent asked for permission; answer via the permission gate.
    PermissionRequested(PermissionRequestEvent),
}

impl EventPayload {
    /// Kind name as serialised.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ThoughtDelta { .. } => "THOUGHT_DELTA",
            Self::UserMessageChunk { .. } => "USER_MESSAGE_CHUNK",
            Self::ToolCall(_) => "TOOL_CALL",
            Self::PlanUpdate { .. } => "PLAN_UPDATE",
            Self::CurrentModeUpdate { .. } => "CURRENT_MODE_UPDATE",
            Self::AvailableCommandsUpdate { .. } => "AVAILABLE_COMMANDS_UPDATE",
            Self::PermissionRequested(_) => "PERMISSION_REQUESTED",
        }
    }
}

/// Position of a tool-call event in the call's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolCallPhase {
    /// Call announced.
    Start,
    /// Arguments still streaming.
    Args,
    /// Running.
    Update,
    /// Finished, successfully or not.
    Result,
}

impl ToolCallPhase {
    /// Phase implied by an update's status; no status means still running.
    #[must_use]
    pub fn from_status(status: Option<ToolCallStatus>) -> Self {
        match status {
            Some(ToolCallStatus::Completed | ToolCallStatus::Failed) => Self::Result,
            Some(ToolCallStatus::Pending) => Self::Args,
            Some(ToolCallStatus::InProgress) | None => Self::Update,
        }
    }
}

/// Tool call snapshot carried by [`EventPayload::ToolCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEvent {
    /// Agent-side tool call id.
    pub tool_call_id: String,
    /// Title.
    pub title: String,
    /// Tool kind.
    pub tool_kind: Option<String>,
    /// Upper-case status name.
    pub status: Option<String>,
    /// Lifecycle phase.
    pub phase: ToolCallPhase,
    /// Attached content.
    pub content: Vec<ToolCallContent>,
    /// Affected locations.
    pub locations: Vec<ToolCallLocation>,
    /// Raw input, rendered as JSON text.
    pub raw_input: Option<String>,
    /// Raw output, rendered as JSON text.
    pub raw_output: Option<String>,
}

/// Command descriptor carried by [`EventPayload::AvailableCommandsUpdate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    /// Command name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Input spec rendered as JSON text.
    pub input: Option<String>,
}

/// One choice offered in a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    /// Id to answer with.
    pub option_id: String,
    /// Label.
    pub name: String,
    /// `allow_once`, `allow_always`, `reject_once` or `reject_always`.
    #[serde(default)]
    pub kind: String,
}

/// Payload of [`EventPayload::PermissionRequested`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequestEvent {
    /// Correlation id for `resolve_selected` / `resolve_cancelled`.
    pub request_id: String,
    /// Agent-side session.
    pub session_id: String,
    /// Tool call the request is about.
    pub tool_call_id: Option<String>,
    /// Tool call title.
    pub title: Option<String>,
    /// Offered choices.
    pub options: Vec<PermissionOption>,
}
