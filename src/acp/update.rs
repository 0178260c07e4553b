//! Typed `session/update` payloads streamed by the agent during a turn.
//!
//! Only the fields the bridge consumes are modelled; everything else in the
//! agent's JSON is ignored on deserialisation. Update variants this client
//! does not know decode to [`SessionUpdate::Unknown`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Params of a `session/update` notification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    /// Agent-side session the update belongs to.
    pub session_id: String,
    /// The update itself.
    pub update: SessionUpdate,
}

/// One streamed update, discriminated by `sessionUpdate`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    /// Piece of the agent's visible reply.
    AgentMessageChunk(ContentChunk),
    /// Echo of user input.
    UserMessageChunk(ContentChunk),
    /// Piece of the agent's reasoning.
    AgentThoughtChunk(ContentChunk),
    /// A tool call was started.
    ToolCall(ToolCall),
    /// Progress or result of an earlier tool call.
    ToolCallUpdate(ToolCallUpdate),
    /// The agent's current plan.
    Plan(PlanUpdate),
    /// Slash commands the agent now offers.
    AvailableCommandsUpdate(AvailableCommandsUpdate),
    /// The agent switched mode.
    CurrentModeUpdate(CurrentModeUpdate),
    /// Any variant this client does not know.
    #[serde(other)]
    Unknown,
}

impl SessionUpdate {
    /// Wire name of the variant, for logging.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::AgentMessageChunk(_) => "agent_message_chunk",
            Self::UserMessageChunk(_) => "user_message_chunk",
            Self::AgentThoughtChunk(_) => "agent_thought_chunk",
            Self::ToolCall(_) => "tool_call",
            Self::ToolCallUpdate(_) => "tool_call_update",
            Self::Plan(_) => "plan",
            Self::AvailableCommandsUpdate(_) => "available_commands_update",
            Self::CurrentModeUpdate(_) => "current_mode_update",
            Self::Unknown => "unknown",
        }
    }
}

/// A chunk carrying one content block.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContentChunk {
    /// The chunk's content.
    pub content: ContentBlock,
}

// ── Content blocks ────────────────────────────────────────────────────────────

/// Prompt or update content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Inline image.
    Image {
        /// MIME type of `data`.
        #[serde(rename = "mimeType")]
        mime_type: String,
        /// Base64 payload.
        #[serde(default)]
        data: String,
    },
    /// Inline audio.
    Audio {
        /// MIME type of `data`.
        #[serde(rename = "mimeType")]
        mime_type: String,
        /// Base64 payload.
        #[serde(default)]
        data: String,
    },
    /// Link to a resource the agent can fetch.
    ResourceLink {
        /// Resource URI.
        uri: String,
        /// Short name.
        name: String,
        /// Optional display title.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    /// Embedded resource contents.
    Resource {
        /// Raw resource object.
        resource: Value,
    },
}

impl ContentBlock {
    /// Plain text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Text rendering used when accumulating windows.
    #[must_use]
    pub fn extract_text(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::ResourceLink { title, name, .. } => title.clone().unwrap_or_else(|| name.clone()),
            Self::Resource { resource } => resource.to_string(),
            Self::Audio { mime_type, .. } => format!("[audio:{mime_type}]"),
            Self::Image { mime_type, .. } => format!("[image:{mime_type}]"),
        }
    }
}

// ── Tool calls ────────────────────────────────────────────────────────────────

/// Lifecycle status reported for a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Not started; arguments may still be streaming.
    Pending,
    /// Running.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl ToolCallStatus {
    /// Upper-case name used in domain events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// Content attached to a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolCallContent {
    /// Regular content block.
    Content {
        /// The block.
        content: ContentBlock,
    },
    /// File edit.
    Diff {
        /// Edited file.
        path: String,
        /// Content after the edit.
        #[serde(rename = "newText")]
        new_text: String,
        /// Content before the edit; absent for new files.
        #[serde(rename = "oldText", default)]
        old_text: Option<String>,
    },
    /// Live terminal output.
    Terminal {
        /// Terminal id from `terminal/create`.
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },
}

/// A file location touched by a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallLocation {
    /// File path.
    pub path: String,
    /// Optional 1-based line.
    #[serde(default)]
    pub line: Option<u32>,
}

/// `tool_call` update.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Tool call id.
    pub tool_call_id: String,
    /// Human-readable title.
    #[serde(default)]
    pub title: String,
    /// Tool kind (`read`, `edit`, `execute`, …).
    #[serde(default)]
    pub kind: Option<String>,
    /// Initial status.
    #[serde(default)]
    pub status: Option<ToolCallStatus>,
    /// Attached content.
    #[serde(default)]
    pub content: Vec<ToolCallContent>,
    /// Affected locations.
    #[serde(default)]
    pub locations: Vec<ToolCallLocation>,
    /// Raw tool input.
    #[serde(default)]
    pub raw_input: Option<Value>,
    /// Raw tool output.
    #[serde(default)]
    pub raw_output: Option<Value>,
}

/// `tool_call_update` update; every field except the id is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallUpdate {
    /// Tool call id.
    pub tool_call_id: String,
    /// New title.
    #[serde(default)]
    pub title: Option<String>,
    /// New kind.
    #[serde(default)]
    pub kind: Option<String>,
    /// New status.
    #[serde(default)]
    pub status: Option<ToolCallStatus>,
    /// Replacement content.
    #[serde(default)]
    pub content: Option<Vec<ToolCallContent>>,
    /// Replacement locations.
    #[serde(default)]
    pub locations: Option<Vec<ToolCallLocation>>,
    /// Raw tool input.
    #[serde(default)]
    pub raw_input: Option<Value>,
    /// Raw tool output.
    #[serde(default)]
    pub raw_output: Option<Value>,
}

// ── Plans, commands, modes ────────────────────────────────────────────────────

/// One step of the agent's plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    /// Step description.
    pub content: String,
    /// `high`, `medium` or `low`.
    #[serde(default)]
    pub priority: String,
    /// `pending`, `in_progress` or `completed`.
    #[serde(default)]
    pub status: String,
}

/// `plan` update.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlanUpdate {
    /// Complete plan; replaces any earlier one.
    #[serde(default)]
    pub entries: Vec<PlanEntry>,
}

/// A command the agent accepts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AvailableCommand {
    /// Command name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Input spec, opaque to the bridge.
    #[serde(default)]
    pub input: Option<Value>,
}

/// `available_commands_update` update.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableCommandsUpdate {
    /// Full command list.
    #[serde(default)]
    pub available_commands: Vec<AvailableCommand>,
}

/// `current_mode_update` update.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentModeUpdate {
    /// Mode id now in effect.
    pub current_mode_id: String,
}
