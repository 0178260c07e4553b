//! Maps session updates onto window operations.
//!
//! For every update of kind K the translator first closes every other open
//! window of the conversation, then appends the update to K's window, and
//! returns what the close produced. K's own window stays open until the next
//! update of a different kind or the end of the turn.

use crate::acp::update::{
    AvailableCommandsUpdate, CurrentModeUpdate, PlanUpdate, SessionUpdate, ToolCall, ToolCallUpdate,
};
use crate::models::conversation::ConversationKey;
use crate::models::event::{CommandInfo, DomainEvent, EventPayload, ToolCallEvent, ToolCallPhase};
use crate::stream::buffer::StreamWindowBuffer;
use crate::stream::window::{OutputUnit, WindowKind};

/// Title used when a tool call update carries none.
const DEFAULT_TOOL_TITLE: &str = "tool_call";

/// Window an update belongs to; `None` for unknown updates.
#[must_use]
pub fn window_kind(update: &SessionUpdate) -> Option<WindowKind> {
    match update {
        SessionUpdate::AgentMessageChunk(_) => Some(WindowKind::Message),
        SessionUpdate::UserMessageChunk(_) => Some(WindowKind::UserMessage),
        SessionUpdate::AgentThoughtChunk(_) => Some(WindowKind::Thought),
        SessionUpdate::ToolCall(_) | SessionUpdate::ToolCallUpdate(_) => Some(WindowKind::ToolCall),
        SessionUpdate::Plan(_) => Some(WindowKind::Plan),
        SessionUpdate::AvailableCommandsUpdate(_) => Some(WindowKind::AvailableCommands),
        SessionUpdate::CurrentModeUpdate(_) => Some(WindowKind::CurrentMode),
        SessionUpdate::Unknown => None,
    }
}

/// Feed one update into `buffer` for conversation `key`.
///
/// Returns the units flushed by the kind switch. Unknown updates are ignored.
pub fn translate(
    update: &SessionUpdate,
    key: &ConversationKey,
    buffer: &StreamWindowBuffer,
) -> Vec<OutputUnit> {
    let Some(kind) = window_kind(update) else {
        return Vec::new();
    };

    let flushed = buffer.flush_all_others(key, kind);

    match update {
        SessionUpdate::AgentMessageChunk(chunk)
        | SessionUpdate::UserMessageChunk(chunk)
        | SessionUpdate::AgentThoughtChunk(chunk) => {
            buffer.append_text(key, kind, &chunk.content.extract_text());
        }
        SessionUpdate::ToolCall(call) => {
            buffer.append_event(key, kind, tool_call_event(key, call));
        }
        SessionUpdate::ToolCallUpdate(call) => {
            buffer.append_event(key, kind, tool_call_update_event(key, call));
        }
        SessionUpdate::Plan(plan) => {
            buffer.append_event(key, kind, plan_event(key, plan));
        }
        SessionUpdate::AvailableCommandsUpdate(commands) => {
            buffer.append_event(key, kind, commands_event(key, commands));
        }
        SessionUpdate::CurrentModeUpdate(mode) => {
            buffer.append_event(key, kind, mode_event(key, mode));
        }
        SessionUpdate::Unknown => {}
    }

    flushed
}

// ── Event builders ────────────────────────────────────────────────────────────

fn tool_call_event(key: &ConversationKey, call: &ToolCall) -> DomainEvent {
    DomainEvent::new(
        key.clone(),
        EventPayload::ToolCall(ToolCallEvent {
            tool_call_id: call.tool_call_id.clone(),
            title: call.title.clone(),
            tool_kind: call.kind.clone(),
            status: call.status.map(|s| s.as_str().to_owned()),
            phase: ToolCallPhase::Start,
            content: call.content.clone(),
            locations: call.locations.clone(),
            raw_input: call.raw_input.as_ref().map(ToString::to_string),
            raw_output: call.raw_output.as_ref().map(ToString::to_string),
        }),
    )
}

fn tool_call_update_event(key: &ConversationKey, call: &ToolCallUpdate) -> DomainEvent {
    DomainEvent::new(
        key.clone(),
        EventPayload::ToolCall(ToolCallEvent {
            tool_call_id: call.tool_call_id.clone(),
            title: call
                .title
                .clone()
                .unwrap_or_else(|| DEFAULT_TOOL_TITLE.to_owned()),
            tool_kind: call.kind.clone(),
            status: call.status.map(|s| s.as_str().to_owned()),
            phase: ToolCallPhase::from_status(call.status),
            content: call.content.clone().unwrap_or_default(),
            locations: call.locations.clone().unwrap_or_default(),
            raw_input: call.raw_input.as_ref().map(ToString::to_string),
            raw_output: call.raw_output.as_ref().map(ToString::to_string),
        }),
    )
}

fn plan_event(key: &ConversationKey, plan: &PlanUpdate) -> DomainEvent {
    DomainEvent::new(
        key.clone(),
        EventPayload::PlanUpdate {
            entries: plan.entries.clone(),
        },
    )
}

fn commands_event(key: &ConversationKey, update: &AvailableCommandsUpdate) -> DomainEvent {
    let commands = update
        .available_commands
        .iter()
        .map(|c| CommandInfo {
            name: c.name.clone(),
            description: c.description.clone(),
            input: c.input.as_ref().map(ToString::to_string),
        })
        .collect();
    DomainEvent::new(key.clone(), EventPayload::AvailableCommandsUpdate { commands })
}

fn mode_event(key: &ConversationKey, update: &CurrentModeUpdate) -> DomainEvent {
    DomainEvent::new(
        key.clone(),
        EventPayload::CurrentModeUpdate {
            mode_id: update.current_mode_id.clone(),
        },
    )
}
