//! A single accumulation window and what it flushes into.

use std::fmt::{Display, Formatter};

use serde::Serialize;

use crate::models::conversation::ConversationKey;
use crate::models::event::{DomainEvent, EventPayload};

/// Category of streamed update a window accumulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowKind {
    /// Agent reply text; flushes into a [`ChatGeneration`].
    Message,
    /// Agent reasoning text.
    Thought,
    /// Tool call events.
    ToolCall,
    /// Plan events.
    Plan,
    /// User message echo text.
    UserMessage,
    /// Mode change events.
    CurrentMode,
    /// Command list events.
    AvailableCommands,
}

impl WindowKind {
    /// Every kind.
    pub const ALL: [Self; 7] = [
        Self::Message,
        Self::Thought,
        Self::ToolCall,
        Self::Plan,
        Self::UserMessage,
        Self::CurrentMode,
        Self::AvailableCommands,
    ];

    /// Upper-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "MESSAGE",
            Self::Thought => "THOUGHT",
            Self::ToolCall => "TOOL_CALL",
            Self::Plan => "PLAN",
            Self::UserMessage => "USER_MESSAGE",
            Self::CurrentMode => "CURRENT_MODE",
            Self::AvailableCommands => "AVAILABLE_COMMANDS",
        }
    }
}

impl Display for WindowKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finalized agent reply text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatGeneration {
    /// Concatenated reply text.
    pub text: String,
    /// Number of chunks appended, not a tokenizer count.
    pub token_count: usize,
}

/// What one window flush produced.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputUnit {
    /// A `MESSAGE` window's reply.
    Generation(ChatGeneration),
    /// Events published for any other window, in publish order.
    Published {
        /// Window the events came from.
        kind: WindowKind,
        /// Published events.
        events: Vec<DomainEvent>,
    },
}

impl OutputUnit {
    /// The generation, if this unit is one.
    #[must_use]
    pub fn as_generation(&self) -> Option<&ChatGeneration> {
        match self {
            Self::Generation(generation) => Some(generation),
            Self::Published { .. } => None,
        }
    }

    /// Window kind that produced this unit.
    #[must_use]
    pub fn kind(&self) -> WindowKind {
        match self {
            Self::Generation(_) => WindowKind::Message,
            Self::Published { kind, .. } => *kind,
        }
    }
}

/// Open accumulator for one (conversation, kind).
///
/// A window exists only while open: it is created by the first append and
/// consumed by [`finish`](Self::finish). Appends never emit anything.
#[derive(Debug, Clone)]
pub struct StreamWindow {
    conversation: ConversationKey,
    kind: WindowKind,
    text: String,
    appends: usize,
    events: Vec<DomainEvent>,
}

impl StreamWindow {
    /// Open an empty window.
    #[must_use]
    pub fn open(conversation: ConversationKey, kind: WindowKind) -> Self {
        Self {
            conversation,
            kind,
            text: String::new(),
            appends: 0,
            events: Vec::new(),
        }
    }

    /// Kind of this window.
    #[must_use]
    pub fn kind(&self) -> WindowKind {
        self.kind
    }

    /// Append a text delta.
    pub fn append_text(&mut self, text: &str) {
        self.text.push_str(text);
        self.appends += 1;
    }

    /// Append a structured event. Ignored by `MESSAGE` windows.
    pub fn append_event(&mut self, event: DomainEvent) {
        if self.kind == WindowKind::Message {
            return;
        }
        self.events.push(event);
    }

    /// Whether a flush would produce nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.events.is_empty()
    }

    /// Close the window and build its output.
    ///
    /// `MESSAGE` windows become a [`ChatGeneration`]. `THOUGHT` and
    /// `USER_MESSAGE` text becomes one event, followed by any appended
    /// events. Empty windows produce `None`.
    #[must_use]
    pub fn finish(self) -> Option<OutputUnit> {
        if self.is_empty() {
            return None;
        }

        if self.kind == WindowKind::Message {
            return Some(OutputUnit::Generation(ChatGeneration {
                text: self.text,
                token_count: self.appends,
            }));
        }

        let mut events = Vec::with_capacity(self.events.len() + 1);
        if !self.text.is_empty() {
            match self.kind {
                WindowKind::Thought => events.push(DomainEvent::new(
                    self.conversation.clone(),
                    EventPayload::ThoughtDelta {
                        text: self.text,
                        token_count: self.appends,
                    },
                )),
                WindowKind::UserMessage => events.push(DomainEvent::new(
                    self.conversation.clone(),
                    EventPayload::UserMessageChunk { text: self.text },
                )),
                _ => {}
            }
        }
        events.extend(self.events);

        if events.is_empty() {
            return None;
        }
        Some(OutputUnit::Published {
            kind: self.kind,
            events,
        })
    }
}
