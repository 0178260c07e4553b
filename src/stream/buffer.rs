//! Per-conversation window registry and flush engine.
//!
//! Windows are stored per conversation in opening order. All work on one
//! conversation happens under that conversation's map-shard guard, including
//! publishing to the sink, so events leave the buffer in exactly the order
//! the flush calls were made. Different conversations never contend on a
//! single lock.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::event_bus::EventSink;
use crate::models::conversation::ConversationKey;
use crate::models::event::DomainEvent;
use crate::stream::window::{OutputUnit, StreamWindow, WindowKind};

/// Open windows of one conversation, oldest first; at most one per kind.
#[derive(Debug, Default)]
struct WindowSet {
    windows: Vec<StreamWindow>,
}

impl WindowSet {
    fn window_mut(&mut self, conversation: &ConversationKey, kind: WindowKind) -> &mut StreamWindow {
        let index = match self.windows.iter().position(|w| w.kind() == kind) {
            Some(index) => index,
            None => {
                trace!(conversation = %conversation, %kind, "opening stream window");
                self.windows.push(StreamWindow::open(conversation.clone(), kind));
                self.windows.len() - 1
            }
        };
        &mut self.windows[index]
    }

    fn take_where(&mut self, mut pred: impl FnMut(WindowKind) -> bool) -> Vec<StreamWindow> {
        let (taken, kept): (Vec<_>, Vec<_>) =
            self.windows.drain(..).partition(|w| pred(w.kind()));
        self.windows = kept;
        taken
    }

    fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Stream-window aggregation engine.
///
/// Each session context owns one; windows stay keyed by conversation.
pub struct StreamWindowBuffer {
    windows: DashMap<ConversationKey, WindowSet>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for StreamWindowBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWindowBuffer")
            .field("conversations", &self.windows.len())
            .finish_non_exhaustive()
    }
}

impl StreamWindowBuffer {
    /// Buffer publishing non-message flushes to `sink`.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            windows: DashMap::new(),
            sink,
        }
    }

    /// Append text to the `(key, kind)` window, opening it if needed.
    pub fn append_text(&self, key: &ConversationKey, kind: WindowKind, text: &str) {
        self.windows
            .entry(key.clone())
            .or_default()
            .window_mut(key, kind)
            .append_text(text);
    }

    /// Append a structured event to the `(key, kind)` window, opening it if
    /// needed.
    pub fn append_event(&self, key: &ConversationKey, kind: WindowKind, event: DomainEvent) {
        self.windows
            .entry(key.clone())
            .or_default()
            .window_mut(key, kind)
            .append_event(event);
    }

    /// Close exactly the `(key, kind)` window.
    pub fn flush_one(&self, key: &ConversationKey, kind: WindowKind) -> Option<OutputUnit> {
        self.flush_where(key, |k| k == kind).pop()
    }

    /// Close every open window of `key` except `keep`, oldest first.
    pub fn flush_all_others(&self, key: &ConversationKey, keep: WindowKind) -> Vec<OutputUnit> {
        self.flush_where(key, |k| k != keep)
    }

    /// Close every open window of `key`, oldest first.
    pub fn flush_all(&self, key: &ConversationKey) -> Vec<OutputUnit> {
        self.flush_where(key, |_| true)
    }

    /// Drop every open window of `key` without emitting anything.
    ///
    /// Returns how many windows were dropped.
    pub fn discard_all(&self, key: &ConversationKey) -> usize {
        let dropped = self
            .windows
            .remove(key)
            .map_or(0, |(_, set)| set.windows.len());
        if dropped > 0 {
            debug!(conversation = %key, dropped, "discarded open stream windows");
        }
        dropped
    }

    /// Kinds currently open for `key`, oldest first.
    #[must_use]
    pub fn open_kinds(&self, key: &ConversationKey) -> Vec<WindowKind> {
        self.windows
            .get(key)
            .map(|set| set.windows.iter().map(StreamWindow::kind).collect())
            .unwrap_or_default()
    }

    fn flush_where(
        &self,
        key: &ConversationKey,
        pred: impl FnMut(WindowKind) -> bool,
    ) -> Vec<OutputUnit> {
        let units = match self.windows.get_mut(key) {
            Some(mut set) => {
                let taken = set.take_where(pred);
                let mut units = Vec::with_capacity(taken.len());
                for window in taken {
                    let kind = window.kind();
                    match window.finish() {
                        Some(unit) => {
                            if let OutputUnit::Published { events, .. } = &unit {
                                for event in events {
                                    self.sink.publish(event.clone());
                                }
                            }
                            trace!(conversation = %key, %kind, "flushed stream window");
                            units.push(unit);
                        }
                        None => trace!(conversation = %key, %kind, "flushed empty stream window"),
                    }
                }
                units
            }
            None => Vec::new(),
        };

        self.windows.remove_if(key, |_, set| set.is_empty());
        units
    }
}
