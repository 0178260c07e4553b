//! Publish-subscribe fan-out for domain events.
//!
//! Producers only see the [`EventSink`] trait; [`EventBus`] is the default
//! sink and distributes events to any number of subscribers over a
//! `tokio::sync::broadcast` channel.

use tokio::sync::broadcast;
use tracing::trace;

use crate::models::event::DomainEvent;

/// Default channel capacity; slow subscribers lag past this.
const DEFAULT_CAPACITY: usize = 1024;

/// Destination for published domain events.
///
/// `publish` is called under the per-conversation window lock and must not
/// block.
pub trait EventSink: Send + Sync {
    /// Publish one event.
    fn publish(&self, event: DomainEvent);
}

/// Broadcast-backed [`EventSink`].
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    /// Bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// Current number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: DomainEvent) {
        let kind = event.kind();
        let delivered = self.sender.send(event).unwrap_or(0);
        trace!(kind, delivered, "event published");
    }
}
