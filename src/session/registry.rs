//! Per-conversation session registry.
//!
//! Each conversation key owns one slot holding a lazily constructed session.
//! Slots live in a [`DashMap`], so a slow constructor for one key only holds
//! that key's slot and never the map: callers for other keys proceed in
//! parallel, callers for the same key wait on the slot's [`OnceCell`] and all
//! observe the same `Arc`.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::models::conversation::ConversationKey;
use crate::sync::lock;
use crate::{AppError, Result};

/// A registered session that can be torn down.
pub trait ManagedSession: Send + Sync {
    /// Release the session's resources. Must be idempotent.
    fn close(&self);
}

struct Slot<T> {
    cell: OnceCell<Arc<T>>,
    last_used: Mutex<Instant>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *lock(&self.last_used) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        lock(&self.last_used).elapsed()
    }
}

/// Conversation key → session map with at-most-once construction per key.
pub struct SessionRegistry<T> {
    slots: DashMap<ConversationKey, Arc<Slot<T>>>,
}

impl<T> std::fmt::Debug for SessionRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl<T: ManagedSession> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ManagedSession> SessionRegistry<T> {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Return the session for `key`, running `constructor` if there is none.
    ///
    /// Concurrent callers for the same key share one constructor run. If the
    /// constructor fails the error is returned to its caller and nothing is
    /// kept, so the next call constructs again. A session whose slot was
    /// removed while it was being constructed is closed, not returned.
    ///
    /// # Errors
    ///
    /// Returns whatever `constructor` fails with, or
    /// [`AppError::SessionInit`] when the key was removed meanwhile.
    pub async fn get_or_create<F, Fut>(&self, key: &ConversationKey, constructor: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // The shard guard must be gone before awaiting.
        let slot = Arc::clone(
            self.slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::new()))
                .value(),
        );

        let outcome = slot
            .cell
            .get_or_try_init(move || async move {
                debug!(conversation = %key, "constructing session");
                constructor().await.map(Arc::new)
            })
            .await;

        match outcome {
            Ok(session) => {
                let registered = self
                    .slots
                    .get(key)
                    .is_some_and(|current| Arc::ptr_eq(current.value(), &slot));
                if !registered {
                    // Removed while constructing: nobody else can reach it.
                    session.close();
                    warn!(conversation = %key, "session removed during construction, closed");
                    return Err(AppError::SessionInit(format!(
                        "session for {key} was removed during construction"
                    )));
                }
                slot.touch();
                Ok(Arc::clone(session))
            }
            Err(err) => {
                warn!(conversation = %key, %err, "session construction failed");
                // Only drop the slot when no other caller is still waiting on it.
                self.slots.remove_if(key, |_, current| {
                    Arc::ptr_eq(current, &slot)
                        && current.cell.get().is_none()
                        && Arc::strong_count(current) == 2
                });
                Err(err)
            }
        }
    }

    /// The constructed session for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &ConversationKey) -> Option<Arc<T>> {
        let slot = self.slots.get(key)?;
        let session = slot.cell.get()?;
        slot.touch();
        Some(Arc::clone(session))
    }

    /// Whether a constructed session exists for `key`.
    #[must_use]
    pub fn contains(&self, key: &ConversationKey) -> bool {
        self.slots
            .get(key)
            .is_some_and(|slot| slot.cell.initialized())
    }

    /// Remove and close the session for `key`. Returns `false` if there was
    /// no constructed session.
    pub fn remove(&self, key: &ConversationKey) -> bool {
        let Some((_, slot)) = self.slots.remove(key) else {
            return false;
        };
        match slot.cell.get() {
            Some(session) => {
                session.close();
                info!(conversation = %key, "session removed");
                true
            }
            None => false,
        }
    }

    /// Close and remove every session idle for longer than `ttl`.
    ///
    /// Returns the evicted keys.
    pub fn evict_idle(&self, ttl: Duration) -> Vec<ConversationKey> {
        let mut evicted = Vec::new();
        self.slots.retain(|key, slot| {
            let Some(session) = slot.cell.get() else {
                return true;
            };
            if slot.idle_for() < ttl {
                return true;
            }
            session.close();
            evicted.push(key.clone());
            false
        });
        if !evicted.is_empty() {
            info!(count = evicted.len(), ttl_secs = ttl.as_secs(), "evicted idle sessions");
        }
        evicted
    }

    /// Close and remove every session.
    pub fn clear(&self) {
        self.slots.retain(|_, slot| {
            if let Some(session) = slot.cell.get() {
                session.close();
            }
            false
        });
    }

    /// Keys with a constructed session.
    #[must_use]
    pub fn keys(&self) -> Vec<ConversationKey> {
        self.slots
            .iter()
            .filter(|entry| entry.value().cell.initialized())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of constructed sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().cell.initialized())
            .count()
    }

    /// Whether no session is constructed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
