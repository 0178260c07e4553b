//! JSON-RPC correlation layer on top of a [`Transport`].
//!
//! - Outbound requests get monotonically increasing numeric ids and a
//!   pending one-shot completion, finished by the matching response.
//! - `session/update` notifications are routed to the subscriber registered
//!   for the notification's `sessionId`.
//! - Inbound requests are served by the injected [`ClientOperations`] on a
//!   spawned task and answered with `result` or `error`.
//! - When the transport closes every pending request fails, every
//!   subscription ends, and the operations are shut down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::acp::message::{Notification, RawMessage, Request, RequestId, Response, ResponsePayload};
use crate::acp::operations::{dispatch, ClientOperations};
use crate::acp::transport::{Transport, TransportListener};
use crate::acp::update::{SessionNotification, SessionUpdate};
use crate::sync::lock;
use crate::{AppError, Result};

/// Notification method carrying streamed session updates.
pub const SESSION_UPDATE: &str = "session/update";

/// Completion handle of one outbound request.
pub type PendingResponse = oneshot::Receiver<Result<Value>>;

/// Identifies one registration made by [`Protocol::subscribe_tracked`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<SessionUpdate>,
}

struct ProtocolInner {
    transport: Transport,
    operations: Arc<dyn ClientOperations>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Result<Value>>>>,
    subscribers: Mutex<HashMap<String, Subscriber>>,
    next_subscription: AtomicU64,
    closed: AtomicBool,
}

/// Request/response correlation over one transport.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<ProtocolInner>,
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("transport", &self.inner.transport)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Protocol {
    /// Start `transport` with this protocol as its listener.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::IllegalState`] if the transport was already
    /// started or closed.
    pub fn start(transport: Transport, operations: Arc<dyn ClientOperations>) -> Result<Self> {
        let inner = Arc::new(ProtocolInner {
            transport,
            operations,
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        inner.transport.start(Arc::clone(&inner) as Arc<dyn TransportListener>)?;
        Ok(Self { inner })
    }

    /// Underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Whether the transport has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Send a request and wait for its result.
    ///
    /// # Errors
    ///
    /// - [`AppError::Rpc`] when the agent answers with an error object.
    /// - [`AppError::Transport`] when the request cannot be sent or the
    ///   transport closes first.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let pending = self.start_request(method, params)?;
        await_response(method, pending).await
    }

    /// Send a request and return its completion handle without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] if the transport is closed or the
    /// message could not be queued.
    pub fn start_request(&self, method: &str, params: Value) -> Result<PendingResponse> {
        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::AcqRel));
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id.clone(), tx);

        // Checked after registering so a concurrent close either sees the
        // entry or this check sees the flag.
        if self.is_closed() {
            lock(&self.inner.pending).remove(&id);
            return Err(AppError::Transport(format!("cannot send {method}: transport closed")));
        }

        debug!(transport = %self.inner.transport.name(), %id, method, "sending request");
        if let Err(err) = self
            .inner
            .transport
            .try_send(RawMessage::request(id.clone(), method, Some(params)))
        {
            lock(&self.inner.pending).remove(&id);
            return Err(err);
        }
        Ok(rx)
    }

    /// Send a notification.
    pub fn notify(&self, method: &str, params: Value) {
        self.inner
            .transport
            .send(RawMessage::notification(method, Some(params)));
    }

    /// Receive the `session/update` stream of `session_id`.
    ///
    /// A later subscription for the same session replaces this one.
    #[must_use]
    pub fn subscribe(&self, session_id: &str) -> mpsc::UnboundedReceiver<SessionUpdate> {
        self.subscribe_tracked(session_id).1
    }

    /// Like [`subscribe`](Self::subscribe), also returning the id that
    /// [`unsubscribe_if`](Self::unsubscribe_if) matches against.
    #[must_use]
    pub fn subscribe_tracked(
        &self,
        session_id: &str,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<SessionUpdate>) {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.is_closed() {
            lock(&self.inner.subscribers).insert(session_id.to_owned(), Subscriber { id, tx });
        }
        (id, rx)
    }

    /// Stop routing updates for `session_id`.
    pub fn unsubscribe(&self, session_id: &str) {
        lock(&self.inner.subscribers).remove(session_id);
    }

    /// Stop routing updates for `session_id` only while `id` is still the
    /// current subscription.
    pub fn unsubscribe_if(&self, session_id: &str, id: SubscriptionId) {
        let mut subscribers = lock(&self.inner.subscribers);
        if subscribers.get(session_id).is_some_and(|s| s.id == id) {
            subscribers.remove(session_id);
        } else {
            trace!(session_id, "subscription already replaced");
        }
    }

    /// Close the underlying transport.
    pub fn close(&self) {
        self.inner.transport.close();
    }
}

/// Wait on a handle from [`Protocol::start_request`].
///
/// # Errors
///
/// Same as [`Protocol::request`].
pub async fn await_response(method: &str, pending: PendingResponse) -> Result<Value> {
    match pending.await {
        Ok(result) => result,
        Err(_) => Err(AppError::Transport(format!("{method}: response abandoned"))),
    }
}

// ── Listener ──────────────────────────────────────────────────────────────────

impl ProtocolInner {
    fn complete(&self, response: Response) {
        let Some(tx) = lock(&self.pending).remove(&response.id) else {
            warn!(transport = %self.transport.name(), id = %response.id, "response for unknown request id");
            return;
        };
        let result = match response.payload {
            ResponsePayload::Result(value) => Ok(value),
            ResponsePayload::Error(err) => Err(AppError::from(err)),
        };
        if tx.send(result).is_err() {
            trace!(id = %response.id, "requester no longer waiting");
        }
    }

    fn route(&self, notification: Notification) {
        if notification.method != SESSION_UPDATE {
            debug!(method = %notification.method, "ignoring notification");
            return;
        }

        let params = notification.params.unwrap_or(Value::Null);
        let parsed: SessionNotification = match serde_json::from_value(params) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "malformed session/update, skipping");
                return;
            }
        };

        trace!(session_id = %parsed.session_id, update = parsed.update.label(), "session update");
        let subscribers = lock(&self.subscribers);
        match subscribers.get(&parsed.session_id) {
            Some(subscriber) => {
                if subscriber.tx.send(parsed.update).is_err() {
                    debug!(session_id = %parsed.session_id, "subscriber gone, dropping update");
                }
            }
            None => debug!(session_id = %parsed.session_id, "no subscriber, dropping update"),
        }
    }

    fn serve(&self, request: Request) {
        let operations = Arc::clone(&self.operations);
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let Request { id, method, params } = request;
            debug!(%id, method = %method, "serving agent request");
            let reply = match dispatch(operations.as_ref(), &method, params).await {
                Ok(result) => RawMessage::result(id, result),
                Err(err) => {
                    warn!(method = %method, code = err.code, message = %err.message, "agent request failed");
                    RawMessage::error(id, err)
                }
            };
            transport.send(reply);
        });
    }
}

impl TransportListener for ProtocolInner {
    fn on_message(&self, message: RawMessage) {
        match message {
            RawMessage::Response(response) => self.complete(response),
            RawMessage::Notification(notification) => self.route(notification),
            RawMessage::Request(request) => self.serve(request),
        }
    }

    fn on_error(&self, error: &AppError) {
        debug!(transport = %self.transport.name(), error = %error, "transport reported error");
    }

    fn on_close(&self) {
        self.closed.store(true, Ordering::Release);

        let drained: Vec<_> = lock(&self.pending).drain().collect();
        for (id, tx) in drained {
            trace!(%id, "failing pending request");
            let _ = tx.send(Err(AppError::Transport("transport closed".into())));
        }
        lock(&self.subscribers).clear();
        self.operations.shutdown();
        debug!(transport = %self.transport.name(), "protocol closed");
    }
}
