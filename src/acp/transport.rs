//! Lifecycle-managed bidirectional message transport over a pair of byte
//! streams (the agent's stdout and stdin).
//!
//! ## State machine
//!
//! ```text
//! CREATED ──start──▶ STARTING ──▶ STARTED ──close──▶ CLOSING ──▶ CLOSED
//!    │                                                   ▲
//!    └────────────────────────close──────────────────────┘
//! ```
//!
//! Every transition is a single compare-and-set on an atomic. A reader or
//! writer task that exits for any reason calls [`Transport::close`], which is
//! idempotent. A supervisor task waits for both workers and then moves the
//! transport to `CLOSED` and notifies the listener's close hook exactly once.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::acp::codec::{AcpCodec, MAX_LINE_BYTES};
use crate::acp::message::RawMessage;
use crate::acp::reader::run_reader;
use crate::acp::writer::{outbound_queue, run_writer, EnqueueError, OutboundReceiver, OutboundSender};
use crate::config::BridgeConfig;
use crate::sync::lock;
use crate::{AppError, Result};

/// Boxed inbound byte stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed outbound byte stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ── State ─────────────────────────────────────────────────────────────────────

/// Transport lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    /// Constructed, workers not running.
    Created = 0,
    /// `start` won the race and is spawning workers.
    Starting = 1,
    /// Workers running.
    Started = 2,
    /// `close` won the race; workers are winding down.
    Closing = 3,
    /// Terminal.
    Closed = 4,
}

impl TransportState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl Display for TransportState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

// ── Listener ──────────────────────────────────────────────────────────────────

/// Receives inbound messages and lifecycle notifications from a [`Transport`].
///
/// Callbacks run on the transport's tasks and must not block.
pub trait TransportListener: Send + Sync {
    /// A decoded inbound message.
    fn on_message(&self, message: RawMessage);

    /// A non-fatal report (dropped send) or the fatal error that ended a
    /// worker.
    fn on_error(&self, error: &AppError) {
        let _ = error;
    }

    /// The transport reached `CLOSED`. Called at most once.
    fn on_close(&self) {}
}

// ── Options ───────────────────────────────────────────────────────────────────

/// Tunables for a [`Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    /// Outbound queue capacity; `None` is unbounded.
    pub queue_capacity: Option<usize>,
    /// Inbound line limit in bytes.
    pub max_line_bytes: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            queue_capacity: None,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }
}

impl TransportOptions {
    /// Derive options from the bridge configuration.
    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            queue_capacity: config.transport_queue.capacity,
            max_line_bytes: config.max_line_bytes,
        }
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

struct PendingIo {
    input: BoxedReader,
    output: BoxedWriter,
    queue: OutboundReceiver,
}

/// Held strongly while running; downgraded once closed so late send
/// failures still reach a listener the owner keeps alive.
enum ListenerSlot {
    Empty,
    Active(Arc<dyn TransportListener>),
    Released(Weak<dyn TransportListener>),
}

struct Inner {
    name: String,
    state: AtomicU8,
    options: TransportOptions,
    outbound: Mutex<Option<OutboundSender>>,
    pending: Mutex<Option<PendingIo>>,
    listener: Mutex<ListenerSlot>,
    cancel: CancellationToken,
    close_notified: AtomicBool,
}

/// Bidirectional JSON-RPC message transport over two byte streams.
///
/// Cheap to clone; all clones share one lifecycle.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Wrap `input` (agent stdout) and `output` (agent stdin).
    ///
    /// Nothing is read or written until [`start`](Self::start).
    pub fn new<R, W>(name: impl Into<String>, input: R, output: W, options: TransportOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, queue) = outbound_queue(options.queue_capacity);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: AtomicU8::new(TransportState::Created as u8),
                options,
                outbound: Mutex::new(Some(tx)),
                pending: Mutex::new(Some(PendingIo {
                    input: Box::new(input),
                    output: Box::new(output),
                    queue,
                })),
                listener: Mutex::new(ListenerSlot::Empty),
                cancel: CancellationToken::new(),
                close_notified: AtomicBool::new(false),
            }),
        }
    }

    /// Transport name used in log fields.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Whether the transport still accepts and delivers messages.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(
            self.state(),
            TransportState::Created | TransportState::Starting | TransportState::Started
        )
    }

    /// Start the read and write workers, delivering to `listener`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::IllegalState`] unless the transport is `CREATED`.
    pub fn start(&self, listener: Arc<dyn TransportListener>) -> Result<()> {
        self.transition(TransportState::Created, TransportState::Starting)
            .map_err(|actual| {
                AppError::IllegalState(format!(
                    "transport {} is not in CREATED state (was {actual})",
                    self.inner.name
                ))
            })?;

        *lock(&self.inner.listener) = ListenerSlot::Active(listener);

        let Some(io) = lock(&self.inner.pending).take() else {
            return Err(AppError::IllegalState(format!(
                "transport {} streams already released",
                self.inner.name
            )));
        };

        let reader = tokio::spawn(read_side(self.clone(), io.input));
        let writer = tokio::spawn(write_side(self.clone(), io.output, io.queue));

        if let Err(actual) = self.transition(TransportState::Starting, TransportState::Started) {
            warn!(
                transport = %self.inner.name,
                state = %actual,
                "transport is not in STARTING state after spawning workers"
            );
        }

        tokio::spawn(supervise(self.clone(), reader, writer));
        info!(transport = %self.inner.name, "transport started");
        Ok(())
    }

    /// Queue `message` for the writer. Never blocks.
    ///
    /// When the transport is closed or a bounded queue is full the message is
    /// dropped and reported through the listener's error hook.
    pub fn send(&self, message: RawMessage) {
        let _ = self.try_send(message);
    }

    /// Like [`send`](Self::send), but also tells the caller whether the
    /// message was queued.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] when the message was dropped. The
    /// listener is notified either way.
    pub fn try_send(&self, message: RawMessage) -> Result<()> {
        trace!(transport = %self.inner.name, ?message, "sending message");

        let outcome = match lock(&self.inner.outbound).as_ref() {
            Some(tx) => tx.try_send(message),
            None => Err(EnqueueError::Closed),
        };

        outcome.map_err(|reason| {
            let detail = match reason {
                EnqueueError::Closed => "outbound queue closed",
                EnqueueError::Full => "outbound queue full",
            };
            debug!(transport = %self.inner.name, detail, "message dropped");
            let err = AppError::Transport(format!("message dropped: {detail}"));
            self.report_error(&err);
            err
        })
    }

    /// Close the transport. Idempotent and safe to race from any task.
    ///
    /// Stops inbound dispatch and lets both workers close their streams. A
    /// transport that was never started drops its streams here and reaches
    /// `CLOSED` immediately.
    pub fn close(&self) {
        let old = self.state();
        if matches!(old, TransportState::Closing | TransportState::Closed) {
            trace!(transport = %self.inner.name, "transport is already closed or closing");
            return;
        }

        if self.transition(old, TransportState::Closing).is_err() {
            debug!(transport = %self.inner.name, "state changed concurrently, do nothing");
            return;
        }

        debug!(transport = %self.inner.name, from = %old, "closing transport");
        lock(&self.inner.outbound).take();
        self.inner.cancel.cancel();

        if old == TransportState::Created {
            if lock(&self.inner.pending).take().is_some() {
                trace!(transport = %self.inner.name, "released streams of unstarted transport");
            }
            if let Err(actual) = self.transition(TransportState::Closing, TransportState::Closed) {
                warn!(transport = %self.inner.name, state = %actual, "transport is not in CLOSING state");
            }
            self.notify_closed();
        }
    }

    // ── Private helpers ──────────────────────────────────────────────────────

    fn transition(
        &self,
        from: TransportState,
        to: TransportState,
    ) -> std::result::Result<(), TransportState> {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TransportState::from_u8)
    }

    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        match &*lock(&self.inner.listener) {
            ListenerSlot::Empty => None,
            ListenerSlot::Active(listener) => Some(Arc::clone(listener)),
            ListenerSlot::Released(listener) => listener.upgrade(),
        }
    }

    fn dispatch(&self, message: RawMessage) {
        if self.inner.cancel.is_cancelled() {
            trace!(transport = %self.inner.name, "transport closing, dropping inbound message");
            return;
        }
        if let Some(listener) = self.listener() {
            listener.on_message(message);
        }
    }

    fn report_error(&self, err: &AppError) {
        if let Some(listener) = self.listener() {
            listener.on_error(err);
        }
    }

    fn notify_closed(&self) {
        if self.inner.close_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        // Downgrading breaks the listener/transport reference cycle.
        let listener = {
            let mut slot = lock(&self.inner.listener);
            match std::mem::replace(&mut *slot, ListenerSlot::Empty) {
                ListenerSlot::Active(listener) => {
                    *slot = ListenerSlot::Released(Arc::downgrade(&listener));
                    Some(listener)
                }
                other => {
                    *slot = other;
                    None
                }
            }
        };
        if let Some(listener) = listener {
            listener.on_close();
        }
        info!(transport = %self.inner.name, "transport closed");
    }
}

// ── Worker tasks ──────────────────────────────────────────────────────────────

async fn read_side(transport: Transport, input: BoxedReader) {
    let codec = AcpCodec::with_max_line_bytes(transport.inner.options.max_line_bytes);
    let cancel = transport.inner.cancel.clone();
    let name = transport.inner.name.clone();
    let result = run_reader(&name, input, codec, cancel, |msg| transport.dispatch(msg)).await;

    if let Err(err) = result {
        error!(transport = %name, error = %err, "read failed");
        transport.report_error(&err);
    }
    transport.close();
}

async fn write_side(transport: Transport, output: BoxedWriter, queue: OutboundReceiver) {
    let codec = AcpCodec::with_max_line_bytes(transport.inner.options.max_line_bytes);
    let cancel = transport.inner.cancel.clone();
    let name = transport.inner.name.clone();
    let result = run_writer(&name, output, codec, queue, cancel).await;

    if let Err(err) = result {
        error!(transport = %name, error = %err, "write failed");
        transport.report_error(&err);
    }
    transport.close();
}

/// Parent of both workers: whichever ends first closes the transport, which
/// cancels the other.
async fn supervise(transport: Transport, mut reader: JoinHandle<()>, mut writer: JoinHandle<()>) {
    let (reader_first, joined) = tokio::select! {
        joined = &mut reader => (true, joined),
        joined = &mut writer => (false, joined),
    };

    let (first, second, remaining) = if reader_first {
        ("reader", "writer", writer)
    } else {
        ("writer", "reader", reader)
    };

    report_join(&transport, first, joined);
    transport.close();
    report_join(&transport, second, remaining.await);

    if let Err(actual) = transport.transition(TransportState::Closing, TransportState::Closed) {
        warn!(transport = %transport.inner.name, state = %actual, "transport is not in CLOSING state");
        transport
            .inner
            .state
            .store(TransportState::Closed as u8, Ordering::Release);
    }
    transport.notify_closed();
}

fn report_join(transport: &Transport, worker: &str, joined: std::result::Result<(), JoinError>) {
    match joined {
        Ok(()) => trace!(transport = %transport.inner.name, worker, "worker finished"),
        Err(err) if err.is_panic() => {
            error!(transport = %transport.inner.name, worker, "worker panicked");
            transport.report_error(&AppError::Transport(format!("{worker} task panicked")));
        }
        Err(_) => debug!(transport = %transport.inner.name, worker, "worker cancelled"),
    }
}
