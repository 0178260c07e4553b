//! Transport write task and outbound queue.
//!
//! A single writer drains the outbound queue in FIFO order, encodes each
//! [`RawMessage`] to one JSON line, writes it followed by `\n`, and flushes.
//! Send order into the queue is therefore the order on the wire.

use std::time::Duration;

use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::acp::codec::AcpCodec;
use crate::acp::message::{self, RawMessage};
use crate::Result;

// ── Outbound queue ────────────────────────────────────────────────────────────

/// Producer side of the outbound queue (many producers).
#[derive(Debug, Clone)]
pub enum OutboundSender {
    /// Unbounded queue; never full.
    Unbounded(mpsc::UnboundedSender<RawMessage>),
    /// Bounded queue; full sends are rejected instead of waiting.
    Bounded(mpsc::Sender<RawMessage>),
}

/// Consumer side of the outbound queue (the single writer).
#[derive(Debug)]
pub enum OutboundReceiver {
    /// Unbounded queue.
    Unbounded(mpsc::UnboundedReceiver<RawMessage>),
    /// Bounded queue.
    Bounded(mpsc::Receiver<RawMessage>),
}

/// Why an enqueue failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The writer is gone.
    Closed,
    /// The bounded queue has no room.
    Full,
}

/// Create an outbound queue; `capacity: None` means unbounded.
#[must_use]
pub fn outbound_queue(capacity: Option<usize>) -> (OutboundSender, OutboundReceiver) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (OutboundSender::Bounded(tx), OutboundReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (OutboundSender::Unbounded(tx), OutboundReceiver::Unbounded(rx))
        }
    }
}

impl OutboundSender {
    /// Enqueue without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::Closed`] if the receiver was dropped, or
    /// [`EnqueueError::Full`] if a bounded queue is at capacity.
    pub fn try_send(&self, message: RawMessage) -> std::result::Result<(), EnqueueError> {
        match self {
            Self::Unbounded(tx) => tx.send(message).map_err(|_| EnqueueError::Closed),
            Self::Bounded(tx) => tx.try_send(message).map_err(|e| match e {
                TrySendError::Full(_) => EnqueueError::Full,
                TrySendError::Closed(_) => EnqueueError::Closed,
            }),
        }
    }
}

impl OutboundReceiver {
    /// Wait for the next queued message; `None` once all senders are gone.
    pub async fn recv(&mut self) -> Option<RawMessage> {
        match self {
            Self::Unbounded(rx) => rx.recv().await,
            Self::Bounded(rx) => rx.recv().await,
        }
    }
}

// ── Writer task ───────────────────────────────────────────────────────────────

/// How long the writer waits for the final flush and shutdown.
pub const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Write task body: drains `queue` into `output` until the queue closes,
/// a write fails, or `cancel` fires.
///
/// A write blocked on a peer that stopped reading is abandoned when `cancel`
/// fires. On every exit path the output stream is flushed and shut down
/// once, bounded by [`CLOSE_GRACE`]; a failure there is logged and
/// swallowed.
///
/// # Errors
///
/// Returns [`AppError::Transport`](crate::AppError::Transport) when a write
/// or flush fails. Messages that cannot be encoded are logged and skipped.
pub async fn run_writer<W>(
    name: &str,
    output: W,
    codec: AcpCodec,
    mut queue: OutboundReceiver,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(output, codec);

    let outcome = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(transport = name, "writer: cancellation received, stopping");
                break Ok(());
            }

            msg = queue.recv() => {
                let Some(msg) = msg else {
                    debug!(transport = name, "writer: outbound queue closed, stopping");
                    break Ok(());
                };

                let line = match message::encode(&msg) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(transport = name, error = %err, "writer: failed to encode message, skipping");
                        continue;
                    }
                };

                trace!(transport = name, %line, "writer: sending line");

                // `send` writes the line plus terminator and flushes; a peer
                // that stops reading must not hold the writer past cancel.
                let sent = tokio::select! {
                    biased;

                    () = cancel.cancelled() => None,
                    sent = framed.send(line) => Some(sent),
                };
                match sent {
                    None => {
                        debug!(transport = name, "writer: cancelled during write, stopping");
                        break Ok(());
                    }
                    Some(Err(err)) => {
                        warn!(transport = name, error = %err, "writer: output stream failed, stopping");
                        break Err(err);
                    }
                    Some(Ok(())) => {}
                }
            }
        }
    };

    match tokio::time::timeout(CLOSE_GRACE, framed.close()).await {
        Ok(Ok(())) => trace!(transport = name, "writer: output stream closed"),
        Ok(Err(err)) => {
            debug!(transport = name, error = %err, "writer: exception when closing output stream");
        }
        Err(_) => {
            debug!(transport = name, "writer: output stream did not close in time, dropping it");
        }
    }

    outcome
}
