//! Transport read task.
//!
//! Reads newline-delimited JSON from the agent's stdout, decodes each line
//! into a [`RawMessage`], and hands it to the dispatch callback.
//!
//! The reader is driven by [`FramedRead`] backed by [`AcpCodec`], which
//! enforces the per-line limit before any JSON parsing happens.
//!
//! | Input                         | Outcome                                   |
//! |-------------------------------|-------------------------------------------|
//! | decodable line                | dispatched                                |
//! | blank line                    | skipped silently                          |
//! | malformed / untaggable line   | logged at `WARN`, skipped                 |
//! | over-long line                | logged at `WARN`, skipped                 |
//! | line that is not UTF-8        | logged at `WARN`, skipped                 |
//! | EOF                           | `Ok(())`                                  |
//! | cancellation                  | `Ok(())`                                  |
//! | I/O failure                   | `Err(AppError::Transport)`                |

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::acp::codec::{AcpCodec, InboundFrame};
use crate::acp::message::{self, RawMessage};
use crate::Result;

/// Read task body: decodes lines from `input` until EOF, failure, or cancel.
///
/// Cancellation is checked before every read (`biased` select), so a closed
/// transport stops dispatching even when more input is already buffered.
/// The input stream is dropped (closed) when this function returns.
///
/// # Errors
///
/// Returns [`AppError::Transport`](crate::AppError::Transport) when the
/// underlying stream fails. Decode failures never end the loop.
pub async fn run_reader<R, F>(
    name: &str,
    input: R,
    codec: AcpCodec,
    cancel: CancellationToken,
    mut dispatch: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(RawMessage),
{
    let mut framed = FramedRead::new(input, codec);

    let outcome = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(transport = name, "reader: cancellation received, stopping");
                break Ok(());
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(transport = name, "reader: end of stream");
                        break Ok(());
                    }

                    Some(Err(err)) => {
                        warn!(transport = name, error = %err, "reader: input stream failed, stopping");
                        break Err(err);
                    }

                    Some(Ok(InboundFrame::Oversized { limit })) => {
                        warn!(transport = name, limit, "reader: line exceeds limit, skipping");
                    }

                    Some(Ok(InboundFrame::Malformed { reason })) => {
                        warn!(transport = name, %reason, "reader: undecodable line, skipping");
                    }

                    Some(Ok(InboundFrame::Line(line))) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match message::decode(&line) {
                            Ok(msg) => {
                                trace!(transport = name, ?msg, "reader: dispatching message");
                                dispatch(msg);
                            }
                            Err(err) => {
                                warn!(
                                    transport = name,
                                    error = %err,
                                    raw_line = %line,
                                    "reader: failed to decode line, skipping"
                                );
                            }
                        }
                    }
                }
            }
        }
    };

    drop(framed);
    trace!(transport = name, "reader: input stream closed");
    outcome
}
