//! NDJSON framing for agent streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! misbehaving agent cannot make the reader allocate without bound for a
//! single unterminated line.
//!
//! Use [`AcpCodec`] as the codec parameter for
//! [`tokio_util::codec::FramedRead`] (inbound) and
//! [`tokio_util::codec::FramedWrite`] (outbound). Both directions use UTF-8
//! lines delimited by `\n`; the encoder appends the terminator.

use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Default maximum inbound line length: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// A complete line, without its terminator.
    Line(String),
    /// A line exceeded the limit and was discarded.
    Oversized {
        /// The limit that was exceeded.
        limit: usize,
    },
    /// A complete line that is not valid UTF-8; it was consumed.
    Malformed {
        /// Decoder message.
        reason: String,
    },
}

/// NDJSON line codec for bidirectional agent streams.
///
/// # Decoder
///
/// Inbound lines longer than the configured limit yield
/// [`InboundFrame::Oversized`] rather than an error: a framed stream treats
/// any decoder error as fatal, but one over-long line must not end the
/// conversation. The inner codec discards the rest of that line and resumes
/// at the next `\n`. A line that is not valid UTF-8 yields
/// [`InboundFrame::Malformed`] for the same reason. Other I/O errors map to
/// [`AppError::Transport`].
///
/// # Encoder
///
/// Outbound strings are written as `item\n`. The limit is not enforced on
/// encode.
#[derive(Debug)]
pub struct AcpCodec {
    inner: LinesCodec,
    max_line_bytes: usize,
}

impl AcpCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom inbound line limit.
    #[must_use]
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_line_bytes),
            max_line_bytes,
        }
    }

    /// The configured inbound line limit.
    #[must_use]
    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    fn map_decoded(
        &self,
        decoded: std::result::Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<InboundFrame>> {
        match decoded {
            Ok(line) => Ok(line.map(InboundFrame::Line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(InboundFrame::Oversized {
                limit: self.max_line_bytes,
            })),
            // The inner codec has already consumed the offending line.
            Err(LinesCodecError::Io(io_err)) if io_err.kind() == io::ErrorKind::InvalidData => {
                Ok(Some(InboundFrame::Malformed {
                    reason: io_err.to_string(),
                }))
            }
            Err(LinesCodecError::Io(io_err)) => Err(AppError::Transport(io_err.to_string())),
        }
    }
}

impl Default for AcpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AcpCodec {
    type Item = InboundFrame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let decoded = self.inner.decode(src);
        self.map_decoded(decoded)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let decoded = self.inner.decode_eof(src);
        self.map_decoded(decoded)
    }
}

impl Encoder<String> for AcpCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.inner.encode(item, dst).map_err(|e| match e {
            LinesCodecError::Io(io_err) => AppError::Transport(io_err.to_string()),
            LinesCodecError::MaxLineLengthExceeded => {
                AppError::Transport("line too long on encode".into())
            }
        })
    }
}

