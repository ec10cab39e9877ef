//! Line framing for the agent's stream-json stdout.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] so a JSON object split across
//! two reads stays buffered until its terminating `\n` arrives. A per-line
//! cap keeps a misbehaving agent from growing the buffer without bound.
//!
//! Lines that cannot be delivered (over the cap, or not UTF-8) come out as
//! [`Frame::Skipped`] instead of a decoder error. `FramedRead` ends the
//! stream after any decoder error, so only real read failures are errors.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use agent_relay::agent::codec::AgentCodec;
//!
//! let lines = FramedRead::new(child_stdout, AgentCodec::new());
//! ```

use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Default maximum line length: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One decoded stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line without its terminator.
    Line(String),
    /// A line that was dropped; carries the reason.
    Skipped(String),
}

/// Newline-delimited UTF-8 decoder for agent output.
///
/// A line longer than the configured limit yields
/// [`Frame::Skipped`]`("line too long: …")`; the codec then discards input
/// up to the next newline and resumes. Invalid UTF-8 skips just that line.
/// Read failures of the underlying stream map to [`AppError::Io`].
#[derive(Debug)]
pub struct AgentCodec {
    inner: LinesCodec,
    max_length: usize,
}

impl AgentCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom per-line limit.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
        }
    }
}

impl Default for AgentCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AgentCodec {
    type Item = Frame;
    type Error = AppError;

    /// Returns `Ok(None)` while `src` holds only a partial line.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let decoded = self.inner.decode(src);
        classify(decoded, self.max_length)
    }

    /// Yields a trailing unterminated line once the stream hits EOF.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let decoded = self.inner.decode_eof(src);
        classify(decoded, self.max_length)
    }
}

// ── Private helper ────────────────────────────────────────────────────────────

/// Turn per-line [`LinesCodecError`]s into [`Frame::Skipped`].
///
/// `LinesCodec` consumes the offending line before reporting it, so
/// decoding can continue with the next one.
fn classify(
    decoded: std::result::Result<Option<String>, LinesCodecError>,
    max_length: usize,
) -> Result<Option<Frame>> {
    match decoded {
        Ok(line) => Ok(line.map(Frame::Line)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Skipped(format!(
            "line too long: exceeded {max_length} bytes"
        )))),
        Err(LinesCodecError::Io(err)) if err.kind() == io::ErrorKind::InvalidData => {
            Ok(Some(Frame::Skipped(format!("invalid line: {err}"))))
        }
        Err(LinesCodecError::Io(err)) => Err(AppError::Io(err.to_string())),
    }
}
