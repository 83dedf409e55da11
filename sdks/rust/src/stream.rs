//! Relay stream consumer.
//!
//! The relay writes one event per `data: ...\n\n` block. Network reads can
//! split a block anywhere (inside the JSON payload, inside the `data:` marker,
//! inside a multi-byte character), so bytes are buffered and only complete
//! blocks are decoded.
//!
//! A malformed payload stops the exchange with [`Error::FrameParse`]; partial
//! text that may be corrupt is never handed back as a completed reply.

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::DeltaPayload;

const DATA_PREFIX: &str = "data:";
const DONE_MARKER: &str = "[DONE]";
const ERROR_MARKER: &str = "[ERROR]";

/// One decoded relay frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Incremental assistant text.
    Delta(String),
    /// Clean end of the reply.
    Done,
    /// In-band failure after streaming started.
    Error,
}

/// How a consumed stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The relay sent `[DONE]`; holds the full reply.
    Completed(String),
    /// The token fired first; holds the text received so far.
    Cancelled {
        /// Accumulated text at the moment of cancellation.
        partial: String,
    },
}

/// Splits a byte stream into blank-line delimited events.
#[derive(Debug, Default)]
pub struct EventDecoder {
    buf: Vec<u8>,
}

impl EventDecoder {
    /// Append bytes from one network read.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete event, without its trailing blank line.
    pub fn next_event(&mut self) -> Option<String> {
        let end = self.buf.windows(2).position(|w| w == b"\n\n")?;
        let event: Vec<u8> = self.buf.drain(..end + 2).take(end).collect();
        Some(String::from_utf8_lossy(&event).into_owned())
    }

    /// Whatever is left once the stream has ended.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            self.buf.clear();
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Decode the frames in one event block. Non-data lines are ignored.
///
/// # Errors
///
/// Returns [`Error::FrameParse`] if a data payload is not a valid delta.
pub fn parse_event(event: &str) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    for line in event.lines() {
        let Some(payload) = line.trim_end_matches('\r').strip_prefix(DATA_PREFIX) else {
            continue;
        };
        let frame = match payload.trim() {
            DONE_MARKER => Frame::Done,
            ERROR_MARKER => Frame::Error,
            json => Frame::Delta(serde_json::from_str::<DeltaPayload>(json)?.content),
        };
        frames.push(frame);
    }
    Ok(frames)
}

/// Read a relay body to its end, calling `on_chunk(delta, full)` for every
/// delta in arrival order.
///
/// Cancellation is checked before every read and before every callback, so
/// nothing is delivered once the token has fired.
///
/// # Errors
///
/// - [`Error::FrameParse`] on a malformed payload
/// - [`Error::StreamFailed`] on an in-band `[ERROR]`
/// - [`Error::StreamEnded`] if the body closes without `[DONE]`
/// - the transport error if a read fails
pub async fn consume<S, B, E, F>(
    bytes: S,
    cancel: &CancellationToken,
    mut on_chunk: F,
) -> Result<StreamOutcome>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<Error>,
    F: FnMut(&str, &str),
{
    futures::pin_mut!(bytes);
    let mut decoder = EventDecoder::default();
    let mut full = String::new();
    let mut deltas = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Ok(StreamOutcome::Cancelled { partial: full });
            }
            next = bytes.next() => next,
        };

        let ended = next.is_none();
        let events: Vec<String> = match next {
            Some(Ok(chunk)) => {
                decoder.extend(chunk.as_ref());
                std::iter::from_fn(|| decoder.next_event()).collect()
            }
            Some(Err(e)) => return Err(e.into()),
            None => decoder.take_remainder().into_iter().collect(),
        };

        for event in &events {
            for frame in parse_event(event)? {
                if cancel.is_cancelled() {
                    return Ok(StreamOutcome::Cancelled { partial: full });
                }
                match frame {
                    Frame::Delta(delta) => {
                        deltas += 1;
                        full.push_str(&delta);
                        on_chunk(&delta, &full);
                    }
                    Frame::Done => {
                        debug!(deltas, chars = full.chars().count(), "Relay stream completed");
                        return Ok(StreamOutcome::Completed(full));
                    }
                    Frame::Error => return Err(Error::StreamFailed),
                }
            }
        }

        if ended {
            return Err(Error::StreamEnded);
        }
    }
}
