//! Outbound wire frames.
//!
//! The relay re-frames upstream output into its own minimal event stream.
//! Every frame is a single `data:` line followed by a blank line:
//!
//! ```text
//! data: {"content":"Hi"}
//!
//! data: {"content":" there"}
//!
//! data: [DONE]
//!
//! ```
//!
//! A failure after streaming has started is reported as `data: [ERROR]`,
//! after which the connection is closed.
//!
//! # Example
//!
//! ```rust
//! use chat_relay::frame::OutboundFrame;
//!
//! let frame = OutboundFrame::Delta("Hello".to_string());
//! assert_eq!(frame.encode(), "data: {\"content\":\"Hello\"}\n\n");
//! assert_eq!(OutboundFrame::Done.encode(), "data: [DONE]\n\n");
//! ```

use axum::body::Bytes;
use serde::{Deserialize, Serialize};

/// Terminal marker for a cleanly finished stream.
pub const DONE_MARKER: &str = "[DONE]";

/// Terminal marker for a stream that failed after headers were sent.
pub const ERROR_MARKER: &str = "[ERROR]";

/// JSON payload of a delta frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeltaPayload {
    /// The text fragment to append.
    pub content: String,
}

/// A frame written to the client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Incremental assistant text.
    Delta(String),
    /// The stream completed successfully.
    Done,
    /// The stream failed after it had started.
    Error,
}

impl OutboundFrame {
    /// Render the frame in wire format, including the blank-line terminator.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Delta(content) => {
                let payload = DeltaPayload {
                    content: content.clone(),
                };
                match serde_json::to_string(&payload) {
                    Ok(json) => format!("data: {json}\n\n"),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode delta frame");
                        format!("data: {ERROR_MARKER}\n\n")
                    }
                }
            }
            Self::Done => format!("data: {DONE_MARKER}\n\n"),
            Self::Error => format!("data: {ERROR_MARKER}\n\n"),
        }
    }

    /// Whether this frame ends the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta(_))
    }

    /// Encode into a body chunk.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_escapes_json() {
        let frame = OutboundFrame::Delta("line\n\"quoted\"".to_string());
        let encoded = frame.encode();
        assert_eq!(encoded, "data: {\"content\":\"line\\n\\\"quoted\\\"\"}\n\n");
        // Embedded newlines never leak into the framing.
        assert_eq!(encoded.matches("\n\n").count(), 1);
    }

    #[test]
    fn test_terminal_frames() {
        assert_eq!(OutboundFrame::Done.encode(), "data: [DONE]\n\n");
        assert_eq!(OutboundFrame::Error.encode(), "data: [ERROR]\n\n");
        assert!(OutboundFrame::Done.is_terminal());
        assert!(OutboundFrame::Error.is_terminal());
        assert!(!OutboundFrame::Delta(String::new()).is_terminal());
    }

    #[test]
    fn test_payload_round_trip() {
        let encoded = OutboundFrame::Delta("你好 **x**".to_string()).encode();
        let json = encoded
            .strip_prefix("data: ")
            .and_then(|s| s.strip_suffix("\n\n"))
            .unwrap();
        let payload: DeltaPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.content, "你好 **x**");
    }
}
