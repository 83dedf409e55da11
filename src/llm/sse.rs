//! Line framing for upstream event streams.
//!
//! Network reads do not respect line boundaries, so raw bytes are buffered
//! and only complete lines are handed out. Splitting happens on bytes, which
//! keeps multi-byte UTF-8 sequences intact when a read ends mid-character.

/// Marker that prefixes every data line.
pub const DATA_PREFIX: &str = "data:";

/// Upstream completion marker.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Accumulates raw bytes and yields complete `\n`-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Append a freshly read chunk.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete line, without its terminator.
    ///
    /// A trailing `\r` is stripped so CRLF streams decode the same as LF.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let line = self.buf.drain(..=pos).collect::<Vec<_>>();
        let text = String::from_utf8_lossy(&line[..pos]);
        Some(text.trim_end_matches('\r').to_string())
    }

    /// Take whatever is left once the stream has ended.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&rest);
        Some(text.trim_end_matches('\r').to_string())
    }
}

/// Extract the payload of a data line, or `None` for any other line.
#[must_use]
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix(DATA_PREFIX).map(str::trim)
}
