//! OpenAI-compatible Chat Completions driver.
//!
//! This module implements the [`LlmDriver`] trait for `/v1/chat/completions`
//! with `stream: true`. Only text deltas are relayed; the upstream status is
//! classified before any byte of the body is read.

use axum::body::Bytes;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use tracing::warn;

use crate::error::RelayError;

use super::sse::{DONE_SENTINEL, LineBuffer, data_payload};
use super::{DeltaStream, LlmDriver, LlmRequest, LlmSettings, UpstreamEvent};

/// Driver for the Chat Completions API.
#[derive(Clone)]
pub struct ChatCompletionsDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsDriver")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ChatCompletionsDriver {
    /// Create a new Chat Completions driver with the given settings.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn request_body(&self, req: &LlmRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.settings.model,
            "messages": req.messages,
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens,
            "stream": true,
        })
    }
}

#[async_trait::async_trait]
impl LlmDriver for ChatCompletionsDriver {
    async fn stream(&self, req: LlmRequest) -> Result<DeltaStream, RelayError> {
        let Some(api_key) = self.settings.api_key.as_deref() else {
            return Err(RelayError::Configuration(
                "upstream API key is not configured".to_string(),
            ));
        };

        let url = self.settings.provider.build_chat_url(&self.settings.base_url);
        let body = self.request_body(&req);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::StreamTransport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, resp).await);
        }

        Ok(Box::pin(upstream_events(resp.bytes_stream())))
    }
}

/// Map a non-success upstream response to a relay error.
async fn classify_status(status: StatusCode, resp: reqwest::Response) -> RelayError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => RelayError::UpstreamRateLimit,
        StatusCode::UNAUTHORIZED => RelayError::UpstreamAuth,
        StatusCode::INTERNAL_SERVER_ERROR => RelayError::UpstreamFault,
        other => {
            let body = resp
                .json::<serde_json::Value>()
                .await
                .unwrap_or(serde_json::Value::Null);
            let message = body["error"]["message"]
                .as_str()
                .map_or_else(|| format!("HTTP error! status: {}", other.as_u16()), ToString::to_string);
            RelayError::UpstreamGeneric {
                status: other.as_u16(),
                message,
            }
        }
    }
}

/// What a single upstream line means to the reader.
#[derive(Debug, PartialEq, Eq)]
enum LineEvent {
    Skip,
    Delta(String),
    Done,
}

/// Decode the upstream byte stream into ordered [`UpstreamEvent`]s.
///
/// Lines that are not data lines are skipped. A data line whose JSON cannot
/// be parsed is logged and skipped without ending the stream. The stream
/// always finishes with [`UpstreamEvent::Done`] unless a transport error
/// occurs, in which case that error is the last item.
pub fn upstream_events<S, E>(byte_stream: S) -> impl Stream<Item = Result<UpstreamEvent, RelayError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::try_stream! {
        let mut lines = LineBuffer::default();
        let mut finished = false;

        futures::pin_mut!(byte_stream);
        'read: while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| RelayError::StreamTransport(e.to_string()))?;
            lines.extend(&chunk);

            while let Some(line) = lines.next_line() {
                match decode_line(&line) {
                    LineEvent::Skip => {}
                    LineEvent::Delta(text) => yield UpstreamEvent::Delta(text),
                    LineEvent::Done => {
                        finished = true;
                        break 'read;
                    }
                }
            }
        }

        // A final line without a trailing newline is still a complete line.
        if !finished {
            if let Some(line) = lines.take_remainder() {
                if let LineEvent::Delta(text) = decode_line(&line) {
                    yield UpstreamEvent::Delta(text);
                }
            }
        }

        yield UpstreamEvent::Done;
    }
}

fn decode_line(line: &str) -> LineEvent {
    let Some(data) = data_payload(line) else {
        return LineEvent::Skip;
    };
    if data == DONE_SENTINEL {
        return LineEvent::Done;
    }

    match parse_frame(data) {
        Ok(v) => {
            // Streaming responses carry text in `delta`, never in `message`.
            match v["choices"][0]["delta"]["content"].as_str() {
                Some(s) if !s.is_empty() => LineEvent::Delta(s.to_string()),
                _ => LineEvent::Skip,
            }
        }
        Err(e) => {
            warn!(
                name: "relay.frame.parse_failed",
                error = %e,
                error_kind = e.kind(),
                data = %preview(data, 100),
                "Skipping malformed upstream frame"
            );
            metrics::counter!("relay_frame_parse_failures_total").increment(1);
            LineEvent::Skip
        }
    }
}

fn parse_frame(data: &str) -> Result<serde_json::Value, RelayError> {
    Ok(serde_json::from_str(data)?)
}

/// First `max` characters of `s`, for logs.
pub(crate) fn preview(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> Result<Bytes, std::io::Error> {
        Ok(Bytes::from(text.to_string()))
    }

    fn data(content: &str) -> String {
        let json = serde_json::json!({ "choices": [{ "index": 0, "delta": { "content": content } }] });
        format!("data: {json}\n\n")
    }

    async fn collect(chunks: Vec<Result<Bytes, std::io::Error>>) -> Vec<Result<UpstreamEvent, RelayError>> {
        upstream_events(futures::stream::iter(chunks)).collect().await
    }

    #[tokio::test]
    async fn test_deltas_in_order() {
        let body = format!("{}{}data: [DONE]\n\n", data("Hi"), data(" there"));
        let events = collect(vec![chunk(&body)]).await;
        let events: Vec<_> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            events,
            vec![
                UpstreamEvent::Delta("Hi".into()),
                UpstreamEvent::Delta(" there".into()),
                UpstreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_every_split_point_yields_same_deltas() {
        let body = format!("{}{}{}data: [DONE]\n\n", data("Hel"), data("lo, "), data("世界"));
        let bytes = body.as_bytes();
        for split in 1..bytes.len() {
            let chunks = vec![
                Ok(Bytes::copy_from_slice(&bytes[..split])),
                Ok(Bytes::copy_from_slice(&bytes[split..])),
            ];
            let text: String = collect(chunks)
                .await
                .into_iter()
                .filter_map(|e| match e.unwrap() {
                    UpstreamEvent::Delta(t) => Some(t),
                    UpstreamEvent::Done => None,
                })
                .collect();
            assert_eq!(text, "Hello, 世界", "split at {split}");
        }
    }

    #[test]
    fn test_malformed_payload_is_frame_parse_error() {
        let err = parse_frame("{\"choices\": [").unwrap_err();
        assert!(matches!(err, RelayError::FrameParse(_)));
        assert_eq!(err.kind(), "frame_parse");
        assert!(parse_frame("{\"choices\": []}").is_ok());
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_end_stream() {
        let body = format!("{}data: {{not json\n\n{}data: [DONE]\n\n", data("a"), data("b"));
        let events: Vec<_> = collect(vec![chunk(&body)])
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            events,
            vec![
                UpstreamEvent::Delta("a".into()),
                UpstreamEvent::Delta("b".into()),
                UpstreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_non_data_lines_and_empty_content_are_skipped() {
        let role_only = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        let body = format!(": keep-alive\nevent: message\n{role_only}\n\n{}data: [DONE]\n\n", data("x"));
        let events: Vec<_> = collect(vec![chunk(&body)])
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            events,
            vec![UpstreamEvent::Delta("x".into()), UpstreamEvent::Done]
        );
    }

    #[tokio::test]
    async fn test_natural_end_without_done_marker() {
        let body = data("tail");
        let trimmed = body.trim_end();
        let events: Vec<_> = collect(vec![chunk(trimmed)])
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            events,
            vec![UpstreamEvent::Delta("tail".into()), UpstreamEvent::Done]
        );
    }

    #[tokio::test]
    async fn test_transport_error_is_last_item() {
        let chunks = vec![
            chunk(&data("partial")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            chunk(&data("never")),
        ];
        let events = collect(chunks).await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            *events[0].as_ref().unwrap(),
            UpstreamEvent::Delta("partial".into())
        );
        assert!(matches!(events[1], Err(RelayError::StreamTransport(_))));
    }

    #[tokio::test]
    async fn test_done_stops_reading() {
        let body = format!("{}data: [DONE]\n\n{}", data("a"), data("after"));
        let events: Vec<_> = collect(vec![chunk(&body)])
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            events,
            vec![UpstreamEvent::Delta("a".into()), UpstreamEvent::Done]
        );
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("abc", 5), "abc");
        assert_eq!(preview("你好世界", 2), "你好...");
    }
}
