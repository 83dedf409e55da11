//! Relay controller.
//!
//! Validates an inbound chat request, opens the upstream stream through an
//! [`LlmDriver`], and re-frames every upstream delta as an [`OutboundFrame`].
//!
//! The upstream status is classified inside [`LlmDriver::stream`], which
//! completes before any response byte is produced. Once [`open_relay`]
//! returns a response, every later failure is an in-band `[ERROR]` frame.
//!
//! The upstream connection lives inside the response body stream. When the
//! client goes away, the server drops the body, which drops the upstream
//! connection with it.

use std::convert::Infallible;
use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderValue, header},
    response::Response,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::error::RelayError;
use crate::frame::OutboundFrame;
use crate::llm::chat_completions::preview;
use crate::llm::{DeltaStream, LlmDriver, LlmRequest, Message, UpstreamEvent};

/// Inbound relay request body.
#[derive(Debug, Deserialize)]
pub struct RelayRequest {
    /// Kept untyped so a non-string prompt is reported as a validation error.
    #[serde(default)]
    pub prompt: serde_json::Value,
    /// Client-generated conversation identifier, used for logging only.
    #[serde(default, rename = "conversationId")]
    pub conversation_id: Option<String>,
    /// Prior conversation turns, oldest first.
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl RelayRequest {
    /// Build the upstream request: history followed by the trimmed prompt.
    pub fn into_llm_request(self) -> Result<LlmRequest, RelayError> {
        let prompt = self
            .prompt
            .as_str()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| RelayError::Validation("Prompt must not be empty.".to_string()))?;

        let mut messages = self.messages;
        messages.push(Message::user(prompt));
        Ok(LlmRequest { messages })
    }
}

/// Validate the request, open upstream, and return the event-stream response.
///
/// # Errors
///
/// Returns validation, configuration, upstream-status or transport errors
/// that happen before streaming starts.
pub async fn open_relay(driver: &dyn LlmDriver, request: RelayRequest) -> Result<Response, RelayError> {
    let conversation_id = request.conversation_id.clone().unwrap_or_default();
    let llm_request = request.into_llm_request()?;
    let deltas = driver.stream(llm_request).await?;

    Ok(event_stream_response(relay_frames(deltas, conversation_id)))
}

/// Re-frame upstream events into outbound frames.
///
/// The stream ends after the first terminal frame.
pub fn relay_frames(deltas: DeltaStream, conversation_id: String) -> impl Stream<Item = OutboundFrame> + Send {
    async_stream::stream! {
        let mut guard = RelayGuard::new(conversation_id);
        let mut deltas = deltas;

        loop {
            match deltas.next().await {
                Some(Ok(UpstreamEvent::Delta(text))) => {
                    guard.record_delta(&text);
                    yield OutboundFrame::Delta(text);
                }
                Some(Ok(UpstreamEvent::Done)) | None => {
                    guard.complete();
                    yield OutboundFrame::Done;
                    break;
                }
                Some(Err(e)) => {
                    guard.fail(&e);
                    yield OutboundFrame::Error;
                    break;
                }
            }
        }
    }
}

/// Wrap a frame stream in a response with the event-stream headers.
///
/// Each frame becomes its own body chunk, so it is written to the socket as
/// soon as it is produced.
pub fn event_stream_response<S>(frames: S) -> Response
where
    S: Stream<Item = OutboundFrame> + Send + 'static,
{
    let body = Body::from_stream(frames.map(|frame| Ok::<_, Infallible>(frame.into_bytes())));

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

/// Tracks one relay invocation and reports how it ended.
///
/// If the body stream is dropped before a terminal frame, the client has
/// disconnected; the upstream stream is dropped in the same step.
struct RelayGuard {
    conversation_id: String,
    frames: u64,
    chars: usize,
    started: Instant,
    finished: bool,
}

impl RelayGuard {
    fn new(conversation_id: String) -> Self {
        Self {
            conversation_id,
            frames: 0,
            chars: 0,
            started: Instant::now(),
            finished: false,
        }
    }

    fn record_delta(&mut self, text: &str) {
        self.frames += 1;
        self.chars += text.chars().count();
        metrics::counter!("relay_frames_total").increment(1);

        if self.frames <= 5 || self.frames % 10 == 0 {
            debug!(
                conversation_id = %self.conversation_id,
                frame = self.frames,
                delta = %preview(text, 30),
                "Relaying delta"
            );
        }
    }

    fn complete(&mut self) {
        self.finished = true;
        info!(
            name: "relay.stream.completed",
            conversation_id = %self.conversation_id,
            frames = self.frames,
            chars = self.chars,
            elapsed_ms = self.started.elapsed().as_millis(),
            "Relay stream completed"
        );
    }

    fn fail(&mut self, err: &RelayError) {
        self.finished = true;
        metrics::counter!("relay_stream_failures_total").increment(1);
        error!(
            name: "relay.stream.failed",
            conversation_id = %self.conversation_id,
            frames = self.frames,
            error = %err,
            "Upstream read failed mid-stream"
        );
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        if !self.finished {
            metrics::counter!("relay_disconnects_total").increment(1);
            info!(
                name: "relay.client.disconnected",
                conversation_id = %self.conversation_id,
                frames = self.frames,
                "Client disconnected, closing upstream"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: serde_json::Value) -> RelayRequest {
        serde_json::from_value(body).unwrap()
    }

    fn deltas(events: Vec<Result<UpstreamEvent, RelayError>>) -> DeltaStream {
        Box::pin(futures::stream::iter(events))
    }

    #[test]
    fn test_prompt_is_trimmed_and_appended() {
        let req = request(serde_json::json!({
            "prompt": "  hello  ",
            "conversationId": "conv_1",
            "messages": [
                { "role": "user", "content": "earlier" },
                { "role": "assistant", "content": "reply" }
            ]
        }));
        let llm = req.into_llm_request().unwrap();
        assert_eq!(
            llm.messages,
            vec![
                Message::user("earlier"),
                Message::assistant("reply"),
                Message::user("hello"),
            ]
        );
    }

    #[test]
    fn test_rejects_empty_or_non_string_prompt() {
        for prompt in [
            serde_json::json!(""),
            serde_json::json!("   \n"),
            serde_json::json!(42),
            serde_json::Value::Null,
        ] {
            let req = request(serde_json::json!({ "prompt": prompt }));
            assert!(matches!(
                req.into_llm_request(),
                Err(RelayError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_frames_end_with_done() {
        let frames: Vec<_> = relay_frames(
            deltas(vec![
                Ok(UpstreamEvent::Delta("Hi".into())),
                Ok(UpstreamEvent::Delta(" there".into())),
                Ok(UpstreamEvent::Done),
            ]),
            "c".into(),
        )
        .collect()
        .await;
        assert_eq!(
            frames,
            vec![
                OutboundFrame::Delta("Hi".into()),
                OutboundFrame::Delta(" there".into()),
                OutboundFrame::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_exhausted_upstream_still_gets_done() {
        let frames: Vec<_> = relay_frames(deltas(vec![Ok(UpstreamEvent::Delta("x".into()))]), "c".into())
            .collect()
            .await;
        assert_eq!(frames.last(), Some(&OutboundFrame::Done));
    }

    #[tokio::test]
    async fn test_transport_error_becomes_single_error_frame() {
        let frames: Vec<_> = relay_frames(
            deltas(vec![
                Ok(UpstreamEvent::Delta("part".into())),
                Err(RelayError::StreamTransport("reset".into())),
                Ok(UpstreamEvent::Delta("never".into())),
            ]),
            "c".into(),
        )
        .collect()
        .await;
        assert_eq!(
            frames,
            vec![OutboundFrame::Delta("part".into()), OutboundFrame::Error]
        );
    }

    #[test]
    fn test_event_stream_headers() {
        let response = event_stream_response(futures::stream::empty::<OutboundFrame>());
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers[header::CONNECTION], "keep-alive");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }
}
