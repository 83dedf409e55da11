//! Upstream chat-completion drivers.
//!
//! This module opens streaming requests against an OpenAI-compatible chat
//! completion service and turns the response into a lazy sequence of text
//! deltas.
//!
//! # Overview
//!
//! The [`LlmDriver`] trait is the seam between the relay controller and the
//! upstream service. A driver either rejects the request up front (missing
//! credential, non-success upstream status) or returns a [`DeltaStream`] that
//! yields [`UpstreamEvent`]s in the exact order upstream produced them.
//!
//! # Drivers
//!
//! - [`ChatCompletionsDriver`]: `/v1/chat/completions` with `stream: true`
//!
//! # Example
//!
//! ```rust,ignore
//! use chat_relay::llm::{LlmSettings, Provider};
//!
//! let settings = LlmSettings {
//!     base_url: "https://api.deepseek.com".to_string(),
//!     api_key: Some("sk-...".to_string()),
//!     model: "deepseek-chat".to_string(),
//!     provider: Provider::DeepSeek,
//!     temperature: 0.9,
//!     max_tokens: 2048,
//! };
//! ```

pub mod chat_completions;
pub mod provider;
pub mod sse;

pub use chat_completions::ChatCompletionsDriver;
pub use provider::Provider;

use std::pin::Pin;

use futures::Stream;

use crate::error::RelayError;

/// Upstream connection and sampling settings.
#[derive(Clone)]
pub struct LlmSettings {
    /// Base URL for the completion API (e.g., `https://api.deepseek.com`).
    pub base_url: String,
    /// Bearer credential. Requests are refused while this is absent.
    pub api_key: Option<String>,
    /// Model identifier (e.g., `deepseek-chat`).
    pub model: String,
    /// Provider detected from `base_url`.
    pub provider: Provider,
    /// Fixed sampling temperature sent with every request.
    pub temperature: f64,
    /// Output token ceiling sent with every request.
    pub max_tokens: u32,
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("provider", &self.provider)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User turn.
    User,
    /// Assistant turn.
    Assistant,
}

/// A message in the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    /// Role of the message author.
    pub role: MessageRole,
    /// Text content.
    pub content: String,
}

impl Message {
    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Request to an LLM driver.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Full message list, history first and the new user turn last.
    pub messages: Vec<Message>,
}

/// One unit decoded from the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// Incremental assistant text.
    Delta(String),
    /// Upstream finished, either via its `[DONE]` marker or by closing the stream.
    Done,
}

/// Lazy, finite, non-restartable sequence of upstream events.
///
/// Dropping the stream drops the underlying HTTP connection.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<UpstreamEvent, RelayError>> + Send>>;

/// Trait for upstream streaming drivers.
#[async_trait::async_trait]
pub trait LlmDriver: Send + Sync {
    /// Open a streaming completion.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Configuration`] if the driver has no credential
    /// (no connection is attempted), one of the upstream variants if upstream
    /// answers with a non-success status, or [`RelayError::StreamTransport`]
    /// if the connection cannot be established.
    async fn stream(&self, req: LlmRequest) -> Result<DeltaStream, RelayError>;
}
