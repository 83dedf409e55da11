//! HTTP client for the relay.

use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::stream::{self, StreamOutcome};
use crate::types::{ChatRequest, ErrorBody};

/// HTTP client for the relay API.
///
/// # Example
///
/// ```rust,no_run
/// use chat_relay_sdk::{ChatRequest, Client};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::new("http://localhost:3001")?;
/// let request = ChatRequest {
///     prompt: "Hello!".into(),
///     conversation_id: "conv_1".into(),
///     messages: vec![],
/// };
///
/// let outcome = client
///     .chat()
///     .stream(&request, &CancellationToken::new(), |delta, _full| print!("{delta}"))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    base_url: Url,
    http: reqwest::Client,
}

impl Client {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The base URL of the relay (e.g., "http://localhost:3001")
    pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref())?;
        Ok(Self {
            base_url,
            http: reqwest::Client::new(),
        })
    }

    /// Create a new client with a custom reqwest client.
    pub fn with_client(base_url: impl AsRef<str>, http: reqwest::Client) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref())?;
        Ok(Self { base_url, http })
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Access the Chat API.
    pub fn chat(&self) -> ChatApi<'_> {
        ChatApi { client: self }
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    /// Turn a non-success response into [`Error::Api`].
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".into());
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        Err(Error::Api {
            status: status.as_u16(),
            message,
        })
    }
}

/// Chat API client.
#[derive(Debug)]
pub struct ChatApi<'a> {
    client: &'a Client,
}

impl ChatApi<'_> {
    /// Open the relay stream. Error statuses are resolved before any frame.
    pub async fn open(&self, req: &ChatRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .http
            .post(self.client.url("/api/chat")?)
            .json(req)
            .send()
            .await?;
        Client::check_status(response).await
    }

    /// Send a turn and consume the reply, calling `on_chunk(delta, full)` for
    /// every delta.
    ///
    /// Firing `cancel` aborts the request; the connection is closed, which
    /// the relay observes as a disconnect.
    pub async fn stream<F>(
        &self,
        req: &ChatRequest,
        cancel: &CancellationToken,
        on_chunk: F,
    ) -> Result<StreamOutcome>
    where
        F: FnMut(&str, &str),
    {
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Ok(StreamOutcome::Cancelled { partial: String::new() });
            }
            response = self.open(req) => response?,
        };

        debug!(
            conversation_id = %req.conversation_id,
            history = req.messages.len(),
            "Relay stream opened"
        );
        stream::consume(response.bytes_stream(), cancel, on_chunk).await
    }
}
