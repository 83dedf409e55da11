//! Error types for the SDK.

use thiserror::Error;

use crate::store::StorageError;

/// SDK error type.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A relay frame carried a payload that is not valid JSON.
    #[error("Malformed frame payload: {0}")]
    FrameParse(#[from] serde_json::Error),

    /// Relay answered with an error response before streaming.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message from the relay.
        message: String,
    },

    /// Relay reported an in-band failure after streaming started.
    #[error("Stream failed")]
    StreamFailed,

    /// Stream ended unexpectedly.
    #[error("Stream ended unexpectedly")]
    StreamEnded,

    /// A reply is still streaming for this client.
    #[error("A stream session is already active")]
    SessionActive,

    /// The prompt was empty after trimming.
    #[error("Prompt must not be empty")]
    EmptyPrompt,

    /// There is no failed prompt to resend.
    #[error("Nothing to retry")]
    NothingToRetry,

    /// Conversation persistence failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl Error {
    /// Text suitable for showing to the person using the chat.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            // The relay already phrases rate limit, credential and fault errors.
            Self::Api { message, .. } => message.clone(),
            Self::EmptyPrompt => "Please enter a message.".to_string(),
            Self::SessionActive => {
                "A reply is still being generated. Wait for it or stop it first.".to_string()
            }
            Self::NothingToRetry => "There is no message to resend.".to_string(),
            Self::InvalidUrl(_) => "The relay address is invalid.".to_string(),
            Self::Storage(_) => "Conversation history could not be saved.".to_string(),
            Self::Http(_) | Self::FrameParse(_) | Self::StreamFailed | Self::StreamEnded => {
                "Something went wrong, please try again.".to_string()
            }
        }
    }

    /// Whether the failed prompt can reasonably be resent as-is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => !matches!(status, 400 | 401),
            Self::Http(_) | Self::FrameParse(_) | Self::StreamFailed | Self::StreamEnded => true,
            Self::InvalidUrl(_)
            | Self::SessionActive
            | Self::EmptyPrompt
            | Self::NothingToRetry
            | Self::Storage(_) => false,
        }
    }
}

/// Result type alias for SDK operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_message_is_shown_verbatim() {
        let err = Error::Api {
            status: 429,
            message: "Too many requests, please try again later.".into(),
        };
        assert_eq!(err.user_message(), "Too many requests, please try again later.");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retry_affordance() {
        assert!(!Error::Api { status: 401, message: String::new() }.is_retryable());
        assert!(!Error::Api { status: 400, message: String::new() }.is_retryable());
        assert!(Error::StreamFailed.is_retryable());
        assert!(Error::StreamEnded.is_retryable());
        assert!(!Error::EmptyPrompt.is_retryable());
        assert!(!Error::SessionActive.is_retryable());
    }
}
