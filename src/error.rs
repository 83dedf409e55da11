//! Relay error taxonomy.
//!
//! Every failure the relay can report before the event stream starts maps to
//! one [`RelayError`] variant, which renders as a JSON `{ "error": ... }` body
//! with the matching status code. Once streaming has started, failures are
//! reported in-band instead (see [`crate::frame::OutboundFrame::Error`]).

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Errors produced by the relay pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The client request is malformed (empty prompt, bad body).
    #[error("{0}")]
    Validation(String),

    /// The server is missing required configuration, such as the upstream credential.
    #[error("{0}")]
    Configuration(String),

    /// Upstream answered 429.
    #[error("upstream rate limit exceeded")]
    UpstreamRateLimit,

    /// Upstream answered 401.
    #[error("upstream rejected the API credential")]
    UpstreamAuth,

    /// Upstream answered 500.
    #[error("upstream service fault")]
    UpstreamFault,

    /// Any other non-success upstream status, passed through to the client.
    #[error("{message}")]
    UpstreamGeneric {
        /// Status code returned by upstream.
        status: u16,
        /// Upstream error message, or a synthesized one if the body had none.
        message: String,
    },

    /// A frame payload could not be decoded.
    #[error("malformed frame payload: {0}")]
    FrameParse(#[from] serde_json::Error),

    /// The network failed while talking to upstream.
    #[error("stream transport failed: {0}")]
    StreamTransport(String),
}

impl RelayError {
    /// HTTP status used when this error is reported as a response.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamRateLimit => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamAuth => StatusCode::UNAUTHORIZED,
            Self::UpstreamGeneric { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Configuration(_)
            | Self::UpstreamFault
            | Self::FrameParse(_)
            | Self::StreamTransport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short stable label, used as a metrics tag and in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Configuration(_) => "configuration",
            Self::UpstreamRateLimit => "upstream_rate_limit",
            Self::UpstreamAuth => "upstream_auth",
            Self::UpstreamFault => "upstream_fault",
            Self::UpstreamGeneric { .. } => "upstream_generic",
            Self::FrameParse(_) => "frame_parse",
            Self::StreamTransport(_) => "stream_transport",
        }
    }

    /// Message shown to the client. Configuration details stay in the server log.
    fn client_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::Configuration(_) => {
                "Server configuration error, please contact the administrator.".to_string()
            }
            Self::UpstreamRateLimit => "Too many requests, please try again later. \
                If the problem persists, check your API quota."
                .to_string(),
            Self::UpstreamAuth => "Invalid API key, please check the configuration.".to_string(),
            Self::UpstreamFault => "Upstream server error, please try again later.".to_string(),
            Self::UpstreamGeneric { message, .. } => message.clone(),
            Self::FrameParse(_) | Self::StreamTransport(_) => self.to_string(),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.client_message() });
        (self.status(), Json(body)).into_response()
    }
}
