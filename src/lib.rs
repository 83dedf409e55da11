//! Streaming Chat Relay
//!
//! Relays a chat completion from an upstream OpenAI-compatible service to an
//! interactive client as an incremental event stream.
//!
//! # Architecture
//!
//! - **Server**: Axum-based HTTP server exposing `POST /api/chat`
//! - **Upstream Reader**: Streams `/v1/chat/completions` and decodes text deltas
//! - **Frame Encoder**: Re-frames each delta as `data: {"content": ...}`
//! - **Relay Controller**: Validates requests and maps upstream failures
//!
//! # Modules
//!
//! - [`config`]: Layered configuration (defaults, file, environment, CLI)
//! - [`error`]: Relay error taxonomy and JSON error responses
//! - [`frame`]: Outbound wire frames
//! - [`llm`]: Upstream driver trait and Chat Completions implementation
//! - [`relay`]: Request validation and the delta-to-frame pipeline
//! - [`server`]: Router and HTTP handlers

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod error;
pub mod frame;
pub mod llm;
pub mod relay;
pub mod server;

use crate::config::AppConfig;

use llm::LlmDriver;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Upstream driver used for every relay request.
    pub driver: Arc<dyn LlmDriver>,
    /// Global Configuration
    pub config: Arc<AppConfig>,
    /// Prometheus handle, present when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Create state without a metrics exporter.
    #[must_use]
    pub fn new(config: Arc<AppConfig>, driver: Arc<dyn LlmDriver>) -> Self {
        Self {
            driver,
            config,
            metrics: None,
        }
    }

    /// Attach a Prometheus handle served at `/metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}
