use axum::{
    Json, Router,
    extract::{Request, State, rejection::JsonRejection},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tracing::{info, warn};

use crate::AppState;
use crate::config::AppConfig;
use crate::error::RelayError;
use crate::llm::ChatCompletionsDriver;
use crate::relay::{self, RelayRequest};

/// Start the Axum server with the provided configuration.
pub async fn start_server(
    config: Arc<AppConfig>,
    metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
) -> anyhow::Result<()> {
    let settings = config.llm_settings();

    info!(
        name: "llm.config.loaded",
        base_url = %settings.base_url,
        model = %settings.model,
        provider = settings.provider.name(),
        credential = settings.api_key.is_some(),
        "LLM configuration loaded"
    );
    if settings.api_key.is_none() {
        warn!("No upstream API key configured; chat requests will be rejected");
    }

    let driver = Arc::new(ChatCompletionsDriver::new(settings));
    let mut state = AppState::new(Arc::clone(&config), driver);
    if let Some(handle) = metrics {
        state = state.with_metrics(handle);
    }

    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    // A disabled timeout becomes a very long one so the layer stack keeps one type.
    let timeout_duration = if state.config.resilience.timeout_disabled {
        Duration::from_secs(365 * 24 * 60 * 60) // 1 year
    } else {
        Duration::from_secs(state.config.resilience.request_timeout_secs)
    };

    Router::new()
        .route("/api/chat", post(api_chat))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(axum::middleware::from_fn(
            move |req: Request, next: Next| {
                let duration = timeout_duration;
                async move {
                    // Bounds time-to-headers only; the body streams afterwards.
                    match tokio::time::timeout(duration, next.run(req)).await {
                        Ok(res) => res,
                        Err(_) => (
                            StatusCode::REQUEST_TIMEOUT,
                            Json(serde_json::json!({ "error": "Request timed out" })),
                        )
                            .into_response(),
                    }
                }
            },
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST /api/chat - Relay a streaming completion.
async fn api_chat(
    State(state): State<AppState>,
    payload: Result<Json<RelayRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(p) => p,
        Err(rejection) => {
            metrics::counter!("relay_requests_total", "outcome" => "validation").increment(1);
            return RelayError::Validation(rejection.body_text()).into_response();
        }
    };

    info!(
        name: "relay.request.received",
        conversation_id = ?request.conversation_id,
        history = request.messages.len(),
        "Received chat request"
    );

    match relay::open_relay(state.driver.as_ref(), request).await {
        Ok(response) => {
            metrics::counter!("relay_requests_total", "outcome" => "streaming").increment(1);
            response
        }
        Err(err) => {
            metrics::counter!("relay_requests_total", "outcome" => err.kind()).increment(1);
            warn!(
                name: "relay.upstream.rejected",
                kind = err.kind(),
                status = err.status().as_u16(),
                error = %err,
                "Chat request rejected before streaming"
            );
            err.into_response()
        }
    }
}

/// GET /health - Liveness probe.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "message": "Server is running" }))
}

/// GET /metrics - Prometheus exposition, when a recorder is installed.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
