use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum_test::TestServer;
use chat_relay::AppState;
use chat_relay::config::AppConfig;
use chat_relay::error::RelayError;
use chat_relay::llm::{ChatCompletionsDriver, DeltaStream, LlmDriver, LlmRequest, UpstreamEvent};
use chat_relay::server::router;
use futures::StreamExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn upstream_chunk(content: &str) -> String {
    let json = json!({ "id": "c1", "choices": [{ "index": 0, "delta": { "content": content } }] });
    format!("data: {json}\n\n")
}

fn test_config(base_url: &str, api_key: Option<&str>) -> Arc<AppConfig> {
    let mut config = AppConfig::default();
    config.upstream.base_url = base_url.to_string();
    config.upstream.api_key = api_key.map(ToString::to_string);
    Arc::new(config)
}

fn relay_server(upstream: &MockServer, api_key: Option<&str>) -> TestServer {
    let config = test_config(&upstream.uri(), api_key);
    let driver = Arc::new(ChatCompletionsDriver::new(config.llm_settings()));
    TestServer::new(router(AppState::new(config, driver))).expect("test server")
}

async fn mount_status(upstream: &MockServer, template: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(template)
        .mount(upstream)
        .await;
}

#[tokio::test]
async fn test_streams_deltas_then_done() {
    let upstream = MockServer::start().await;
    let body = format!(
        "{}{}data: [DONE]\n\n",
        upstream_chunk("Hi"),
        upstream_chunk(" there")
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "deepseek-chat",
            "stream": true,
            "temperature": 0.9,
            "max_tokens": 2048,
            "messages": [{ "role": "user", "content": "hello" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&upstream)
        .await;

    let server = relay_server(&upstream, Some("test-key"));
    let response = server
        .post("/api/chat")
        .json(&json!({ "prompt": "  hello ", "conversationId": "conv_1", "messages": [] }))
        .await;

    response.assert_status_ok();
    assert_eq!(response.header("content-type"), "text/event-stream");
    assert_eq!(response.header("cache-control"), "no-cache");
    assert_eq!(response.header("access-control-allow-origin"), "*");
    assert_eq!(
        response.text(),
        "data: {\"content\":\"Hi\"}\n\ndata: {\"content\":\" there\"}\n\ndata: [DONE]\n\n"
    );
}

#[tokio::test]
async fn test_history_is_forwarded_before_prompt() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "messages": [
                { "role": "user", "content": "first" },
                { "role": "assistant", "content": "answer" },
                { "role": "user", "content": "second" }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw("data: [DONE]\n\n", "text/event-stream"))
        .expect(1)
        .mount(&upstream)
        .await;

    let server = relay_server(&upstream, Some("k"));
    let response = server
        .post("/api/chat")
        .json(&json!({
            "prompt": "second",
            "conversationId": "conv_2",
            "messages": [
                { "role": "user", "content": "first" },
                { "role": "assistant", "content": "answer" }
            ]
        }))
        .await;

    response.assert_status_ok();
    assert_eq!(response.text(), "data: [DONE]\n\n");
}

#[tokio::test]
async fn test_malformed_upstream_line_is_skipped() {
    let upstream = MockServer::start().await;
    let body = format!(
        "{}data: {{\"choices\": [\n\n{}data: [DONE]\n\n",
        upstream_chunk("a"),
        upstream_chunk("b")
    );
    mount_status(
        &upstream,
        ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
    )
    .await;

    let server = relay_server(&upstream, Some("k"));
    let response = server
        .post("/api/chat")
        .json(&json!({ "prompt": "hi", "conversationId": "c", "messages": [] }))
        .await;

    assert_eq!(
        response.text(),
        "data: {\"content\":\"a\"}\n\ndata: {\"content\":\"b\"}\n\ndata: [DONE]\n\n"
    );
}

#[tokio::test]
async fn test_rate_limit_is_mapped_before_streaming() {
    let upstream = MockServer::start().await;
    mount_status(&upstream, ResponseTemplate::new(429)).await;

    let server = relay_server(&upstream, Some("k"));
    let response = server
        .post("/api/chat")
        .json(&json!({ "prompt": "hello", "conversationId": "c", "messages": [] }))
        .await;

    response.assert_status(StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.header("content-type"), "application/json");
    let body: Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("Too many requests"));
}

#[tokio::test]
async fn test_auth_and_fault_statuses() {
    for (status, needle) in [(401, "Invalid API key"), (500, "Upstream server error")] {
        let upstream = MockServer::start().await;
        mount_status(&upstream, ResponseTemplate::new(status)).await;

        let server = relay_server(&upstream, Some("k"));
        let response = server
            .post("/api/chat")
            .json(&json!({ "prompt": "hello", "conversationId": "c", "messages": [] }))
            .await;

        assert_eq!(response.status_code().as_u16(), status);
        let body: Value = response.json();
        assert!(body["error"].as_str().unwrap().contains(needle));
    }
}

#[tokio::test]
async fn test_other_status_passes_through_upstream_message() {
    let upstream = MockServer::start().await;
    mount_status(
        &upstream,
        ResponseTemplate::new(402)
            .set_body_json(json!({ "error": { "message": "Insufficient Balance" } })),
    )
    .await;

    let server = relay_server(&upstream, Some("k"));
    let response = server
        .post("/api/chat")
        .json(&json!({ "prompt": "hello", "conversationId": "c", "messages": [] }))
        .await;

    response.assert_status(StatusCode::PAYMENT_REQUIRED);
    response.assert_json(&json!({ "error": "Insufficient Balance" }));
}

#[tokio::test]
async fn test_other_status_without_body_gets_synthesized_message() {
    let upstream = MockServer::start().await;
    mount_status(&upstream, ResponseTemplate::new(404)).await;

    let server = relay_server(&upstream, Some("k"));
    let response = server
        .post("/api/chat")
        .json(&json!({ "prompt": "hello", "conversationId": "c", "messages": [] }))
        .await;

    response.assert_status(StatusCode::NOT_FOUND);
    response.assert_json(&json!({ "error": "HTTP error! status: 404" }));
}

#[tokio::test]
async fn test_missing_credential_never_contacts_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let server = relay_server(&upstream, None);
    let response = server
        .post("/api/chat")
        .json(&json!({ "prompt": "hello", "conversationId": "c", "messages": [] }))
        .await;

    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("configuration"));
}

#[tokio::test]
async fn test_invalid_prompts_are_rejected() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;
    let server = relay_server(&upstream, Some("k"));

    for body in [
        json!({ "prompt": "", "conversationId": "c", "messages": [] }),
        json!({ "prompt": "   ", "conversationId": "c", "messages": [] }),
        json!({ "prompt": 7, "conversationId": "c", "messages": [] }),
        json!({ "conversationId": "c", "messages": [] }),
        json!({ "prompt": "hi", "messages": [{ "role": "wizard", "content": "x" }] }),
    ] {
        let response = server.post("/api/chat").json(&body).await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let error: Value = response.json();
        assert!(error["error"].is_string());
    }
}

#[tokio::test]
async fn test_health() {
    let upstream = MockServer::start().await;
    let server = relay_server(&upstream, None);
    let response = server.get("/health").await;
    response.assert_status_ok();
    response.assert_json(&json!({ "status": "ok", "message": "Server is running" }));
}

#[tokio::test]
async fn test_metrics_not_found_without_recorder() {
    let upstream = MockServer::start().await;
    let server = relay_server(&upstream, None);
    server.get("/metrics").await.assert_status(StatusCode::NOT_FOUND);
}

// ─────────────────────────────────────────────────────────────────────────────
// Disconnect propagation
// ─────────────────────────────────────────────────────────────────────────────

/// Sets its flag when dropped, standing in for the upstream connection.
struct DropProbe(Arc<AtomicBool>);

impl Drop for DropProbe {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Emits one delta and then stalls forever, like a slow upstream.
struct StallingDriver {
    dropped: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl LlmDriver for StallingDriver {
    async fn stream(&self, _req: LlmRequest) -> Result<DeltaStream, RelayError> {
        let probe = DropProbe(Arc::clone(&self.dropped));
        Ok(Box::pin(async_stream::stream! {
            let _probe = probe;
            yield Ok::<_, RelayError>(UpstreamEvent::Delta("Hi".to_string()));
            futures::future::pending::<()>().await;
        }))
    }
}

#[tokio::test]
async fn test_client_disconnect_drops_upstream() {
    let dropped = Arc::new(AtomicBool::new(false));
    let driver = Arc::new(StallingDriver {
        dropped: Arc::clone(&dropped),
    });
    let app = router(AppState::new(Arc::new(AppConfig::default()), driver));

    let request = Request::post("/api/chat")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "prompt": "hello", "conversationId": "c", "messages": [] }).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    assert_eq!(&first[..], b"data: {\"content\":\"Hi\"}\n\n");
    assert!(!dropped.load(Ordering::SeqCst));

    // The client goes away mid-stream.
    drop(body);
    assert!(dropped.load(Ordering::SeqCst));
}

// ─────────────────────────────────────────────────────────────────────────────
// Timeout
// ─────────────────────────────────────────────────────────────────────────────

/// Takes a minute to produce response headers.
struct SlowDriver;

#[async_trait::async_trait]
impl LlmDriver for SlowDriver {
    async fn stream(&self, _req: LlmRequest) -> Result<DeltaStream, RelayError> {
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        Ok(Box::pin(futures::stream::empty()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_before_headers_is_json_error() {
    let mut config = AppConfig::default();
    config.resilience.request_timeout_secs = 1;
    let app = router(AppState::new(Arc::new(config), Arc::new(SlowDriver)));

    let request = Request::post("/api/chat")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "prompt": "hello", "conversationId": "c", "messages": [] }).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    assert_eq!(response.headers()["content-type"], "application/json");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, json!({ "error": "Request timed out" }));
}
