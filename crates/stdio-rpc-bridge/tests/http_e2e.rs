//! End-to-end coverage of the HTTP surface driven through the real
//! `axum::Router` (no TCP socket: `tower::ServiceExt::oneshot` calls the
//! router as a `Service` directly, the same pattern `rust-mcp-sdk`'s
//! `mcp_http` tests use). Each test drives a real child process via one of
//! `tests/fixtures/*.sh`, so these exercise the handshake, the stdin
//! writer, and the stdout pump together with the HTTP handlers, not just
//! the handlers in isolation.

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;

use stdio_rpc_bridge::config::BridgeConfig;
use stdio_rpc_bridge::http;
use stdio_rpc_bridge::lifecycle::Bridge;

fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
}

fn config_with(fixture_name: &str, write_timeout_secs: u64) -> BridgeConfig {
    BridgeConfig {
        command: vec!["sh".to_string(), fixture(fixture_name)],
        environment: HashMap::new(),
        working_directory: None,
        address: ":0".to_string(),
        read_timeout_secs: 30,
        write_timeout_secs,
        idle_timeout_secs: 30,
        shutdown_timeout_secs: 2,
        max_request_size: 10 * 1024 * 1024,
        sse_heartbeat_secs: 0,
        handshake_timeout_secs: 2,
    }
}

async fn started(fixture_name: &str, write_timeout_secs: u64) -> Bridge {
    let bridge = Bridge::new(config_with(fixture_name, write_timeout_secs));
    bridge.start().await.expect("bridge starts");
    bridge
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).expect("response body is valid JSON")
}

/// Reads one `http_body` frame as UTF-8, skipping trailer frames. Used to
/// pull individual SSE events off a streaming response body without
/// waiting for the (never-arriving) end of stream.
async fn next_event(body: &mut Body) -> String {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("an SSE frame arrives before the test timeout")
            .expect("the stream is not closed")
            .expect("the frame is not a transport error");
        if let Ok(data) = frame.into_data() {
            return String::from_utf8(data.to_vec()).expect("frame is valid utf8");
        }
    }
}

// Ping round-trip: a request reaches the child and its response comes
// straight back through the HTTP response body.
#[tokio::test]
async fn ping_round_trip_returns_the_child_response() {
    let bridge = started("handshake_echo.sh", 5).await;
    let router = http::router(bridge.clone());

    let request = Request::post("/message")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"jsonrpc": "2.0", "id": 42, "method": "ping"}).to_string(),
        ))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["id"], json!(42));
    assert_eq!(body["method"], json!("ping"));

    let counters = bridge.counters();
    assert_eq!(counters.total_requests, 1);
    assert_eq!(counters.successful_requests, 1);

    bridge.shutdown().await;
}

#[tokio::test]
async fn notification_gets_204_and_never_registers_a_waiter() {
    let bridge = started("handshake_echo.sh", 5).await;
    let router = http::router(bridge.clone());

    let request = Request::post("/message")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {"p": 1}})
                .to_string(),
        ))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(bridge.counters().total_requests, 0);

    bridge.shutdown().await;
}

// Content-type is matched on media type alone (see DESIGN.md), not an
// exact string match.
#[tokio::test]
async fn content_type_with_charset_parameter_is_accepted() {
    let bridge = started("handshake_echo.sh", 5).await;
    let router = http::router(bridge.clone());

    let request = Request::post("/message")
        .header("content-type", "application/json; charset=utf-8")
        .body(Body::from(
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string(),
        ))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    bridge.shutdown().await;
}

#[tokio::test]
async fn missing_method_is_an_invalid_request_envelope_not_a_4xx() {
    let bridge = started("handshake_echo.sh", 5).await;
    let router = http::router(bridge.clone());

    let request = Request::post("/message")
        .header("content-type", "application/json")
        .body(Body::from(json!({"jsonrpc": "2.0", "id": 1}).to_string()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], json!(-32600));

    bridge.shutdown().await;
}

/// Builds a syntactically valid ping frame with a `pad` param long enough
/// to make the serialised body exactly `target_len` bytes.
fn frame_of_length(id: u64, target_len: usize) -> String {
    let mut pad_len = 0usize;
    loop {
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "ping",
            "params": { "pad": "a".repeat(pad_len) },
        })
        .to_string();
        if body.len() == target_len {
            return body;
        }
        assert!(body.len() < target_len, "target_len too small for a valid frame");
        pad_len += target_len - body.len();
    }
}

// Boundary behaviour: exactly the cap is accepted, one byte more is
// rejected with a `request-too-large` envelope (still HTTP 200).
#[tokio::test]
async fn body_at_exactly_the_cap_is_accepted_one_byte_more_is_rejected() {
    let probe_len = frame_of_length(1, 0).len();
    let max_request_size = probe_len + 32;

    let mut config = config_with("handshake_echo.sh", 5);
    config.max_request_size = max_request_size;
    let bridge = Bridge::new(config);
    bridge.start().await.expect("bridge starts");
    let router = http::router(bridge.clone());

    let at_cap = frame_of_length(1, max_request_size);
    let request = Request::post("/message")
        .header("content-type", "application/json")
        .body(Body::from(at_cap))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body.get("error").is_none(), "body at the cap must not be rejected");

    let over_cap = frame_of_length(2, max_request_size + 1);
    let request = Request::post("/message")
        .header("content-type", "application/json")
        .body(Body::from(over_cap))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], json!(-32005));

    bridge.shutdown().await;
}

// Scenario 4: timeout.
#[tokio::test]
async fn unanswered_request_times_out_with_a_typed_envelope() {
    let bridge = started("handshake_silent.sh", 1).await;
    let router = http::router(bridge.clone());

    let request = Request::post("/message")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"jsonrpc": "2.0", "id": 7, "method": "ping"}).to_string(),
        ))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], json!(7));
    assert_eq!(body["error"]["code"], json!(-32003));

    bridge.shutdown().await;
}

#[tokio::test]
async fn health_is_healthy_while_running_and_503_after_shutdown() {
    let bridge = started("handshake_echo.sh", 5).await;
    let router = http::router(bridge.clone());

    let response = router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["healthy"], json!(true));
    assert_eq!(body["state"], json!("running"));

    bridge.shutdown().await;

    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

// Scenario 5: SSE fan-out. Three clients connect; a POST response triggers
// one `message` event, identical on all three streams.
#[tokio::test]
async fn sse_fans_out_one_message_to_every_connected_client() {
    let bridge = started("handshake_echo.sh", 5).await;
    let router = http::router(bridge.clone());

    let mut bodies = Vec::new();
    for _ in 0..3 {
        let response = router
            .clone()
            .oneshot(
                Request::get("/sse")
                    .header("host", "example.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-type").unwrap(), "text/event-stream");
        bodies.push(response.into_body());
    }
    assert_eq!(bridge.sse_active(), 3);

    for body in bodies.iter_mut() {
        let connected = next_event(body).await;
        assert!(connected.contains("event: connected"));
        let endpoint = next_event(body).await;
        assert!(endpoint.contains("event: endpoint"));
        assert!(endpoint.contains("http://example.test/message"));
    }

    let request = Request::post("/message")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"jsonrpc": "2.0", "id": 9, "method": "ping"}).to_string(),
        ))
        .unwrap();
    let post_response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(post_response.status(), StatusCode::OK);

    for body in bodies.iter_mut() {
        let message = next_event(body).await;
        assert!(message.contains("event: message"));
        assert!(message.contains("\"id\":9"));
    }

    bridge.shutdown().await;
}

// Scenario 6 (partial: the HTTP-visible half): once shutdown begins, SSE
// clients receive a terminal `shutdown` event and the stream ends.
#[tokio::test]
async fn shutdown_sends_sse_clients_a_shutdown_event() {
    let bridge = started("handshake_echo.sh", 5).await;
    let router = http::router(bridge.clone());

    let response = router
        .clone()
        .oneshot(Request::get("/sse").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let mut body = response.into_body();
    let _connected = next_event(&mut body).await;
    let _endpoint = next_event(&mut body).await;

    bridge.shutdown().await;

    let shutdown_event = next_event(&mut body).await;
    assert!(shutdown_event.contains("event: shutdown"));

    // The forwarding task removes itself from the broadcaster just after
    // sending this event, not before. Give it a moment to land.
    for _ in 0..50 {
        if bridge.sse_active() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(bridge.sse_active(), 0);
}
