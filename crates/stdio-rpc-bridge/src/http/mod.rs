//! The three HTTP endpoints, assembled into an embeddable `axum::Router`.
//!
//! `Bridge` is already cheaply `Clone`, so it serves directly as the
//! router's state instead of a separate wrapper struct.

pub mod health;
pub mod message;
pub mod sse;

use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::{get, post, MethodRouter};
use axum::{BoxError, Router};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::lifecycle::Bridge;

/// Wraps `route` with a request-processing ceiling, translating a timeout
/// into a `408`. `HandleErrorLayer` is required because `TimeoutLayer`'s
/// inner service surfaces the elapsed-deadline as a service error, and a
/// `MethodRouter` requires its layered service to be infallible.
fn with_idle_timeout(route: MethodRouter<Bridge>, timeout: Duration) -> MethodRouter<Bridge> {
    route.layer(
        ServiceBuilder::new()
            .layer(HandleErrorLayer::new(|_: BoxError| async {
                StatusCode::REQUEST_TIMEOUT
            }))
            .layer(TimeoutLayer::new(timeout)),
    )
}

/// Builds the router: `GET /sse`, `POST /message`, `GET /health`.
///
/// Axum's own default 2 MiB body cap is disabled: a `tower-http` limit
/// layer would reject an oversize body with a transport-level `413`, but
/// an oversize body must surface as the `request-too-large` JSON-RPC
/// envelope (200) regardless of how far over the cap it lands.
/// `message::handle` enforces `max_request_size` itself, reading the body
/// through a length-limited collector so an oversize body never gets fully
/// buffered before being rejected.
///
/// `idle_timeout` from config is applied only to `/message` and `/health`
/// as a request-processing ceiling, never to `/sse`: an SSE connection is
/// meant to stay open for as long as the caller holds it, bounded only by
/// its own heartbeat/shutdown logic, not by a blanket request timeout.
pub fn router(bridge: Bridge) -> Router {
    let idle_timeout = bridge.config().idle_timeout();

    Router::new()
        .route("/sse", get(sse::handle))
        .route("/message", with_idle_timeout(post(message::handle), idle_timeout))
        .route("/health", with_idle_timeout(get(health::handle), idle_timeout))
        .with_state(bridge)
        .layer(DefaultBodyLimit::disable())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
