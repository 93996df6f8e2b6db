//! `GET /health`: a point-in-time snapshot of bridge state and counters,
//! expressed as a plain `serde`-derived status struct rather than ad hoc
//! JSON construction.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::counters::CountersSnapshot;
use crate::lifecycle::Bridge;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    state: &'static str,
    healthy: bool,
    pid: Option<u32>,
    uptime_secs: Option<f64>,
    counters: CountersSnapshot,
    sse_active: u64,
    sse_total: u64,
}

pub async fn handle(State(bridge): State<Bridge>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = bridge.is_healthy();
    let body = HealthResponse {
        state: bridge.state().name(),
        healthy,
        pid: bridge.pid(),
        uptime_secs: bridge.uptime().map(|d| d.as_secs_f64()),
        counters: bridge.counters(),
        sse_active: bridge.sse_active(),
        sse_total: bridge.sse_total(),
    };
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body))
}
