//! `POST /message`: request/response and notification admission.
//!
//! The overall shape is validate, submit, race the waiter against a
//! timeout, then respond. Nearly every failure here is a JSON-RPC error
//! envelope carried in an HTTP 200: the caller always parses one shape.
//! Content-type is matched on media type alone (the part before `;`), so
//! `application/json; charset=utf-8` is accepted.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use http_body_util::{BodyExt, Limited};

use crate::error::RpcErrorKind;
use crate::frame::{Frame, FrameKind, RequestId, RpcError};
use crate::lifecycle::Bridge;

pub async fn handle(State(bridge): State<Bridge>, headers: HeaderMap, body: Body) -> Response {
    if !accepts_json(&headers) {
        return error_envelope(None, RpcErrorKind::InvalidRequest);
    }

    let body = match read_bounded_body(body, bridge.config().max_request_size).await {
        Ok(bytes) => bytes,
        Err(()) => return error_envelope(None, RpcErrorKind::RequestTooLarge),
    };

    let frame: Frame = match serde_json::from_slice(&body) {
        Ok(frame) => frame,
        Err(_) => return error_envelope(None, RpcErrorKind::Parse),
    };

    if !frame.is_valid_version() || frame.method.as_deref().is_some_and(str::is_empty) {
        return error_envelope(frame.id.clone(), RpcErrorKind::InvalidRequest);
    }

    match frame.kind() {
        FrameKind::Notification => match bridge.submit_notification(frame).await {
            Ok(()) => StatusCode::NO_CONTENT.into_response(),
            Err(kind) => error_envelope(None, kind),
        },
        FrameKind::Response => error_envelope(frame.id.clone(), RpcErrorKind::InvalidRequest),
        FrameKind::Request => {
            let id_on_err = frame.id.clone();
            bridge.record_counters_on_admission();
            match bridge.submit_request(frame).await {
                Ok((id, waiter)) => await_response(&bridge, id, waiter).await,
                Err(kind) => {
                    bridge.record_failure();
                    error_envelope(id_on_err, kind)
                }
            }
        }
    }
}

/// Races the waiter against the configured response-wait timeout. A
/// `Drop` guard deregisters the id on every exit path, including the one
/// axum/hyper take implicitly when the client disconnects mid-await and
/// this future is simply dropped rather than run to completion.
async fn await_response(bridge: &Bridge, id: RequestId, waiter: crate::correlator::Waiter) -> Response {
    struct Deregister<'a> {
        bridge: &'a Bridge,
        id: RequestId,
    }
    impl Drop for Deregister<'_> {
        fn drop(&mut self) {
            self.bridge.deregister(&self.id);
        }
    }
    let _guard = Deregister { bridge, id: id.clone() };

    tokio::select! {
        result = waiter => match result {
            Ok(frame) => {
                if frame.error.is_some() {
                    bridge.record_failure();
                } else {
                    bridge.record_success();
                }
                success_response(frame)
            }
            Err(_) => {
                bridge.record_failure();
                error_envelope(Some(id), RpcErrorKind::ProcessClosed)
            }
        },
        _ = tokio::time::sleep(bridge.config().write_timeout()) => {
            bridge.record_failure();
            error_envelope(Some(id), RpcErrorKind::Timeout)
        }
    }
}

/// Reads the request body through a length-limited collector, so a body
/// that is wildly over `max_request_size` is rejected as soon as the
/// streamed byte count crosses the limit rather than after being buffered
/// in full. A body of exactly `max_request_size + 1` bytes still collects
/// successfully (the limit is one byte looser) and is rejected by the
/// explicit length check below instead, which is what lets the boundary
/// case and the pathological one both land on the same envelope.
async fn read_bounded_body(body: Body, max_request_size: usize) -> Result<Bytes, ()> {
    let limit = max_request_size.saturating_add(1);
    let collected = Limited::new(body, limit).collect().await.map_err(|_| ())?;
    let bytes = collected.to_bytes();
    if bytes.len() > max_request_size {
        return Err(());
    }
    Ok(bytes)
}

fn success_response(frame: Frame) -> Response {
    (StatusCode::OK, Json(frame)).into_response()
}

fn error_envelope(id: Option<RequestId>, kind: RpcErrorKind) -> Response {
    let frame = Frame::error_response(id, RpcError::new(kind));
    (StatusCode::OK, Json(frame)).into_response()
}

fn accepts_json(headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(CONTENT_TYPE) else {
        return true;
    };
    let Ok(value) = value.to_str() else {
        return false;
    };
    value
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|media_type| media_type.eq_ignore_ascii_case("application/json"))
}
