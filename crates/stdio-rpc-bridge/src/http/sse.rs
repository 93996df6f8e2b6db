//! `GET /sse`: the long-lived event stream.
//!
//! The `Broadcaster` hands back a per-client `mpsc::Receiver<ClientEvent>`
//! instead of subscribing directly to a `tokio::sync::broadcast` channel.
//! A small forwarding task
//! multiplexes that receiver with the shutdown beacon and the heartbeat
//! ticker onto the channel axum's `Sse` body actually streams from; when
//! the client disconnects, axum drops its half of that channel and the
//! forwarder's next send fails, which is how disconnect is detected here.

use std::convert::Infallible;

use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONNECTION, HOST};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::broadcaster::{ClientEvent, ClientId};
use crate::lifecycle::Bridge;

const OUTBOUND_QUEUE_DEPTH: usize = 32;

pub async fn handle(State(bridge): State<Bridge>, headers: axum::http::HeaderMap) -> Response {
    let Some(client) = bridge.add_sse_client() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost")
        .to_string();
    let endpoint_url = format!("http://{host}/message");

    let (tx, rx) = mpsc::channel::<Event>(OUTBOUND_QUEUE_DEPTH);
    tokio::spawn(forward(bridge, client.id, client.receiver, tx, endpoint_url));

    let stream = ReceiverStream::new(rx).map(Ok::<Event, Infallible>);
    let mut response = Sse::new(stream).into_response();

    let headers = response.headers_mut();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

/// Owns `client_rx` for the connection's whole life: emits `connected` and
/// `endpoint` on entry, then relays messages/shutdown from the broadcaster
/// and ticks the heartbeat, until the client disconnects or the bridge
/// shuts down. Always removes the client from the broadcaster on exit.
async fn forward(
    bridge: Bridge,
    client_id: ClientId,
    mut client_rx: mpsc::Receiver<ClientEvent>,
    tx: mpsc::Sender<Event>,
    endpoint_url: String,
) {
    let connected = Event::default()
        .event("connected")
        .json_data(json!({ "clientId": client_id.to_string() }))
        .unwrap_or_default();
    if tx.send(connected).await.is_err() {
        bridge.remove_sse_client(client_id);
        return;
    }
    let endpoint = Event::default().event("endpoint").data(endpoint_url);
    if tx.send(endpoint).await.is_err() {
        bridge.remove_sse_client(client_id);
        return;
    }

    let mut shutdown_rx = bridge.shutdown_signal();
    let mut heartbeat = bridge.config().sse_heartbeat_interval().map(tokio::time::interval);

    loop {
        let heartbeat_tick = async {
            match &mut heartbeat {
                Some(interval) => {
                    interval.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                let event = shutdown_event("bridge shutting down");
                let _ = tx.send(event).await;
                break;
            }

            received = client_rx.recv() => {
                match received {
                    Some(ClientEvent::Message(json)) => {
                        let event = Event::default().event("message").data(json.to_string());
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Some(ClientEvent::Shutdown { reason }) => {
                        let _ = tx.send(shutdown_event(&reason)).await;
                        break;
                    }
                    None => break,
                }
            }

            _ = heartbeat_tick => {
                if tx.send(Event::default().comment("heartbeat")).await.is_err() {
                    break;
                }
            }
        }
    }

    bridge.remove_sse_client(client_id);
}

fn shutdown_event(reason: &str) -> Event {
    Event::default()
        .event("shutdown")
        .json_data(json!({ "reason": reason }))
        .unwrap_or_default()
}
