//! Fan-out registry delivering child-emitted frames to every connected SSE
//! client.
//!
//! Built around `Arc<Mutex<Vec<RegisteredClient>>>` plus `retain` to drop
//! dead senders, the same shape as a `tokio::sync::broadcast` channel paired
//! with per-connection SSE tasks. An explicit registry (not a bare
//! broadcast channel) is needed here
//! because clients need individually minted ids and a bounded queue whose
//! overflow policy is "disconnect", not "lag silently".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;

use crate::frame::Frame;

/// Default bound on a single client's outbound queue before it is
/// considered a slow consumer and disconnected.
pub const DEFAULT_CLIENT_QUEUE_DEPTH: usize = 256;

/// An event delivered to one SSE client's writer task.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Message(Arc<str>),
    Shutdown { reason: String },
}

pub type ClientId = u64;

struct ClientEntry {
    sender: mpsc::Sender<ClientEvent>,
    #[allow(dead_code)]
    connected_at: Instant,
}

struct Inner {
    clients: Mutex<HashMap<ClientId, ClientEntry>>,
    next_id: AtomicU64,
    active: AtomicU64,
    total_connections: AtomicU64,
}

/// Registry of connected SSE clients with bounded per-client buffers.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
    queue_depth: usize,
}

/// A freshly registered client: its id plus the receiving half the HTTP
/// handler's writer loop drains.
pub struct RegisteredClient {
    pub id: ClientId,
    pub receiver: mpsc::Receiver<ClientEvent>,
}

impl Broadcaster {
    pub fn new(queue_depth: usize) -> Self {
        Broadcaster {
            inner: Arc::new(Inner {
                clients: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                active: AtomicU64::new(0),
                total_connections: AtomicU64::new(0),
            }),
            queue_depth,
        }
    }

    /// Registers a new client and returns its id plus a receiver for the
    /// handler's writer loop.
    pub fn add(&self) -> RegisteredClient {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::channel(self.queue_depth);
        self.inner.clients.lock().expect("broadcaster mutex poisoned").insert(
            id,
            ClientEntry {
                sender,
                connected_at: Instant::now(),
            },
        );
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        self.inner.total_connections.fetch_add(1, Ordering::SeqCst);
        RegisteredClient { id, receiver }
    }

    /// Removes a client from the registry. Idempotent: removing an id more
    /// than once (e.g. once from disconnect detection, once from a failed
    /// broadcast send) only decrements the active gauge the first time.
    pub fn remove(&self, id: ClientId) {
        let removed = self
            .inner
            .clients
            .lock()
            .expect("broadcaster mutex poisoned")
            .remove(&id)
            .is_some();
        if removed {
            self.inner.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Serialises `frame` once, then fans it out to every connected client
    /// via a non-blocking send. A client whose queue is full (a slow
    /// consumer) or whose receiver has been dropped is removed.
    pub fn broadcast(&self, frame: &Frame) {
        let Ok(json) = serde_json::to_string(frame) else {
            return;
        };
        self.broadcast_raw(json);
    }

    fn broadcast_raw(&self, json: String) {
        let payload: Arc<str> = Arc::from(json);
        let snapshot: Vec<(ClientId, mpsc::Sender<ClientEvent>)> = {
            let guard = self.inner.clients.lock().expect("broadcaster mutex poisoned");
            guard.iter().map(|(id, entry)| (*id, entry.sender.clone())).collect()
        };

        let mut dead = Vec::new();
        for (id, sender) in snapshot {
            if sender.try_send(ClientEvent::Message(payload.clone())).is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            self.remove(id);
        }
    }

    /// Sends a terminal `shutdown` event to every client, then clears the
    /// registry. Subsequent `add` calls still succeed (the lifecycle
    /// controller rejects new SSE connections at a higher layer once the
    /// bridge state leaves `running`).
    pub fn shutdown(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let snapshot: Vec<(ClientId, mpsc::Sender<ClientEvent>)> = {
            let mut guard = self.inner.clients.lock().expect("broadcaster mutex poisoned");
            let snapshot = guard.iter().map(|(id, entry)| (*id, entry.sender.clone())).collect();
            guard.clear();
            snapshot
        };
        self.inner.active.store(0, Ordering::SeqCst);
        for (_, sender) in snapshot {
            let _ = sender.try_send(ClientEvent::Shutdown {
                reason: reason.clone(),
            });
        }
    }

    pub fn active_count(&self) -> u64 {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn total_connections(&self) -> u64 {
        self.inner.total_connections.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RequestId;

    #[tokio::test]
    async fn broadcast_reaches_all_clients() {
        let broadcaster = Broadcaster::new(DEFAULT_CLIENT_QUEUE_DEPTH);
        let mut clients: Vec<RegisteredClient> =
            (0..3).map(|_| broadcaster.add()).collect();
        assert_eq!(broadcaster.active_count(), 3);

        let frame = Frame::success(RequestId::Number(9), serde_json::json!({}));
        broadcaster.broadcast(&frame);

        for client in &mut clients {
            match client.receiver.recv().await.unwrap() {
                ClientEvent::Message(json) => {
                    let decoded: Frame = serde_json::from_str(&json).unwrap();
                    assert_eq!(decoded.id, frame.id);
                }
                ClientEvent::Shutdown { .. } => panic!("unexpected shutdown"),
            }
        }
    }

    #[tokio::test]
    async fn removing_a_client_drops_the_gauge() {
        let broadcaster = Broadcaster::new(DEFAULT_CLIENT_QUEUE_DEPTH);
        let client = broadcaster.add();
        broadcaster.remove(client.id);
        assert_eq!(broadcaster.active_count(), 0);
        // Idempotent: removing twice doesn't underflow.
        broadcaster.remove(client.id);
        assert_eq!(broadcaster.active_count(), 0);
    }

    #[tokio::test]
    async fn full_queue_disconnects_the_slow_client() {
        let broadcaster = Broadcaster::new(1);
        let client = broadcaster.add();
        let frame = Frame::success(RequestId::Number(1), serde_json::json!(null));
        // Fill the one-deep queue, then overflow it without draining.
        broadcaster.broadcast(&frame);
        broadcaster.broadcast(&frame);
        assert_eq!(broadcaster.active_count(), 0);
        drop(client);
    }

    #[tokio::test]
    async fn shutdown_notifies_and_clears_registry() {
        let broadcaster = Broadcaster::new(DEFAULT_CLIENT_QUEUE_DEPTH);
        let mut client = broadcaster.add();
        broadcaster.shutdown("bridge stopping");
        match client.receiver.recv().await.unwrap() {
            ClientEvent::Shutdown { reason } => assert_eq!(reason, "bridge stopping"),
            ClientEvent::Message(_) => panic!("expected shutdown event"),
        }
        assert_eq!(broadcaster.active_count(), 0);
    }
}
