//! Maps request ids to single-slot waiters, bridging the async HTTP handler
//! world and the single ordered byte stream coming back from the child.
//!
//! `Arc<Mutex<HashMap<RequestId, oneshot::Sender<...>>>>`, with explicit
//! bulk-fail-on-shutdown semantics and a "closed" mode that rejects new
//! registrations once the bridge is tearing down.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::warn;

use crate::error::RpcErrorKind;
use crate::frame::{Frame, RequestId, RpcError};

/// The single-slot sink for exactly one response frame. Owned by the HTTP
/// handler that registered it.
pub type Waiter = oneshot::Receiver<Frame>;
type WaiterSink = oneshot::Sender<Frame>;

enum Registry {
    Open(HashMap<RequestId, WaiterSink>),
    Closed,
}

/// Registry mapping in-flight request ids to their waiters.
pub struct Correlator {
    inner: Mutex<Registry>,
}

#[derive(Debug, thiserror::Error)]
pub enum CorrelatorError {
    #[error("a waiter is already registered for this request id")]
    DuplicateId,
    #[error("the bridge is shutting down and no longer accepts new requests")]
    Closed,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Correlator {
            inner: Mutex::new(Registry::Open(HashMap::new())),
        }
    }

    /// Registers a new waiter under `id`. A duplicate *live* id is a
    /// programming error per the data model's invariant and is rejected
    /// rather than silently overwriting the earlier waiter.
    pub fn register(&self, id: RequestId) -> Result<Waiter, CorrelatorError> {
        let mut guard = self.inner.lock().expect("correlator mutex poisoned");
        match &mut *guard {
            Registry::Closed => Err(CorrelatorError::Closed),
            Registry::Open(map) => {
                if map.contains_key(&id) {
                    return Err(CorrelatorError::DuplicateId);
                }
                let (tx, rx) = oneshot::channel();
                map.insert(id, tx);
                Ok(rx)
            }
        }
    }

    /// Removes the waiter for `id` without resolving it. Called on every
    /// handler exit path (success, timeout, cancel, write failure) so the
    /// map never accumulates stale entries.
    pub fn deregister(&self, id: &RequestId) {
        let mut guard = self.inner.lock().expect("correlator mutex poisoned");
        if let Registry::Open(map) = &mut *guard {
            map.remove(id);
        }
    }

    /// Resolves the waiter for `frame`'s id, if one is registered. Returns
    /// `true` if a waiter was found and the frame delivered to it. A full
    /// channel can't happen here (the channel is single-slot, single-send)
    /// but a *missing* waiter is an ordinary outcome: the frame is still
    /// broadcast by the caller.
    pub fn resolve(&self, id: &RequestId, frame: Frame) -> bool {
        let sender = {
            let mut guard = self.inner.lock().expect("correlator mutex poisoned");
            match &mut *guard {
                Registry::Closed => None,
                Registry::Open(map) => map.remove(id),
            }
        };
        match sender {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    warn!(%id, "waiter dropped before its response arrived");
                }
                true
            }
            None => false,
        }
    }

    /// Bulk-fails every outstanding waiter with a synthetic error frame and
    /// transitions the registry to closed mode, so subsequent `register`
    /// calls fail with `bridge-shutdown` instead of racing a half-torn-down
    /// bridge.
    pub fn fail_all(&self, kind: RpcErrorKind) {
        let drained = {
            let mut guard = self.inner.lock().expect("correlator mutex poisoned");
            let map = match std::mem::replace(&mut *guard, Registry::Closed) {
                Registry::Open(map) => map,
                Registry::Closed => HashMap::new(),
            };
            map
        };
        for (id, tx) in drained {
            let frame = Frame::error_response(Some(id), RpcError::new(kind));
            let _ = tx.send(frame);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        match &*self.inner.lock().unwrap() {
            Registry::Open(map) => map.len(),
            Registry::Closed => 0,
        }
    }
}
