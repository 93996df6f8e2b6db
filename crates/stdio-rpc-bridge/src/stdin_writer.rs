//! Serialises writes to the child's stdin under a single mutex.
//!
//! Drains each frame into `stdin.write_all` + a newline + `flush`. This
//! bridge needs synchronous-feeling write errors at the call site (so the HTTP
//! handler can deregister its waiter and respond immediately), so writes
//! go directly through a mutex instead of a channel + background task.

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::Mutex;

use crate::frame::Frame;
use crate::framing;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("child stdin is closed")]
    Closed,
}

/// A mutex-guarded stdin handle. Once a write fails (partial write, broken
/// pipe), the handle is poisoned permanently: every subsequent call fails
/// fast with `Closed` rather than retrying.
pub struct StdinWriter {
    inner: Mutex<Option<ChildStdin>>,
}

impl StdinWriter {
    pub fn new(stdin: ChildStdin) -> Self {
        StdinWriter {
            inner: Mutex::new(Some(stdin)),
        }
    }

    /// Returns the number of bytes written (including the trailing newline)
    /// on success, so callers can account them against a bytes-out counter.
    pub async fn write_frame(&self, frame: &Frame) -> Result<usize, WriteError> {
        let encoded = framing::encode_frame(frame)?;
        let mut guard = self.inner.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(WriteError::Closed);
        };
        if stdin.write_all(&encoded).await.is_err() || stdin.flush().await.is_err() {
            *guard = None;
            return Err(WriteError::Closed);
        }
        Ok(encoded.len())
    }

    /// Marks the handle closed without necessarily dropping the real pipe
    /// (the process supervisor owns the child and its teardown); used by
    /// the lifecycle controller so that no code path writes to stdin after
    /// the bridge leaves `running`, per the child-process-handle invariant.
    pub async fn close(&self) {
        *self.inner.lock().await = None;
    }
}
