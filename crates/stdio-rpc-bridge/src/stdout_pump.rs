//! The single task that reads framed lines from child stdout, routes
//! responses to the correlator, and broadcasts everything to SSE clients.
//!
//! One `BufReader` over stdout, decode-or-log-and-continue, dispatch:
//! responses are routed to whichever waiter is registered for their id,
//! and every frame, responses included, is also broadcast to SSE
//! clients so a connected dashboard sees the full traffic.

use std::sync::Arc;

use tokio::io::AsyncBufRead;
use tracing::warn;

use crate::broadcaster::Broadcaster;
use crate::correlator::Correlator;
use crate::counters::Counters;
use crate::framing::{self, ScanOutcome};

/// Why the pump stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// Child closed stdout (normal or abnormal exit).
    Eof,
    /// The underlying stream itself errored (not a decode failure).
    Io,
}

pub struct PumpContext {
    pub correlator: Arc<Correlator>,
    pub broadcaster: Broadcaster,
    pub counters: Arc<Counters>,
    pub max_line_bytes: usize,
}

/// Runs until EOF or a stream-level I/O error. Malformed or oversize lines
/// are logged and skipped; they never end the pump.
pub async fn run<R>(mut reader: R, ctx: PumpContext) -> PumpExit
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (bytes_read, outcome) = framing::scan_frame(&mut reader, ctx.max_line_bytes).await;
        ctx.counters.record_bytes_in(bytes_read as u64);

        match outcome {
            ScanOutcome::Eof => return PumpExit::Eof,
            ScanOutcome::Empty => continue,
            ScanOutcome::Decode(err) => {
                warn!(%err, "discarding malformed stdout frame");
                if matches!(err, framing::DecodeError::Io(_)) {
                    return PumpExit::Io;
                }
                continue;
            }
            ScanOutcome::Frame(frame) => {
                ctx.broadcaster.broadcast(&frame);
                if let Some(id) = frame.id.clone() {
                    ctx.correlator.resolve(&id, frame);
                }
            }
        }
    }
}
