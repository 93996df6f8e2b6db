//! The bridge's state machine: startup (spawn, handshake), steady-state
//! request submission, and graceful/unexpected shutdown.
//!
//! Owns the process, a writer, a correlator map, and the background tasks
//! collected for teardown, matching the "tear down exactly once" discipline
//! of a `Drop`-based transport, generalised here into an explicit
//! `BridgeState` instead of relying on `Drop` alone, since the bridge must
//! expose its state to the health endpoint while still running.

use std::ffi::OsString;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::io::BufReader;
use tokio::process::ChildStdout;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::broadcaster::{Broadcaster, RegisteredClient, DEFAULT_CLIENT_QUEUE_DEPTH};
use crate::clock::{Clock, SystemClock};
use crate::config::BridgeConfig;
use crate::correlator::{Correlator, CorrelatorError};
use crate::counters::{Counters, CountersSnapshot};
use crate::error::{BridgeError, RpcErrorKind};
use crate::frame::{Frame, RequestId};
use crate::framing::{self, ScanOutcome};
use crate::process::{self, ProcessController, SpawnSpec};
use crate::stdin_writer::StdinWriter;
use crate::stdout_pump::{self, PumpContext, PumpExit};

const PROTOCOL_VERSION: &str = "2024-11-05";

/// Legal states, per the data model: idle→starting→{running,error};
/// running→stopping→stopped; any→error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl BridgeState {
    pub fn name(self) -> &'static str {
        match self {
            BridgeState::Idle => "idle",
            BridgeState::Starting => "starting",
            BridgeState::Running => "running",
            BridgeState::Stopping => "stopping",
            BridgeState::Stopped => "stopped",
            BridgeState::Error => "error",
        }
    }
}

/// Reported to the `on_process_exit` callback when the child terminates
/// without a preceding `shutdown()` call.
#[derive(Debug, Clone, Copy)]
pub struct ChildExit {
    pub status: Option<std::process::ExitStatus>,
}

pub type ExitCallback = Arc<dyn Fn(ChildExit) + Send + Sync>;

#[derive(Debug)]
enum TerminalCause {
    ChildExited(Option<std::process::ExitStatus>),
    PumpExited(PumpExit),
}

struct Shared {
    config: BridgeConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BridgeState>,
    start_time: Mutex<Option<std::time::Instant>>,
    correlator: Arc<Correlator>,
    broadcaster: Broadcaster,
    counters: Arc<Counters>,
    stdin: Mutex<Option<Arc<StdinWriter>>>,
    process: Mutex<Option<ProcessController>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    on_process_exit: Mutex<Option<ExitCallback>>,
}

/// The bridge: a single supervised child process exposed over HTTP+SSE.
/// Cheaply `Clone`able; every clone shares the same underlying state.
#[derive(Clone)]
pub struct Bridge(Arc<Shared>);

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BridgeConfig, clock: Arc<dyn Clock>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Bridge(Arc::new(Shared {
            config,
            clock,
            state: Mutex::new(BridgeState::Idle),
            start_time: Mutex::new(None),
            correlator: Arc::new(Correlator::new()),
            broadcaster: Broadcaster::new(DEFAULT_CLIENT_QUEUE_DEPTH),
            counters: Arc::new(Counters::default()),
            stdin: Mutex::new(None),
            process: Mutex::new(None),
            reaper: Mutex::new(None),
            shutdown_tx,
            on_process_exit: Mutex::new(None),
        }))
    }

    pub fn set_on_process_exit(&self, callback: ExitCallback) {
        *self.0.on_process_exit.lock().expect("bridge mutex poisoned") = Some(callback);
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.0.config
    }

    pub fn state(&self) -> BridgeState {
        *self.0.state.lock().expect("bridge mutex poisoned")
    }

    /// Healthy means running and past the handshake. The two coincide,
    /// since `start` only reaches `Running` after the handshake succeeds.
    pub fn is_healthy(&self) -> bool {
        self.state() == BridgeState::Running
    }

    pub fn pid(&self) -> Option<u32> {
        self.0.process.lock().expect("bridge mutex poisoned").as_ref().and_then(|p| p.pid)
    }

    pub fn uptime(&self) -> Option<Duration> {
        let start = (*self.0.start_time.lock().expect("bridge mutex poisoned"))?;
        Some(self.0.clock.now().saturating_duration_since(start))
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.0.counters.snapshot()
    }

    pub fn sse_active(&self) -> u64 {
        self.0.broadcaster.active_count()
    }

    pub fn sse_total(&self) -> u64 {
        self.0.broadcaster.total_connections()
    }

    fn try_transition(&self, from: &[BridgeState], to: BridgeState) -> bool {
        let mut guard = self.0.state.lock().expect("bridge mutex poisoned");
        if from.contains(&guard) {
            *guard = to;
            true
        } else {
            false
        }
    }

    /// Spawns the child, drives the handshake, and on success starts
    /// the stdout pump, stderr drain, and reaper tasks and transitions to
    /// `running`. On any failure the bridge transitions to `error` and the
    /// error is returned; no partial teardown is left for the caller.
    pub async fn start(&self) -> Result<(), BridgeError> {
        if !self.try_transition(&[BridgeState::Idle], BridgeState::Starting) {
            return Err(BridgeError::AlreadyStarted);
        }

        match self.start_inner().await {
            Ok(()) => {
                *self.0.start_time.lock().expect("bridge mutex poisoned") = Some(self.0.clock.now());
                self.try_transition(&[BridgeState::Starting], BridgeState::Running);
                info!(pid = ?self.pid(), "bridge running");
                Ok(())
            }
            Err(err) => {
                self.try_transition(&[BridgeState::Starting], BridgeState::Error);
                error!(%err, "bridge failed to start");
                Err(err)
            }
        }
    }

    async fn start_inner(&self) -> Result<(), BridgeError> {
        let spec = SpawnSpec {
            command: self.0.config.command.iter().map(OsString::from).collect(),
            env: self
                .0
                .config
                .environment
                .iter()
                .map(|(k, v)| (OsString::from(k), OsString::from(v)))
                .collect(),
            cwd: self.0.config.working_directory.clone(),
        };

        let (streams, controller, terminated) = process::spawn(&spec).await?;
        let pid = controller.pid;
        *self.0.process.lock().expect("bridge mutex poisoned") = Some(controller);

        let stdin_writer = Arc::new(StdinWriter::new(streams.stdin));
        *self.0.stdin.lock().expect("bridge mutex poisoned") = Some(stdin_writer.clone());

        tokio::spawn(drain_stderr(streams.stderr));

        let mut stdout_reader = BufReader::new(streams.stdout);
        self.handshake(&stdin_writer, &mut stdout_reader, pid).await?;

        let pump_ctx = PumpContext {
            correlator: self.0.correlator.clone(),
            broadcaster: self.0.broadcaster.clone(),
            counters: self.0.counters.clone(),
            max_line_bytes: framing::DEFAULT_MAX_LINE_BYTES,
        };
        let pump_handle = tokio::spawn(stdout_pump::run(stdout_reader, pump_ctx));

        let bridge = self.clone();
        tokio::spawn(async move {
            let exit = pump_handle.await.unwrap_or(PumpExit::Io);
            bridge.on_terminal(TerminalCause::PumpExited(exit)).await;
        });

        let bridge = self.clone();
        let reaper = tokio::spawn(async move {
            let status = terminated.await.ok();
            bridge.on_terminal(TerminalCause::ChildExited(status)).await;
        });
        *self.0.reaper.lock().expect("bridge mutex poisoned") = Some(reaper);

        Ok(())
    }

    /// Drives the `initialize`/`initialized` exchange. Reads exactly one
    /// frame directly off `stdout_reader`, outside the
    /// ordinary pump loop, which only starts afterwards, so there is never
    /// more than one reader of the child's stdout at a time.
    async fn handshake(
        &self,
        stdin_writer: &StdinWriter,
        stdout_reader: &mut BufReader<ChildStdout>,
        pid: Option<u32>,
    ) -> Result<(), BridgeError> {
        let init_request = Frame::request(
            RequestId::Number(0),
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": "stdio-rpc-bridge", "version": env!("CARGO_PKG_VERSION") },
            }),
        );
        stdin_writer
            .write_frame(&init_request)
            .await
            .map_err(|_| BridgeError::HandshakeChildExited)?;

        let timeout = self.0.config.handshake_timeout();
        let (_, outcome) = time::timeout(
            timeout,
            framing::scan_frame(stdout_reader, framing::DEFAULT_MAX_LINE_BYTES),
        )
        .await
        .map_err(|_| BridgeError::HandshakeTimeout(timeout))?;

        match outcome {
            ScanOutcome::Frame(frame) if frame.error.is_some() => {
                let message = frame
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "unknown error".to_string());
                Err(BridgeError::HandshakeRejected(message))
            }
            ScanOutcome::Frame(frame) if frame.result.is_some() => {
                debug!(pid = ?pid, "handshake complete");
                let initialized =
                    Frame::notification("notifications/initialized", json!({}));
                stdin_writer
                    .write_frame(&initialized)
                    .await
                    .map_err(|_| BridgeError::HandshakeChildExited)?;
                Ok(())
            }
            ScanOutcome::Eof => Err(BridgeError::HandshakeChildExited),
            _ => Err(BridgeError::HandshakeRejected(
                "malformed or empty handshake response".to_string(),
            )),
        }
    }

    /// Registers a waiter under `frame`'s id and writes `frame` to stdin.
    /// Returns the normalised id (for deregistering/labelling a timeout
    /// envelope) plus the waiter, which the caller should race against its
    /// own cancellation/timeout. The caller must deregister on every exit
    /// path (a `Drop` guard is the simplest way, since an HTTP handler
    /// future can be dropped mid-await on client disconnect).
    pub async fn submit_request(
        &self,
        frame: Frame,
    ) -> Result<(RequestId, crate::correlator::Waiter), RpcErrorKind> {
        let id = frame.id.clone().ok_or(RpcErrorKind::InvalidRequest)?;

        match self.state() {
            BridgeState::Running => {}
            BridgeState::Stopping | BridgeState::Stopped => return Err(RpcErrorKind::BridgeShutdown),
            _ => return Err(RpcErrorKind::ProcessNotReady),
        }

        let waiter = self.0.correlator.register(id.clone()).map_err(|err| match err {
            CorrelatorError::Closed => RpcErrorKind::BridgeShutdown,
            CorrelatorError::DuplicateId => RpcErrorKind::Internal,
        })?;

        let Some(stdin) = self.0.stdin.lock().expect("bridge mutex poisoned").clone() else {
            self.0.correlator.deregister(&id);
            return Err(RpcErrorKind::ProcessClosed);
        };

        match stdin.write_frame(&frame).await {
            Ok(n) => self.0.counters.record_bytes_out(n as u64),
            Err(_) => {
                self.0.correlator.deregister(&id);
                return Err(RpcErrorKind::ProcessClosed);
            }
        }

        Ok((id, waiter))
    }

    pub async fn submit_notification(&self, frame: Frame) -> Result<(), RpcErrorKind> {
        match self.state() {
            BridgeState::Running => {}
            BridgeState::Stopping | BridgeState::Stopped => return Err(RpcErrorKind::BridgeShutdown),
            _ => return Err(RpcErrorKind::ProcessNotReady),
        }
        let Some(stdin) = self.0.stdin.lock().expect("bridge mutex poisoned").clone() else {
            return Err(RpcErrorKind::ProcessClosed);
        };
        match stdin.write_frame(&frame).await {
            Ok(n) => {
                self.0.counters.record_bytes_out(n as u64);
                Ok(())
            }
            Err(_) => Err(RpcErrorKind::ProcessClosed),
        }
    }

    pub fn deregister(&self, id: &RequestId) {
        self.0.correlator.deregister(id);
    }

    /// Admits a new SSE client if the bridge is running; otherwise `None`
    /// (the HTTP layer responds 503: there is no child to stream from).
    pub fn add_sse_client(&self) -> Option<RegisteredClient> {
        if self.state() != BridgeState::Running {
            return None;
        }
        Some(self.0.broadcaster.add())
    }

    pub fn remove_sse_client(&self, id: crate::broadcaster::ClientId) {
        self.0.broadcaster.remove(id);
    }

    /// A receiver that changes to `true` exactly once, when `shutdown` is
    /// called: the "shutdown beacon" SSE handlers select on.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.0.shutdown_tx.subscribe()
    }

    pub fn record_counters_on_admission(&self) {
        self.0.counters.record_request();
    }

    pub fn record_success(&self) {
        self.0.counters.record_success();
    }

    pub fn record_failure(&self) {
        self.0.counters.record_failure();
    }

    /// Called when the child exits or the stdout pump stops, whether or not
    /// that was expected. Guarded by `try_transition` so only the first of
    /// {reaper, pump-exit watcher, explicit `shutdown`} actually runs the
    /// bulk-fail/teardown logic.
    async fn on_terminal(&self, cause: TerminalCause) {
        if !self.try_transition(&[BridgeState::Starting, BridgeState::Running], BridgeState::Error) {
            return;
        }
        warn!(?cause, "child process terminated unexpectedly");
        self.0.correlator.fail_all(RpcErrorKind::ProcessClosed);
        self.0.broadcaster.shutdown("child process exited unexpectedly");
        if let Some(stdin) = self.0.stdin.lock().expect("bridge mutex poisoned").take() {
            stdin.close().await;
        }
        let status = match cause {
            TerminalCause::ChildExited(status) => status,
            TerminalCause::PumpExited(_) => None,
        };
        let callback = self.0.on_process_exit.lock().expect("bridge mutex poisoned").clone();
        if let Some(callback) = callback {
            callback(ChildExit { status });
        }
    }

    /// Idempotent graceful shutdown: notify SSE clients → child soft-stop
    /// then hard-kill → bulk-fail outstanding waiters → state = stopped.
    pub async fn shutdown(&self) {
        if !self.try_transition(&[BridgeState::Running], BridgeState::Stopping) {
            return;
        }

        let _ = self.0.shutdown_tx.send(true);
        self.0.broadcaster.shutdown("bridge shutting down");

        if let Some(stdin) = self.0.stdin.lock().expect("bridge mutex poisoned").take() {
            stdin.close().await;
        }

        if let Some(controller) = self.0.process.lock().expect("bridge mutex poisoned").take() {
            controller.stop(self.0.config.shutdown_timeout()).await;
        }

        self.0.correlator.fail_all(RpcErrorKind::ProcessClosed);

        if let Some(handle) = self.0.reaper.lock().expect("bridge mutex poisoned").take() {
            let _ = time::timeout(self.0.config.shutdown_timeout(), handle).await;
        }

        self.try_transition(&[BridgeState::Stopping], BridgeState::Stopped);
        info!("bridge stopped");
    }
}

async fn drain_stderr(stderr: tokio::process::ChildStderr) {
    use tokio::io::AsyncBufReadExt;
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "child_stderr", "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(command: Vec<&str>) -> BridgeConfig {
        BridgeConfig {
            command: command.into_iter().map(String::from).collect(),
            environment: HashMap::new(),
            working_directory: None,
            address: ":0".to_string(),
            read_timeout_secs: 30,
            write_timeout_secs: 5,
            idle_timeout_secs: 120,
            shutdown_timeout_secs: 2,
            max_request_size: framing::DEFAULT_MAX_LINE_BYTES,
            sse_heartbeat_secs: 15,
            handshake_timeout_secs: 2,
        }
    }

    // tests/fixtures/handshake_echo.sh is a tiny script that answers
    // `initialize` then echoes every subsequent line back with the same id.
    fn fixture(name: &str) -> String {
        format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
    }

    #[tokio::test]
    async fn start_fails_cleanly_for_a_nonexistent_binary() {
        let bridge = Bridge::new(config_with(vec!["/no/such/binary"]));
        let err = bridge.start().await.unwrap_err();
        assert!(matches!(err, BridgeError::Spawn { .. }));
        assert_eq!(bridge.state(), BridgeState::Error);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let bridge = Bridge::new(config_with(vec!["sh", &fixture("handshake_echo.sh")]));
        bridge.start().await.expect("first start succeeds");
        assert!(matches!(bridge.start().await, Err(BridgeError::AlreadyStarted)));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn ping_round_trip_resolves_through_the_correlator() {
        let bridge = Bridge::new(config_with(vec!["sh", &fixture("handshake_echo.sh")]));
        bridge.start().await.expect("start");
        assert_eq!(bridge.state(), BridgeState::Running);

        let id = RequestId::Number(42);
        let frame = Frame::request(id.clone(), "ping", serde_json::json!(null));
        let (_, waiter) = bridge.submit_request(frame).await.expect("submit");
        let response = time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("response within timeout")
            .expect("waiter resolved");
        assert_eq!(response.method.as_deref(), Some("ping"));

        bridge.shutdown().await;
        assert_eq!(bridge.state(), BridgeState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let bridge = Bridge::new(config_with(vec!["sh", &fixture("handshake_echo.sh")]));
        bridge.start().await.expect("start");
        bridge.shutdown().await;
        bridge.shutdown().await;
        assert_eq!(bridge.state(), BridgeState::Stopped);
    }

    #[tokio::test]
    async fn uptime_advances_with_the_injected_clock() {
        use crate::clock::test_support::FixedClock;

        let clock = Arc::new(FixedClock::new());
        let bridge = Bridge::with_clock(
            config_with(vec!["sh", &fixture("handshake_echo.sh")]),
            clock.clone(),
        );
        assert_eq!(bridge.uptime(), None);

        bridge.start().await.expect("start");
        assert_eq!(bridge.uptime(), Some(Duration::ZERO));

        clock.advance(Duration::from_secs(30));
        assert_eq!(bridge.uptime(), Some(Duration::from_secs(30)));

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn unexpected_exit_bulk_fails_waiters_and_moves_to_error() {
        let bridge = Bridge::new(config_with(vec!["sh", &fixture("handshake_then_exit.sh")]));
        bridge.start().await.expect("start");

        let id = RequestId::Number(1);
        let frame = Frame::request(id.clone(), "ping", serde_json::json!(null));
        let (_, waiter) = bridge.submit_request(frame).await.expect("submit");
        let response = time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("resolved before timeout")
            .expect("channel open");
        assert_eq!(
            response.error.map(|e| e.code),
            Some(RpcErrorKind::ProcessClosed.code())
        );
        assert_eq!(bridge.state(), BridgeState::Error);
    }
}
