//! Spawns the child process and supervises its lifetime.
//!
//! The busy-retry spawn loop retries `ExecutableFileBusy`/`ETXTBSY` with
//! capped backoff. Graceful shutdown (`SIGTERM` then `SIGKILL`) uses `nix`
//! for process signalling, since `kill_on_drop` alone only gives a hard
//! kill, never a soft one.
//!
//! `tokio::process::Child::wait` may only be polled by a single caller, so
//! a dedicated supervisor task owns the `Child` for its whole life and
//! multiplexes passive reaping with stop requests over a channel. Callers
//! get back the three stdio streams (to hand to the writer/pump/stderr-drain
//! tasks), a [`ProcessController`] (to request a stop later), and a
//! [`Terminated`] receiver (for the reaper task to observe exit).

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{info, warn};

use crate::error::BridgeError;

/// Arguments needed to spawn the child.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: Vec<OsString>,
    pub env: HashMap<OsString, OsString>,
    pub cwd: Option<PathBuf>,
}

/// The child's three stdio streams, handed off to the writer/pump/stderr
/// tasks. Each stream has exactly one owner for its whole life.
pub struct ProcessStreams {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Fires exactly once, when the supervisor task observes the child exit
/// (on its own, or in response to [`ProcessController::stop`]), regardless
/// of exit code or signal. Owned by the reaper task.
pub type Terminated = oneshot::Receiver<ExitStatus>;

/// A cheap handle for requesting a graceful stop. Does not own the child;
/// the supervisor task spawned by [`spawn`] does.
pub struct ProcessController {
    pub pid: Option<u32>,
    stop_tx: mpsc::Sender<Duration>,
}

impl ProcessController {
    /// Requests a graceful stop: a soft interrupt is sent immediately, and
    /// the child is force-killed if it hasn't exited within `grace_timeout`.
    /// Idempotent: a second call while a stop is already in flight is
    /// dropped silently; callers observe completion via [`Terminated`].
    pub async fn stop(&self, grace_timeout: Duration) {
        let _ = self.stop_tx.send(grace_timeout).await;
    }
}

/// Spawns `spec.command[0]` with the rest as argv, the process environment
/// overlaid with `spec.env` (overlay wins on collision), and `spec.cwd` if
/// set. On any failure, no partially-created pipes are leaked: `Command`
/// only creates pipes once `spawn()` succeeds.
pub async fn spawn(
    spec: &SpawnSpec,
) -> Result<(ProcessStreams, ProcessController, Terminated), BridgeError> {
    let Some((program, args)) = spec.command.split_first() else {
        return Err(BridgeError::Spawn {
            binary: PathBuf::new(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "command must have at least one element",
            ),
        });
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let mut child = spawn_with_retry(&mut command, program.into())?;

    let stdin = child.stdin.take().ok_or(BridgeError::StdinUnavailable)?;
    let stdout = child.stdout.take().ok_or(BridgeError::StdoutUnavailable)?;
    let stderr = child.stderr.take().ok_or(BridgeError::StderrUnavailable)?;
    let pid = child.id();

    let (terminated_tx, terminated_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = mpsc::channel(1);
    tokio::spawn(supervise(child, terminated_tx, stop_rx));

    Ok((
        ProcessStreams { stdin, stdout, stderr },
        ProcessController { pid, stop_tx },
        terminated_rx,
    ))
}

/// Owns `child` for its entire life. Races passive exit against an
/// incoming stop request; on a stop request, sends a soft interrupt and
/// races the child's exit against `grace_timeout` before force-killing.
async fn supervise(
    mut child: Child,
    terminated_tx: oneshot::Sender<ExitStatus>,
    mut stop_rx: mpsc::Receiver<Duration>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Some(grace_timeout) = stop_rx.recv() => {
            soft_interrupt(&child);
            match time::timeout(grace_timeout, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!("child did not exit within grace period, force-killing");
                    if let Err(err) = child.start_kill() {
                        warn!(%err, "failed to force-kill child");
                    }
                    child.wait().await
                }
            }
        }
    };
    if let Ok(status) = status {
        let _ = terminated_tx.send(status);
    }
}

fn spawn_with_retry(command: &mut Command, binary: PathBuf) -> Result<Child, BridgeError> {
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    std::thread::sleep(backoff);
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(BridgeError::Spawn { binary, source });
            }
        }
    }
    unreachable!("spawn_with_retry should return before exhausting retries")
}

#[cfg(unix)]
fn soft_interrupt(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(%err, "failed to send SIGTERM to child, will hard-kill on timeout");
    } else {
        info!(pid, "sent SIGTERM to child");
    }
}

#[cfg(not(unix))]
fn soft_interrupt(_child: &Child) {
    // Windows has no SIGTERM equivalent reachable without extra platform
    // crates the rest of the pack doesn't use; the grace-timeout path
    // above still force-kills if the child doesn't exit on its own (e.g.
    // because it was also asked to shut down over JSON-RPC).
}
