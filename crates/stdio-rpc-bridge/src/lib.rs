#![forbid(unsafe_code)]
//! Bridges a child process that speaks newline-delimited JSON-RPC 2.0 over
//! its stdio to HTTP: `POST /message` for request/response, `GET /sse` for
//! the full duplex stream (including messages the child emits
//! unprompted), `GET /health` for liveness.
//!
//! [`Bridge`] is the entry point: construct it from a [`BridgeConfig`],
//! call [`Bridge::start`] to spawn the child and run the `initialize`
//! handshake, then either embed [`http::router`] in a larger `axum` app or
//! serve it directly (see the `bridge-server` binary). Call
//! [`Bridge::shutdown`] to drain in-flight work and stop the child.

mod broadcaster;
mod clock;
pub mod config;
pub mod correlator;
pub mod counters;
pub mod error;
pub mod frame;
mod framing;
pub mod http;
pub mod lifecycle;
mod process;
mod stdin_writer;
mod stdout_pump;

pub use broadcaster::{ClientEvent, ClientId};
pub use config::BridgeConfig;
pub use error::{BridgeError, RpcErrorKind};
pub use frame::{Frame, FrameKind, RequestId, RpcError};
pub use lifecycle::{Bridge, BridgeState, ChildExit, ExitCallback};
