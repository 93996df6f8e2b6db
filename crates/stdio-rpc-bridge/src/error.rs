use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while constructing or driving a [`crate::Bridge`].
///
/// This is distinct from [`RpcErrorKind`], which maps to JSON-RPC error
/// codes returned to HTTP callers: most `BridgeError`s are local faults
/// (spawn failures, bind failures) that never reach a caller as an RPC
/// envelope.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("child binary `{binary}` could not be spawned: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("child stdin is unavailable")]
    StdinUnavailable,
    #[error("child stdout is unavailable")]
    StdoutUnavailable,
    #[error("child stderr is unavailable")]
    StderrUnavailable,
    #[error("child did not respond to initialize within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("child returned an error response to initialize: {0}")]
    HandshakeRejected(String),
    #[error("child exited before completing the handshake")]
    HandshakeChildExited,
    #[error("failed to bind HTTP listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bridge is already starting or running")]
    AlreadyStarted,
    #[error("failed to wait for child process: {0}")]
    Wait(#[source] std::io::Error),
    #[error("failed to read config file `{path}`: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file `{path}`: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("could not resolve listen address `{address}`: {source}")]
    AddressParse {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// The reserved server-error band this bridge allocates, per the wire
/// protocol's taxonomy. Values in -32000..-32099.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    Parse,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    Internal,
    ServerError,
    ProcessNotReady,
    ProcessClosed,
    Timeout,
    BridgeShutdown,
    RequestTooLarge,
    TooManyRequests,
    ConnectionClosed,
}

impl RpcErrorKind {
    pub fn code(self) -> i64 {
        match self {
            RpcErrorKind::Parse => -32700,
            RpcErrorKind::InvalidRequest => -32600,
            RpcErrorKind::MethodNotFound => -32601,
            RpcErrorKind::InvalidParams => -32602,
            RpcErrorKind::Internal => -32603,
            RpcErrorKind::ServerError => -32000,
            RpcErrorKind::ProcessNotReady => -32001,
            RpcErrorKind::ProcessClosed => -32002,
            RpcErrorKind::Timeout => -32003,
            RpcErrorKind::BridgeShutdown => -32004,
            RpcErrorKind::RequestTooLarge => -32005,
            RpcErrorKind::TooManyRequests => -32006,
            RpcErrorKind::ConnectionClosed => -32007,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            RpcErrorKind::Parse => "Parse error",
            RpcErrorKind::InvalidRequest => "Invalid request",
            RpcErrorKind::MethodNotFound => "Method not found",
            RpcErrorKind::InvalidParams => "Invalid params",
            RpcErrorKind::Internal => "Internal error",
            RpcErrorKind::ServerError => "Server error",
            RpcErrorKind::ProcessNotReady => "Process not ready",
            RpcErrorKind::ProcessClosed => "Process closed",
            RpcErrorKind::Timeout => "Request timeout",
            RpcErrorKind::BridgeShutdown => "Bridge is shutting down",
            RpcErrorKind::RequestTooLarge => "Request body too large",
            RpcErrorKind::TooManyRequests => "Too many requests",
            RpcErrorKind::ConnectionClosed => "Connection closed",
        }
    }
}
