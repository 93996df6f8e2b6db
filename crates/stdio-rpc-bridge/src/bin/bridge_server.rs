//! The composition root: loads `bridge.toml` (or `$BRIDGE_CONFIG`),
//! initializes structured logging, constructs a [`Bridge`], and serves it
//! on a real `axum`/`hyper` listener until `Ctrl-C` or an unrecoverable
//! startup failure.
//!
//! Library consumers embedding [`stdio_rpc_bridge::http::router`] in a
//! larger `axum` app don't need this binary at all. It exists only to make
//! the bridge runnable standalone, as a thin binary over the library crate.

use std::process::ExitCode;

use stdio_rpc_bridge::lifecycle::Bridge;
use stdio_rpc_bridge::{config, http};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bridge_config = match config::load(None) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "failed to load bridge configuration");
            return ExitCode::FAILURE;
        }
    };

    let bridge = Bridge::new(bridge_config);
    bridge.set_on_process_exit(std::sync::Arc::new(|exit| {
        tracing::warn!(status = ?exit.status, "child process exited unexpectedly");
    }));

    if let Err(err) = bridge.start().await {
        tracing::error!(%err, "failed to start bridge");
        return ExitCode::FAILURE;
    }

    let addr = match bridge.config().socket_addr() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(%err, "failed to resolve listen address");
            bridge.shutdown().await;
            return ExitCode::FAILURE;
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(source) => {
            tracing::error!(%source, %addr, "failed to bind HTTP listener");
            bridge.shutdown().await;
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(%addr, pid = ?bridge.pid(), "bridge listening");

    let shutdown_bridge = bridge.clone();
    let shutdown_signal = async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, draining");
        shutdown_bridge.shutdown().await;
    };

    let app = http::router(bridge);
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
    {
        tracing::error!(%err, "HTTP server exited with an error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
