//! Bridge configuration: `bridge.toml` on disk, overridable by the
//! `BRIDGE_CONFIG` environment variable, deserialised with `serde` +
//! `toml`. A plain `serde`-derived config struct with
//! `#[serde(default = ...)]` field defaults rather than a separate builder
//! type.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::BridgeError;

/// Default cap on a single POST body: 10 MiB.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Argv of the child; element 0 is the program.
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    #[serde(default = "default_sse_heartbeat_secs")]
    pub sse_heartbeat_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

fn default_address() -> String {
    ":8080".to_string()
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_write_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_max_request_size() -> usize {
    DEFAULT_MAX_REQUEST_SIZE
}

fn default_sse_heartbeat_secs() -> u64 {
    15
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

impl BridgeConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Zero disables the heartbeat ticker entirely.
    pub fn sse_heartbeat_interval(&self) -> Option<Duration> {
        if self.sse_heartbeat_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.sse_heartbeat_secs))
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Resolves `address` to a bindable [`SocketAddr`]. A bare `:PORT` (Go
    /// convention, carried over from the source config shape) binds every
    /// interface; anything else is resolved the ordinary way.
    pub fn socket_addr(&self) -> Result<SocketAddr, BridgeError> {
        let resolvable = match self.address.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.address.clone(),
        };
        resolvable
            .to_socket_addrs()
            .map_err(|source| BridgeError::AddressParse {
                address: self.address.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| BridgeError::AddressParse {
                address: self.address.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "address resolved to no candidates",
                ),
            })
    }
}

/// Loads configuration from the path named by `BRIDGE_CONFIG`, falling back
/// to `./bridge.toml` if present, and failing only if an explicit path was
/// given and couldn't be read or parsed.
pub fn load(explicit_path: Option<&Path>) -> Result<BridgeConfig, crate::error::BridgeError> {
    let env_path = std::env::var("BRIDGE_CONFIG").ok().map(PathBuf::from);
    let path = explicit_path
        .map(Path::to_path_buf)
        .or(env_path)
        .unwrap_or_else(|| PathBuf::from("bridge.toml"));

    if !path.exists() {
        return Err(crate::error::BridgeError::ConfigRead {
            path,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
        });
    }

    let contents =
        std::fs::read_to_string(&path).map_err(|source| crate::error::BridgeError::ConfigRead {
            path: path.clone(),
            source,
        })?;
    toml::from_str(&contents).map_err(|source| crate::error::BridgeError::ConfigParse { path, source })
}
