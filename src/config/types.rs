//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub welcome: WelcomeConfig,
    pub admission: AdmissionConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Display name, used in log output
    pub name: String,
    pub bind_addr: SocketAddr,
    /// Listen backlog
    pub max_pending_connections: u32,
    /// Capacity of the client registry
    pub max_clients: usize,
    /// Scratch buffer size; one read carries at most `buffer_size - 1` bytes
    pub buffer_size: usize,
    /// Wait before retrying after a failed accept
    #[serde(with = "humantime_serde")]
    pub accept_retry_delay: Duration,
    /// Built-in handler used by the binary
    pub handler: HandlerKind,
}

/// Built-in message handlers selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    #[default]
    Echo,
    Discard,
}

impl std::str::FromStr for HandlerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "echo" => Ok(Self::Echo),
            "discard" => Ok(Self::Discard),
            other => Err(anyhow::anyhow!(
                "Unknown handler '{}', expected 'echo' or 'discard'",
                other
            )),
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Echo => f.write_str("echo"),
            Self::Discard => f.write_str("discard"),
        }
    }
}

/// Welcome message configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WelcomeConfig {
    /// Sent verbatim to every admitted connection
    pub message: Option<String>,
}

/// Admission control configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Sent to connections refused because the registry is full
    pub reject_message: Option<String>,
    /// Banned addresses or networks, e.g. "192.0.2.7" or "10.0.0.0/8"
    pub banned: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "tcpmux".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_pending_connections: 16,
            max_clients: 30,
            buffer_size: 1024,
            accept_retry_delay: Duration::from_millis(50),
            handler: HandlerKind::Echo,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
