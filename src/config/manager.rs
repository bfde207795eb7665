//! Configuration Manager

use super::{Config, HandlerKind};
use crate::security::BanEntry;
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Largest accepted scratch buffer
const MAX_BUFFER_SIZE: usize = 1024 * 1024;
const MAX_CLIENTS_LIMIT: usize = 65_536;
const MAX_BACKLOG: u32 = 65_535;
const MAX_ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        Self::load_from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the TCPMUX_* keys
    pub fn load_from_lookup<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(name) = lookup("TCPMUX_NAME") {
            config.server.name = name;
        }

        if let Some(bind_addr) = lookup("TCPMUX_BIND_ADDR") {
            config.server.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid TCPMUX_BIND_ADDR: {}", bind_addr))?;
        }

        if let Some(backlog) = lookup("TCPMUX_MAX_PENDING_CONNECTIONS") {
            config.server.max_pending_connections = backlog
                .parse::<u32>()
                .with_context(|| format!("Invalid TCPMUX_MAX_PENDING_CONNECTIONS: {}", backlog))?;
        }

        if let Some(max_clients) = lookup("TCPMUX_MAX_CLIENTS") {
            config.server.max_clients = max_clients
                .parse::<usize>()
                .with_context(|| format!("Invalid TCPMUX_MAX_CLIENTS: {}", max_clients))?;
        }

        if let Some(buffer_size) = lookup("TCPMUX_BUFFER_SIZE") {
            config.server.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid TCPMUX_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Some(delay) = lookup("TCPMUX_ACCEPT_RETRY_DELAY") {
            config.server.accept_retry_delay = humantime::parse_duration(&delay)
                .with_context(|| format!("Invalid TCPMUX_ACCEPT_RETRY_DELAY: {}", delay))?;
        }

        if let Some(handler) = lookup("TCPMUX_HANDLER") {
            config.server.handler = handler
                .parse::<HandlerKind>()
                .with_context(|| format!("Invalid TCPMUX_HANDLER: {}", handler))?;
        }

        if let Some(message) = lookup("TCPMUX_WELCOME_MESSAGE") {
            config.welcome.message = Some(message);
        }

        if let Some(message) = lookup("TCPMUX_REJECT_MESSAGE") {
            config.admission.reject_message = Some(message);
        }

        if let Some(banned) = lookup("TCPMUX_BANNED") {
            config.admission.banned = banned
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(level) = lookup("TCPMUX_LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Command-line overrides, applied on top of file/env configuration
#[derive(Debug, Clone, Default)]
pub struct CliOverrides<'a> {
    pub bind: Option<&'a str>,
    pub port: Option<u16>,
    pub name: Option<&'a str>,
    pub max_clients: Option<usize>,
    pub max_pending_connections: Option<u32>,
    pub buffer_size: Option<usize>,
    pub welcome_message: Option<&'a str>,
    pub handler: Option<HandlerKind>,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_admission_config()
            .with_context(|| "Admission configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    /// Validate server configuration
    fn validate_server_config(&self) -> Result<()> {
        if self.server.name.trim().is_empty() {
            bail!("name must not be empty");
        }

        if self.server.max_pending_connections == 0 {
            bail!("max_pending_connections must be greater than 0");
        }

        if self.server.max_pending_connections > MAX_BACKLOG {
            bail!("max_pending_connections cannot exceed {}", MAX_BACKLOG);
        }

        if self.server.max_clients == 0 {
            bail!("max_clients must be greater than 0");
        }

        if self.server.max_clients > MAX_CLIENTS_LIMIT {
            bail!("max_clients cannot exceed {}", MAX_CLIENTS_LIMIT);
        }

        // One byte of the buffer is always held back
        if self.server.buffer_size < 2 {
            bail!("buffer_size must be at least 2 bytes");
        }

        if self.server.buffer_size > MAX_BUFFER_SIZE {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.server.accept_retry_delay.is_zero() {
            bail!("accept_retry_delay must be greater than 0");
        }

        if self.server.accept_retry_delay > MAX_ACCEPT_RETRY_DELAY {
            bail!("accept_retry_delay cannot exceed {:?}", MAX_ACCEPT_RETRY_DELAY);
        }

        Ok(())
    }

    /// Validate admission configuration
    fn validate_admission_config(&self) -> Result<()> {
        self.ban_entries().map(|_| ())
    }

    /// Validate logging configuration
    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Parsed ban list entries
    pub fn ban_entries(&self) -> Result<Vec<BanEntry>> {
        self.admission
            .banned
            .iter()
            .enumerate()
            .map(|(i, raw)| {
                raw.parse::<BanEntry>()
                    .with_context(|| format!("Ban entry {} is invalid", i))
            })
            .collect()
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, overrides: &CliOverrides<'_>) {
        // Override bind address if provided
        if let Some(bind_str) = overrides.bind {
            if let Ok(addr) = bind_str.parse::<SocketAddr>() {
                self.server.bind_addr = addr;
                tracing::info!("CLI override: bind address set to {}", addr);
            } else {
                tracing::warn!("Invalid bind address provided: {}", bind_str);
            }
        }

        // Override port if provided
        if let Some(port) = overrides.port {
            self.server.bind_addr.set_port(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(name) = overrides.name {
            self.server.name = name.to_string();
            tracing::info!("CLI override: name set to {}", name);
        }

        if let Some(max_clients) = overrides.max_clients {
            self.server.max_clients = max_clients;
            tracing::info!("CLI override: max clients set to {}", max_clients);
        }

        if let Some(backlog) = overrides.max_pending_connections {
            self.server.max_pending_connections = backlog;
            tracing::info!("CLI override: max pending connections set to {}", backlog);
        }

        if let Some(buffer_size) = overrides.buffer_size {
            self.server.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if let Some(message) = overrides.welcome_message {
            self.welcome.message = Some(message.to_string());
            tracing::info!("CLI override: welcome message set");
        }

        if let Some(handler) = overrides.handler {
            self.server.handler = handler;
            tracing::info!("CLI override: handler set to {}", handler);
        }
    }
}
