//! tcpmux - single-threaded TCP multiplexing server
//!
//! Accepts up to `max_clients` connections and dispatches every read to a
//! built-in handler (echo or discard).

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tcpmux::config::{CliOverrides, ConfigManager, HandlerKind};
use tcpmux::protocol::{DiscardHandler, EchoHandler};
use tcpmux::{Config, ConnectionManager, Handler, ShutdownCoordinator};

/// How long to wait for the event loop after a shutdown signal
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// CLI arguments for tcpmux
#[derive(Parser, Debug)]
#[command(name = "tcpmux")]
#[command(about = "Single-threaded TCP multiplexing server")]
#[command(version)]
#[command(long_about = "
Single-threaded TCP multiplexing server

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  TCPMUX_NAME                    - Display name used in logs
  TCPMUX_BIND_ADDR               - Bind address (e.g., 0.0.0.0:8080)
  TCPMUX_MAX_PENDING_CONNECTIONS - Listen backlog
  TCPMUX_MAX_CLIENTS             - Maximum concurrent clients
  TCPMUX_BUFFER_SIZE             - Read buffer size in bytes
  TCPMUX_ACCEPT_RETRY_DELAY      - Delay after a failed accept (e.g., 50ms)
  TCPMUX_HANDLER                 - Built-in handler (echo, discard)
  TCPMUX_WELCOME_MESSAGE         - Message sent to every new client
  TCPMUX_REJECT_MESSAGE          - Message sent when the server is full
  TCPMUX_BANNED                  - Comma-separated banned addresses/networks
  TCPMUX_LOG_LEVEL               - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Bind address (overrides config file)
    #[arg(short, long, help = "Bind address (e.g., 127.0.0.1:8080)")]
    pub bind: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(short, long, help = "Port to bind to")]
    pub port: Option<u16>,

    /// Display name (overrides config file)
    #[arg(short, long, help = "Server display name")]
    pub name: Option<String>,

    /// Maximum number of concurrent clients
    #[arg(long, help = "Maximum number of concurrent clients")]
    pub max_clients: Option<usize>,

    /// Listen backlog
    #[arg(long, help = "Maximum pending connections (listen backlog)")]
    pub max_pending: Option<u32>,

    /// Buffer size in bytes
    #[arg(long, help = "Read buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Welcome message sent to every new client
    #[arg(short, long, help = "Welcome message sent to new clients")]
    pub welcome: Option<String>,

    /// Built-in message handler
    #[arg(long, help = "Message handler (echo, discard)")]
    pub handler: Option<HandlerKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(&CliOverrides {
        bind: args.bind.as_deref(),
        port: args.port,
        name: args.name.as_deref(),
        max_clients: args.max_clients,
        max_pending_connections: args.max_pending,
        buffer_size: args.buffer_size,
        welcome_message: args.welcome.as_deref(),
        handler: args.handler,
    });

    init_tracing(&args, &config)?;

    info!("Starting tcpmux v{}", env!("CARGO_PKG_VERSION"));

    // Final validation after all overrides
    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        log_summary(&config);
        return Ok(());
    }

    log_summary(&config);

    match config.server.handler {
        HandlerKind::Echo => serve(&config, EchoHandler).await,
        HandlerKind::Discard => serve(&config, DiscardHandler).await,
    }
}

/// Run the event loop on a blocking thread until a shutdown signal arrives
async fn serve<H>(config: &Config, handler: H) -> Result<()>
where
    H: Handler + Send + 'static,
{
    let mut manager = ConnectionManager::bind(config, handler)?;
    let shutdown_coordinator = ShutdownCoordinator::new(manager.handle());

    let mut server_task = tokio::task::spawn_blocking(move || manager.run());

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    tokio::select! {
        joined = &mut server_task => {
            // The loop only returns on its own after a fatal readiness error
            return match joined {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("Event loop task failed: {}", e)),
            };
        }
        signal_result = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = signal_result {
                error!("Error setting up signal handlers: {}", e);
                shutdown_coordinator.trigger();
            }
        }
    }

    info!("Initiating graceful shutdown...");
    shutdown_coordinator
        .wait_for_server(server_task, SHUTDOWN_TIMEOUT)
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn log_summary(config: &Config) {
    info!("Configuration summary:");
    info!("  Name: {}", config.server.name);
    info!("  Bind address: {}", config.server.bind_addr);
    info!("  Max clients: {}", config.server.max_clients);
    info!(
        "  Max pending connections: {}",
        config.server.max_pending_connections
    );
    info!("  Buffer size: {} bytes", config.server.buffer_size);
    info!("  Handler: {}", config.server.handler);
    info!(
        "  Welcome message: {}",
        if config.welcome.message.is_some() {
            "enabled"
        } else {
            "disabled"
        }
    );
    info!("  Banned entries: {}", config.admission.banned.len());
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, config: &Config) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level
            .as_deref()
            .unwrap_or(config.logging.level.as_str())
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
