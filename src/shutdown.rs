//! Graceful Shutdown Handling
//!
//! Listens for SIGTERM/SIGINT and asks the event loop to stop. The loop
//! notices at the top of its next iteration, closes every client and returns.

use std::time::Duration;

use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::ServerHandle;
use crate::Result;

/// Shutdown coordinator that ties OS signals to a running server
pub struct ShutdownCoordinator {
    /// Broadcast sender for other components interested in shutdown
    shutdown_tx: broadcast::Sender<()>,
    server: ServerHandle,
}

impl ShutdownCoordinator {
    pub fn new(server: ServerHandle) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            server,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C, then trigger shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }

    /// Stop the event loop and notify subscribers
    pub fn trigger(&self) {
        self.server.shutdown();

        if self.shutdown_tx.send(()).is_err() {
            debug!("No shutdown subscribers");
        }
    }

    /// Wait for the event loop task to finish, giving up after `timeout`
    pub async fn wait_for_server(
        &self,
        task: JoinHandle<Result<()>>,
        timeout: Duration,
    ) -> Result<()> {
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(anyhow::anyhow!("Event loop task failed: {}", e)),
            Err(_) => {
                warn!("Event loop did not stop within {:?}", timeout);
                Err(anyhow::anyhow!("Shutdown timeout"))
            }
        }
    }
}
