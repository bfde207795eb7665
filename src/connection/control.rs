//! Cross-thread control of a running event loop
//!
//! Commands are queued and the poll is woken; the loop applies them at the
//! top of its next iteration, so nothing touches loop state concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use mio::Waker;
use tracing::{debug, warn};

use super::registry::SlotId;
use super::stats::{ConnectionStats, StatsRecorder};
use crate::security::BanEntry;

/// Requests applied by the event loop between iterations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    SetWelcomeMessage(Option<String>),
    SendToClient { slot: SlotId, data: Vec<u8> },
    DropClient(SlotId),
    Ban {
        entry: BanEntry,
        duration: Option<Duration>,
    },
    Unban(BanEntry),
    BanClient(SlotId),
}

/// Cloneable handle for controlling a `ConnectionManager` from other threads
#[derive(Clone)]
pub struct ServerHandle {
    commands: Sender<ControlCommand>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<StatsRecorder>,
}

impl ServerHandle {
    /// Replace (or clear) the welcome message for future connections
    pub fn set_welcome_message(&self, message: Option<String>) -> bool {
        self.submit(ControlCommand::SetWelcomeMessage(message))
    }

    /// Queue bytes for a client; delivery is best effort
    pub fn send_to_client(&self, slot: SlotId, data: impl Into<Vec<u8>>) -> bool {
        self.submit(ControlCommand::SendToClient {
            slot,
            data: data.into(),
        })
    }

    /// Forcibly free a slot and close its socket
    pub fn drop_client(&self, slot: SlotId) -> bool {
        self.submit(ControlCommand::DropClient(slot))
    }

    pub fn ban(&self, entry: BanEntry) -> bool {
        self.submit(ControlCommand::Ban {
            entry,
            duration: None,
        })
    }

    pub fn ban_for(&self, entry: BanEntry, duration: Duration) -> bool {
        self.submit(ControlCommand::Ban {
            entry,
            duration: Some(duration),
        })
    }

    pub fn unban(&self, entry: BanEntry) -> bool {
        self.submit(ControlCommand::Unban(entry))
    }

    /// Ban a client's address and drop every client connected from it
    pub fn ban_client(&self, slot: SlotId) -> bool {
        self.submit(ControlCommand::BanClient(slot))
    }

    /// Ask the loop to stop; observed at the top of the next iteration
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            debug!("Shutdown requested");
        }
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake event loop for shutdown: {}", e);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.snapshot()
    }

    fn submit(&self, command: ControlCommand) -> bool {
        if self.commands.send(command).is_err() {
            debug!("Event loop has stopped, control command dropped");
            return false;
        }
        match self.waker.wake() {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to wake event loop: {}", e);
                false
            }
        }
    }
}

/// Loop-side end of the control channel
pub(crate) struct ControlQueue {
    receiver: Receiver<ControlCommand>,
    shutdown: Arc<AtomicBool>,
}

impl ControlQueue {
    pub(crate) fn new(waker: Arc<Waker>, stats: Arc<StatsRecorder>) -> (Self, ServerHandle) {
        let (commands, receiver) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = ServerHandle {
            commands,
            waker,
            shutdown: Arc::clone(&shutdown),
            stats,
        };
        (Self { receiver, shutdown }, handle)
    }

    /// Commands queued since the last call, in submission order
    pub(crate) fn drain(&self) -> Vec<ControlCommand> {
        self.receiver.try_iter().collect()
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
