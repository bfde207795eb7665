//! Connection Manager Implementation
//!
//! Single-threaded event loop: one readiness wait covers the listener and
//! every tracked client. Each iteration accepts at most one connection and
//! then performs one bounded read per readable client, in slot order.

use std::io::{self, ErrorKind, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, info_span, trace, warn};

use super::control::{ControlCommand, ControlQueue, ServerHandle};
use super::registry::{ClientInfo, Registry, SlotId};
use super::stats::{ConnectionStats, StatsRecorder};
use crate::config::Config;
use crate::protocol::handler::send_once;
use crate::protocol::{Client, Handler};
use crate::security::{BanDecision, BanEntry, BanList};
use crate::Result;

/// Client tokens are slot indices; these sit far above any slot index
const LISTENER: Token = Token(usize::MAX - 1);
const WAKER: Token = Token(usize::MAX - 2);

const MAX_EVENTS: usize = 1024;

/// Owns the listener, the client registry and the handler
pub struct ConnectionManager<H> {
    name: String,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    /// Listener may still have queued connections
    listener_ready: bool,
    accept_retry_at: Option<Instant>,
    accept_retry_delay: Duration,
    registry: Registry<TcpStream>,
    /// Per-slot flag: socket has not reported WouldBlock since its last event
    ready: Vec<bool>,
    /// Shared scratch buffer, one read in flight at a time
    buffer: Vec<u8>,
    welcome_message: Option<String>,
    reject_message: Option<String>,
    ban_list: BanList,
    handler: H,
    stats: Arc<StatsRecorder>,
    control: ControlQueue,
    handle: ServerHandle,
}

impl<H: Handler> ConnectionManager<H> {
    /// Bind the listening socket and prepare the loop
    ///
    /// Any failure here means the configuration is unusable.
    pub fn bind(config: &Config, handler: H) -> Result<Self> {
        config.validate()?;
        let server = &config.server;

        let mut listener = Self::listen(server.bind_addr, server.max_pending_connections)
            .with_context(|| format!("{}: failed to listen on {}", server.name, server.bind_addr))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to get listener local address")?;

        let poll = Poll::new().context("Failed to create poll instance")?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .context("Failed to register listener")?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).context("Failed to create waker")?);

        let stats = Arc::new(StatsRecorder::new(server.max_clients));
        let (control, handle) = ControlQueue::new(waker, Arc::clone(&stats));
        let ban_list = BanList::from_entries(config.ban_entries()?);

        Ok(Self {
            name: server.name.clone(),
            poll,
            events: Events::with_capacity((server.max_clients + 2).min(MAX_EVENTS)),
            listener,
            local_addr,
            listener_ready: false,
            accept_retry_at: None,
            accept_retry_delay: server.accept_retry_delay,
            registry: Registry::with_capacity(server.max_clients),
            ready: vec![false; server.max_clients],
            buffer: vec![0u8; server.buffer_size],
            welcome_message: config.welcome.message.clone(),
            reject_message: config.admission.reject_message.clone(),
            ban_list,
            handler,
            stats,
            control,
            handle,
        })
    }

    fn listen(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .context("Socket creation failed")?;
        socket
            .set_reuse_address(true)
            .context("Setting SO_REUSEADDR failed")?;
        socket
            .set_nonblocking(true)
            .context("Setting non-blocking mode failed")?;
        socket.bind(&addr.into()).context("Bind failed")?;
        socket
            .listen(i32::try_from(backlog).unwrap_or(i32::MAX))
            .context("Listen failed")?;

        let std_listener: std::net::TcpListener = socket.into();
        Ok(TcpListener::from_std(std_listener))
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle for controlling the loop from other threads
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.snapshot()
    }

    pub fn registry(&self) -> &Registry<TcpStream> {
        &self.registry
    }

    /// Live clients in slot order
    pub fn clients(&self) -> Vec<(SlotId, ClientInfo)> {
        self.registry
            .live_slots()
            .map(|(slot, info)| (slot, info.clone()))
            .collect()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn welcome_message(&self) -> Option<&str> {
        self.welcome_message.as_deref()
    }

    /// Replace or clear the welcome message for future connections
    pub fn set_welcome_message(&mut self, message: Option<String>) {
        match &message {
            Some(text) => info!("Welcome message set ({} bytes)", text.len()),
            None => info!("Welcome message deactivated"),
        }
        self.welcome_message = message;
    }

    pub fn set_reject_message(&mut self, message: Option<String>) {
        self.reject_message = message;
    }

    pub fn ban_list(&self) -> &BanList {
        &self.ban_list
    }

    pub fn ban(&mut self, entry: BanEntry) {
        self.ban_list.ban(entry);
    }

    pub fn ban_for(&mut self, entry: BanEntry, duration: Duration) {
        self.ban_list.ban_for(entry, duration);
    }

    pub fn unban(&mut self, entry: BanEntry) -> bool {
        self.ban_list.unban(entry)
    }

    /// Ban a client's address and drop every client connected from it
    pub fn ban_client(&mut self, slot: SlotId) -> bool {
        let Some(entry) = self.registry.get(slot) else {
            debug!("Cannot ban {}: slot is free", slot);
            return false;
        };
        let ip = entry.info.address();
        self.ban_list.ban(BanEntry::from(ip));

        for victim in self.registry.find_by_ip(ip) {
            self.release(victim, "banned");
        }
        true
    }

    /// Best-effort write of `data` to the client in `slot`
    pub fn send_to_client(&mut self, slot: SlotId, data: &[u8]) -> bool {
        match self.registry.get_mut(slot) {
            Some(entry) => send_once(&mut entry.conn, data, entry.info.peer),
            None => {
                debug!("Cannot send to {}: slot is free", slot);
                false
            }
        }
    }

    /// Forcibly free a slot and close its socket
    pub fn drop_client(&mut self, slot: SlotId) -> bool {
        self.release(slot, "dropped")
    }

    /// Stop the loop at the top of its next iteration
    pub fn request_shutdown(&self) {
        self.control.request_shutdown();
    }

    /// Run the event loop until shutdown is requested
    ///
    /// Only a failed readiness wait ends the loop with an error. Tracked
    /// clients are closed on either exit.
    pub fn run(&mut self) -> Result<()> {
        let span = info_span!("server", name = %self.name);
        let _guard = span.enter();

        info!(
            "Listening on {} (max clients: {}, buffer size: {} bytes)",
            self.local_addr,
            self.registry.capacity(),
            self.buffer.len()
        );

        let result = self.event_loop();
        if let Err(e) = &result {
            error!("Event loop failed: {:#}", e);
        }

        self.close_all();

        let stats = self.stats.snapshot();
        info!(
            "Event loop stopped: {} accepted, {} rejected (full), {} rejected (banned), {} messages, {} bytes",
            stats.total_accepted,
            stats.rejected_full,
            stats.rejected_banned,
            stats.messages_dispatched,
            stats.bytes_received
        );
        result
    }

    fn event_loop(&mut self) -> Result<()> {
        loop {
            self.apply_control_commands();

            if self.control.shutdown_requested() {
                info!("Shutdown requested, stopping event loop");
                break;
            }

            // The read phase only services clients tracked before the wait
            let readiness_set = self.registry.live_ids();

            let timeout = self.poll_timeout();
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {
                    trace!("Readiness wait interrupted, retrying");
                    continue;
                }
                Err(e) => return Err(e).context("Readiness wait failed"),
            }

            for event in self.events.iter() {
                match event.token() {
                    LISTENER => self.listener_ready = true,
                    WAKER => {}
                    Token(index) => {
                        if let Some(flag) = self.ready.get_mut(index) {
                            *flag = true;
                        }
                    }
                }
            }

            if self.listener_ready {
                self.accept_one();
            }

            self.read_phase(&readiness_set);
        }

        Ok(())
    }

    /// Block indefinitely unless some handle still has buffered work
    fn poll_timeout(&self) -> Option<Duration> {
        if self.ready.iter().any(|&ready| ready) {
            return Some(Duration::ZERO);
        }

        if self.listener_ready {
            return Some(match self.accept_retry_at {
                Some(at) => at.saturating_duration_since(Instant::now()),
                None => Duration::ZERO,
            });
        }

        None
    }

    fn apply_control_commands(&mut self) {
        for command in self.control.drain() {
            match command {
                ControlCommand::SetWelcomeMessage(message) => self.set_welcome_message(message),
                ControlCommand::SendToClient { slot, data } => {
                    self.send_to_client(slot, &data);
                }
                ControlCommand::DropClient(slot) => {
                    self.drop_client(slot);
                }
                ControlCommand::Ban {
                    entry,
                    duration: Some(duration),
                } => self.ban_for(entry, duration),
                ControlCommand::Ban {
                    entry,
                    duration: None,
                } => self.ban(entry),
                ControlCommand::Unban(entry) => {
                    self.unban(entry);
                }
                ControlCommand::BanClient(slot) => {
                    self.ban_client(slot);
                }
            }
        }

        self.ban_list.cleanup_expired();
    }

    /// Accept exactly one pending connection
    fn accept_one(&mut self) {
        if let Some(at) = self.accept_retry_at {
            if Instant::now() < at {
                return;
            }
            self.accept_retry_at = None;
        }

        let (mut stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.listener_ready = false;
                return;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => return,
            Err(e) => {
                self.schedule_accept_retry(&e);
                return;
            }
        };
        debug!("Accepted connection from {}", peer);

        // Rejected sockets are closed when `stream` drops
        if let BanDecision::Block { entry, .. } = self.ban_list.check(peer.ip()) {
            warn!("Connection from {} rejected: address banned ({})", peer, entry);
            self.stats.rejected_banned();
            return;
        }

        if self.registry.is_full() {
            warn!(
                "Client limit reached ({}), rejecting connection from {}",
                self.registry.capacity(),
                peer
            );
            if let Some(message) = &self.reject_message {
                send_once(&mut stream, message.as_bytes(), peer);
            }
            self.stats.rejected_full();
            return;
        }

        if let Some(message) = &self.welcome_message {
            if send_once(&mut stream, message.as_bytes(), peer) {
                debug!("Welcome message sent to {}", peer);
            } else {
                warn!("Failed to send welcome message to {}", peer);
            }
        }

        let slot = match self.registry.allocate(stream, peer) {
            Ok(slot) => slot,
            Err(_stream) => {
                self.stats.rejected_full();
                return;
            }
        };

        let Some(entry) = self.registry.get_mut(slot) else {
            return;
        };
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut entry.conn, Token(slot.index()), Interest::READABLE)
        {
            warn!("Failed to register connection from {}: {}", peer, e);
            self.registry.free(slot);
            return;
        }

        self.ready[slot.index()] = false;
        self.stats.client_admitted();
        debug!("New connection from {} added to the client list as {}", peer, slot);

        let mut client = Client::new(slot, peer, &mut entry.conn);
        self.handler.on_connect(&mut client);
        let close_requested = client.close_requested();
        let outbox = client.take_outbox();

        self.flush_outbox(outbox);
        if close_requested {
            self.release(slot, "closed by handler");
        }
    }

    /// A failed accept is not fatal: back off, then try the listener again
    fn schedule_accept_retry(&mut self, error: &io::Error) {
        self.stats.accept_error();
        warn!(
            "Error accepting connection: {} (retrying in {:?})",
            error, self.accept_retry_delay
        );
        self.accept_retry_at = Some(Instant::now() + self.accept_retry_delay);
    }

    /// One bounded read per readable client, ascending slot order
    fn read_phase(&mut self, readiness_set: &[SlotId]) {
        // The last byte of the scratch buffer is never filled
        let limit = self.buffer.len() - 1;

        for &slot in readiness_set {
            let index = slot.index();
            if !self.ready[index] {
                continue;
            }

            // Dropped earlier in this iteration
            let Some(entry) = self.registry.get_mut(slot) else {
                self.ready[index] = false;
                continue;
            };
            let peer = entry.info.peer;

            match entry.conn.read(&mut self.buffer[..limit]) {
                Ok(0) => {
                    self.release(slot, "peer closed");
                }
                Ok(n) => {
                    // Stays ready until a read reports WouldBlock; a FIN queued
                    // behind this data raises no new event
                    self.stats.message_dispatched(n);
                    trace!("Host {} sent {} bytes", peer, n);

                    let mut client = Client::new(slot, peer, &mut entry.conn);
                    let result = self.handler.on_message(&mut client, &self.buffer[..n]);
                    let close_requested = client.close_requested();
                    let outbox = client.take_outbox();

                    match result {
                        Ok(sent) => trace!("Handler for {} returned {}", slot, sent),
                        Err(e) => debug!("Handler for {} returned error: {}", slot, e),
                    }
                    self.flush_outbox(outbox);
                    if close_requested {
                        self.release(slot, "closed by handler");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.ready[index] = false;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("Read from {} failed: {}", peer, e);
                    self.release(slot, "read error");
                }
            }
        }
    }

    /// Deliver sends a handler queued for other clients
    fn flush_outbox(&mut self, outbox: Vec<(SlotId, Vec<u8>)>) {
        for (slot, data) in outbox {
            self.send_to_client(slot, &data);
        }
    }

    /// Free a slot, deregister and close its socket
    fn release(&mut self, slot: SlotId, reason: &str) -> bool {
        let Some(mut entry) = self.registry.free(slot) else {
            return false;
        };

        if let Err(e) = self.poll.registry().deregister(&mut entry.conn) {
            debug!("Failed to deregister {}: {}", slot, e);
        }
        if let Some(flag) = self.ready.get_mut(slot.index()) {
            *flag = false;
        }

        let peer = entry.info.peer;
        debug!(
            "Host {} disconnected from {} after {:?} ({})",
            peer,
            slot,
            entry.info.connected_at.elapsed(),
            reason
        );
        drop(entry);

        self.handler.on_disconnect(slot, peer);
        self.stats.client_removed();
        true
    }

    fn close_all(&mut self) {
        let drained = self.registry.drain();
        if !drained.is_empty() {
            info!("Closing {} tracked connections", drained.len());
        }

        for (slot, mut entry) in drained {
            if let Err(e) = self.poll.registry().deregister(&mut entry.conn) {
                debug!("Failed to deregister {}: {}", slot, e);
            }
            let peer = entry.info.peer;
            drop(entry);
            self.handler.on_disconnect(slot, peer);
            self.stats.client_removed();
        }
        self.ready.fill(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DiscardHandler;
    use std::net::TcpStream as StdTcpStream;

    const RETRY_DELAY: Duration = Duration::from_secs(5);

    /// Records disconnect callbacks
    #[derive(Default)]
    struct DisconnectLog {
        slots: Vec<SlotId>,
    }

    impl Handler for DisconnectLog {
        fn on_message(&mut self, _client: &mut Client<'_>, _data: &[u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn on_disconnect(&mut self, slot: SlotId, _peer: SocketAddr) {
            self.slots.push(slot);
        }
    }

    fn loopback<H: Handler>(max_clients: usize, handler: H) -> ConnectionManager<H> {
        let mut config = Config::default();
        config.server.bind_addr = "127.0.0.1:0".parse().unwrap();
        config.server.max_clients = max_clients;
        config.server.accept_retry_delay = RETRY_DELAY;
        ConnectionManager::bind(&config, handler).unwrap()
    }

    /// Drive the accept phase until `expected` clients are tracked
    fn accept_until<H: Handler>(manager: &mut ConnectionManager<H>, expected: usize) {
        for _ in 0..200 {
            manager.listener_ready = true;
            manager.accept_one();
            if manager.registry.len() >= expected {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("only {} clients admitted", manager.registry.len());
    }

    fn elapsed_retry() -> Option<Instant> {
        Instant::now().checked_sub(Duration::from_millis(1))
    }

    #[test]
    fn test_poll_timeout_blocks_when_idle() {
        let manager = loopback(2, DiscardHandler);
        assert_eq!(manager.poll_timeout(), None);
    }

    #[test]
    fn test_poll_timeout_zero_while_slot_ready() {
        let mut manager = loopback(2, DiscardHandler);
        manager.ready[1] = true;
        assert_eq!(manager.poll_timeout(), Some(Duration::ZERO));

        // Buffered client data is not held back by an accept retry
        manager.listener_ready = true;
        manager.accept_retry_at = Some(Instant::now() + RETRY_DELAY);
        assert_eq!(manager.poll_timeout(), Some(Duration::ZERO));
    }

    #[test]
    fn test_poll_timeout_zero_while_listener_ready() {
        let mut manager = loopback(2, DiscardHandler);
        manager.listener_ready = true;
        assert_eq!(manager.poll_timeout(), Some(Duration::ZERO));
    }

    #[test]
    fn test_poll_timeout_waits_out_accept_retry() {
        let mut manager = loopback(2, DiscardHandler);
        manager.listener_ready = true;
        manager.accept_retry_at = Some(Instant::now() + RETRY_DELAY);

        let timeout = manager.poll_timeout().unwrap();
        assert!(timeout > Duration::from_secs(4) && timeout <= RETRY_DELAY);

        manager.accept_retry_at = elapsed_retry();
        assert_eq!(manager.poll_timeout(), Some(Duration::ZERO));
    }

    #[test]
    fn test_accept_error_is_counted_and_retried() {
        let mut manager = loopback(2, DiscardHandler);
        manager.listener_ready = true;

        let error = io::Error::new(ErrorKind::Other, "too many open files");
        manager.schedule_accept_retry(&error);

        assert_eq!(manager.stats().accept_errors, 1);
        assert!(manager.listener_ready);
        let timeout = manager.poll_timeout().unwrap();
        assert!(timeout > Duration::from_secs(4) && timeout <= RETRY_DELAY);
    }

    #[test]
    fn test_accept_waits_for_retry_window() {
        let mut manager = loopback(2, DiscardHandler);
        let _client = StdTcpStream::connect(manager.local_addr()).unwrap();

        manager.listener_ready = true;
        manager.accept_retry_at = Some(Instant::now() + RETRY_DELAY);
        manager.accept_one();

        assert!(manager.registry.is_empty());
        assert!(manager.listener_ready);
        assert!(manager.accept_retry_at.is_some());
        assert_eq!(manager.stats().total_accepted, 0);

        manager.accept_retry_at = elapsed_retry();
        accept_until(&mut manager, 1);

        assert!(manager.accept_retry_at.is_none());
        assert_eq!(manager.stats().total_accepted, 1);
    }

    #[test]
    fn test_close_all_releases_every_client() {
        let mut manager = loopback(3, DisconnectLog::default());
        let mut first = StdTcpStream::connect(manager.local_addr()).unwrap();
        let _second = StdTcpStream::connect(manager.local_addr()).unwrap();
        accept_until(&mut manager, 2);
        manager.listener_ready = false;
        manager.ready[0] = true;

        manager.close_all();

        assert!(manager.registry.is_empty());
        assert_eq!(manager.stats().active_clients, 0);
        assert_eq!(manager.stats().disconnects, 2);
        assert_eq!(manager.handler().slots, vec![SlotId::new(0), SlotId::new(1)]);
        assert_eq!(manager.poll_timeout(), None);

        first.set_read_timeout(Some(RETRY_DELAY)).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(first.read(&mut buf).unwrap(), 0);
    }
}
