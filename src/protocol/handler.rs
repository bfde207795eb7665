//! Message Handlers
//!
//! The event loop hands every non-empty read to a single [`Handler`]. The
//! payload is borrowed from the loop's scratch buffer for the duration of
//! the call only.

use std::io::{self, ErrorKind, Write};
use std::net::{IpAddr, SocketAddr};

use tracing::{debug, warn};

use crate::connection::SlotId;

/// Callback interface driven by the event loop
///
/// Handlers run on the loop thread, so a slow handler stalls every client.
/// Replies to the calling client go out immediately through [`Client::send`];
/// bytes for other clients go through [`Client::send_to`] and are written as
/// soon as the callback returns, before the next client is read.
pub trait Handler {
    /// Called with the bytes of one read from `client`
    ///
    /// Returns the number of bytes sent back by convention. The loop logs
    /// the result and otherwise ignores it.
    fn on_message(&mut self, client: &mut Client<'_>, data: &[u8]) -> io::Result<usize>;

    /// Called once a connection has been admitted into a slot
    fn on_connect(&mut self, _client: &mut Client<'_>) {}

    /// Called after a client's slot has been freed
    fn on_disconnect(&mut self, _slot: SlotId, _peer: SocketAddr) {}
}

impl<F> Handler for F
where
    F: FnMut(&mut Client<'_>, &[u8]) -> io::Result<usize>,
{
    fn on_message(&mut self, client: &mut Client<'_>, data: &[u8]) -> io::Result<usize> {
        self(client, data)
    }
}

/// A client as seen from inside a handler callback
pub struct Client<'a> {
    slot: SlotId,
    peer: SocketAddr,
    stream: &'a mut (dyn Write + 'a),
    close_requested: bool,
    outbox: Vec<(SlotId, Vec<u8>)>,
}

impl<'a> Client<'a> {
    pub fn new(slot: SlotId, peer: SocketAddr, stream: &'a mut (dyn Write + 'a)) -> Self {
        Self {
            slot,
            peer,
            stream,
            close_requested: false,
            outbox: Vec::new(),
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn address(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn port(&self) -> u16 {
        self.peer.port()
    }

    /// Send bytes to this client
    ///
    /// Best effort: one write, no retry. Returns `true` only if every byte
    /// was accepted by the socket.
    pub fn send(&mut self, data: &[u8]) -> bool {
        send_once(&mut *self.stream, data, self.peer)
    }

    /// Raw write for handlers that want the byte count or the error
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream.write(data)
    }

    /// Queue bytes for any live client, this one included
    ///
    /// Written in call order once the callback returns, with the same
    /// best-effort semantics as [`send`](Self::send). Sends to a free slot
    /// are dropped.
    pub fn send_to(&mut self, slot: SlotId, data: &[u8]) {
        self.outbox.push((slot, data.to_vec()));
    }

    /// Sends queued by [`send_to`](Self::send_to), in call order
    pub(crate) fn take_outbox(&mut self) -> Vec<(SlotId, Vec<u8>)> {
        std::mem::take(&mut self.outbox)
    }

    /// Ask the loop to drop this client once the callback returns
    pub fn close(&mut self) {
        self.close_requested = true;
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested
    }
}

/// Single best-effort write shared by every send path
pub(crate) fn send_once<W: Write + ?Sized>(stream: &mut W, data: &[u8], peer: SocketAddr) -> bool {
    if data.is_empty() {
        return true;
    }

    match stream.write(data) {
        Ok(n) if n == data.len() => true,
        Ok(n) => {
            warn!("Short send to {}: {} of {} bytes", peer, n, data.len());
            false
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => {
            warn!("Send to {} would block, {} bytes dropped", peer, data.len());
            false
        }
        Err(e) => {
            debug!("Send to {} failed: {}", peer, e);
            false
        }
    }
}

/// Echoes every message back to its sender
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl Handler for EchoHandler {
    fn on_message(&mut self, client: &mut Client<'_>, data: &[u8]) -> io::Result<usize> {
        client.write(data)
    }
}

/// Accepts and drops every message
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardHandler;

impl Handler for DiscardHandler {
    fn on_message(&mut self, _client: &mut Client<'_>, _data: &[u8]) -> io::Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer that accepts at most `limit` bytes per call
    struct ChokedWriter {
        written: Vec<u8>,
        limit: usize,
    }

    impl Write for ChokedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.limit == 0 {
                return Err(io::Error::new(ErrorKind::WouldBlock, "full"));
            }
            let n = buf.len().min(self.limit);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_echo_handler_writes_payload() {
        let mut out: Vec<u8> = Vec::new();
        let mut client = Client::new(SlotId::new(0), peer(), &mut out);

        let sent = EchoHandler.on_message(&mut client, b"ping").unwrap();
        assert_eq!(sent, 4);
        assert!(!client.close_requested());
        assert_eq!(out, b"ping");
    }

    #[test]
    fn test_discard_handler_sends_nothing() {
        let mut out: Vec<u8> = Vec::new();
        let mut client = Client::new(SlotId::new(3), peer(), &mut out);

        assert_eq!(DiscardHandler.on_message(&mut client, b"data").unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_send_reports_short_write() {
        let mut writer = ChokedWriter {
            written: Vec::new(),
            limit: 2,
        };
        let mut client = Client::new(SlotId::new(1), peer(), &mut writer);

        assert!(!client.send(b"hello"));
        assert!(client.send(b"ok"));
        assert!(client.send(b""));
        drop(client);
        assert_eq!(writer.written, b"heok");
    }

    #[test]
    fn test_send_reports_would_block() {
        let mut writer = ChokedWriter {
            written: Vec::new(),
            limit: 0,
        };
        let mut client = Client::new(SlotId::new(1), peer(), &mut writer);
        assert!(!client.send(b"x"));
    }

    #[test]
    fn test_send_to_is_queued_in_order() {
        let mut out: Vec<u8> = Vec::new();
        let mut client = Client::new(SlotId::new(0), peer(), &mut out);

        client.send_to(SlotId::new(4), b"first");
        client.send_to(SlotId::new(0), b"self");
        assert_eq!(
            client.take_outbox(),
            vec![
                (SlotId::new(4), b"first".to_vec()),
                (SlotId::new(0), b"self".to_vec()),
            ]
        );
        assert!(client.take_outbox().is_empty());
        drop(client);
        assert!(out.is_empty());
    }

    #[test]
    fn test_closure_handler_and_close_request() {
        let mut seen = Vec::new();
        let mut handler = |client: &mut Client<'_>, data: &[u8]| -> io::Result<usize> {
            seen.push((client.slot(), client.port(), data.to_vec()));
            if data == b"quit" {
                client.close();
            }
            Ok(0)
        };

        let mut out: Vec<u8> = Vec::new();
        let mut client = Client::new(SlotId::new(2), peer(), &mut out);
        handler.on_message(&mut client, b"hello").unwrap();
        assert!(!client.close_requested());
        handler.on_message(&mut client, b"quit").unwrap();
        assert!(client.close_requested());

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (SlotId::new(2), 40000, b"hello".to_vec()));
    }
}
