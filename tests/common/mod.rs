//! Shared helpers for driving a loopback server from integration tests

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tcpmux::connection::ConnectionStats;
use tcpmux::{Client, Config, ConnectionManager, Handler, ServerHandle, SlotId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Loopback configuration on an ephemeral port
pub fn test_config(max_clients: usize, buffer_size: usize) -> Config {
    let mut config = Config::default();
    config.server.name = "test".to_string();
    config.server.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.server.max_clients = max_clients;
    config.server.buffer_size = buffer_size;
    config
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect(SlotId, SocketAddr),
    Message(SlotId, Vec<u8>),
    Disconnect(SlotId),
}

/// Echo handler that records every callback
///
/// A message starting with "quit" closes the client instead of echoing.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn connected_slots(&self) -> Vec<SlotId> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Connect(slot, _) => Some(slot),
                _ => None,
            })
            .collect()
    }

    /// Bytes received from `slot`, in dispatch order
    pub fn messages_from(&self, slot: SlotId) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Message(s, data) if s == slot => Some(data),
                _ => None,
            })
            .collect()
    }

    /// Wait until `count` connections have been admitted
    pub async fn wait_for_connects(&self, count: usize) -> Vec<SlotId> {
        let deadline = Instant::now() + IO_TIMEOUT;
        loop {
            let slots = self.connected_slots();
            if slots.len() >= count {
                return slots;
            }
            assert!(
                Instant::now() < deadline,
                "expected {} connects, saw {:?}",
                count,
                self.events()
            );
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl Handler for Recorder {
    fn on_message(&mut self, client: &mut Client<'_>, data: &[u8]) -> io::Result<usize> {
        self.push(Event::Message(client.slot(), data.to_vec()));
        if data.starts_with(b"quit") {
            client.close();
            return Ok(0);
        }
        client.write(data)
    }

    fn on_connect(&mut self, client: &mut Client<'_>) {
        self.push(Event::Connect(client.slot(), client.peer_addr()));
    }

    fn on_disconnect(&mut self, slot: SlotId, _peer: SocketAddr) {
        self.push(Event::Disconnect(slot));
    }
}

/// A server running on a blocking task
pub struct TestServer<H> {
    pub addr: SocketAddr,
    pub handle: ServerHandle,
    task: JoinHandle<tcpmux::Result<ConnectionManager<H>>>,
}

impl<H: Handler + Send + 'static> TestServer<H> {
    pub fn start(config: &Config, handler: H) -> Self {
        let mut manager = ConnectionManager::bind(config, handler).unwrap();
        let addr = manager.local_addr();
        let handle = manager.handle();

        let task = tokio::task::spawn_blocking(move || {
            manager.run()?;
            Ok(manager)
        });

        Self { addr, handle, task }
    }

    pub async fn connect(&self) -> TcpStream {
        timeout(IO_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .expect("connect timed out")
            .expect("connect failed")
    }

    /// Wait until the server's counters satisfy `condition`
    pub async fn wait_for_stats<F>(&self, condition: F) -> ConnectionStats
    where
        F: Fn(&ConnectionStats) -> bool,
    {
        let deadline = Instant::now() + IO_TIMEOUT;
        loop {
            let stats = self.handle.stats();
            if condition(&stats) {
                return stats;
            }
            assert!(Instant::now() < deadline, "stats never matched: {:?}", stats);
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop the loop and take the manager back
    pub async fn stop(self) -> ConnectionManager<H> {
        self.handle.shutdown();
        timeout(IO_TIMEOUT, self.task)
            .await
            .expect("event loop did not stop")
            .expect("event loop task panicked")
            .expect("event loop failed")
    }
}

pub async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(IO_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    buf
}

pub async fn send(stream: &mut TcpStream, data: &[u8]) {
    timeout(IO_TIMEOUT, stream.write_all(data))
        .await
        .expect("write timed out")
        .expect("write failed");
}

/// Send `data` and read back the same number of bytes
pub async fn round_trip(stream: &mut TcpStream, data: &[u8]) -> Vec<u8> {
    send(stream, data).await;
    read_exact(stream, data.len()).await
}

/// The server closed this connection (orderly close or reset)
pub async fn expect_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    match timeout(IO_TIMEOUT, stream.read(&mut buf))
        .await
        .expect("timed out waiting for close")
    {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected close, got {:?}", &buf[..n]),
    }
}
