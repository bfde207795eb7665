//! Runtime counters for the event loop
//!
//! Counters are atomics so a `ServerHandle` on another thread can read them
//! while the loop is running.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Shared counters updated by the event loop
#[derive(Debug, Default)]
pub struct StatsRecorder {
    active_clients: AtomicUsize,
    peak_clients: AtomicUsize,
    max_clients: AtomicUsize,
    total_accepted: AtomicU64,
    rejected_full: AtomicU64,
    rejected_banned: AtomicU64,
    accept_errors: AtomicU64,
    messages_dispatched: AtomicU64,
    bytes_received: AtomicU64,
    disconnects: AtomicU64,
}

impl StatsRecorder {
    pub fn new(max_clients: usize) -> Self {
        let stats = Self::default();
        stats.max_clients.store(max_clients, Ordering::Relaxed);
        stats
    }

    /// Record a client admitted into a slot
    pub fn client_admitted(&self) {
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        let current = self.active_clients.fetch_add(1, Ordering::Relaxed) + 1;

        // Update peak clients
        let mut peak = self.peak_clients.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_clients.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => peak = x,
            }
        }
    }

    /// Record a client leaving its slot, for any reason
    pub fn client_removed(&self) {
        self.active_clients.fetch_sub(1, Ordering::Relaxed);
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected_full(&self) {
        self.rejected_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected_banned(&self) {
        self.rejected_banned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dispatched(&self, bytes: usize) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            active_clients: self.active_clients.load(Ordering::Relaxed),
            peak_clients: self.peak_clients.load(Ordering::Relaxed),
            max_clients: self.max_clients.load(Ordering::Relaxed),
            total_accepted: self.total_accepted.load(Ordering::Relaxed),
            rejected_full: self.rejected_full.load(Ordering::Relaxed),
            rejected_banned: self.rejected_banned.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }
}

/// Connection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub active_clients: usize,
    pub peak_clients: usize,
    pub max_clients: usize,
    pub total_accepted: u64,
    pub rejected_full: u64,
    pub rejected_banned: u64,
    pub accept_errors: u64,
    pub messages_dispatched: u64,
    pub bytes_received: u64,
    pub disconnects: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_tracks_high_water_mark() {
        let stats = StatsRecorder::new(4);

        stats.client_admitted();
        stats.client_admitted();
        stats.client_admitted();
        stats.client_removed();
        stats.client_removed();
        stats.client_admitted();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.active_clients, 2);
        assert_eq!(snapshot.peak_clients, 3);
        assert_eq!(snapshot.total_accepted, 4);
        assert_eq!(snapshot.disconnects, 2);
        assert_eq!(snapshot.max_clients, 4);
    }

    #[test]
    fn test_message_and_rejection_counters() {
        let stats = StatsRecorder::new(1);

        stats.message_dispatched(4);
        stats.message_dispatched(10);
        stats.rejected_full();
        stats.rejected_banned();
        stats.rejected_banned();
        stats.accept_error();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages_dispatched, 2);
        assert_eq!(snapshot.bytes_received, 14);
        assert_eq!(snapshot.rejected_full, 1);
        assert_eq!(snapshot.rejected_banned, 2);
        assert_eq!(snapshot.accept_errors, 1);
    }
}
