//! Connection Registry
//!
//! Fixed-capacity slot table for admitted clients. Slots are scanned in
//! ascending index order for both allocation and enumeration, and a freed
//! slot is reused in place by the next allocation.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

/// Index of a slot in the registry
///
/// This is the client reference handed to handlers and used by
/// send/drop operations. It is only meaningful while the slot is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(usize);

impl SlotId {
    /// Create a slot id from a raw index
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Raw slot index
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Peer information captured at accept time
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub peer: SocketAddr,
    pub connected_at: Instant,
}

impl ClientInfo {
    /// Peer IP address
    pub fn address(&self) -> IpAddr {
        self.peer.ip()
    }

    /// Peer source port
    pub fn port(&self) -> u16 {
        self.peer.port()
    }
}

/// An occupied slot: the owned connection plus its peer info
#[derive(Debug)]
pub struct SlotEntry<S> {
    pub conn: S,
    pub info: ClientInfo,
}

/// One entry of the slot table
#[derive(Debug)]
pub struct ClientSlot<S> {
    entry: Option<SlotEntry<S>>,
}

impl<S> ClientSlot<S> {
    fn empty() -> Self {
        Self { entry: None }
    }

    /// Whether the slot currently holds a connection
    pub fn is_occupied(&self) -> bool {
        self.entry.is_some()
    }
}

/// Bounded table of client slots
///
/// Generic over the owned connection type so the bookkeeping can be
/// exercised without real sockets.
#[derive(Debug)]
pub struct Registry<S> {
    slots: Vec<ClientSlot<S>>,
    live: usize,
}

impl<S> Registry<S> {
    /// Create a registry with `capacity` free slots
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| ClientSlot::empty()).collect();
        Self { slots, live: 0 }
    }

    /// Fixed number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn is_full(&self) -> bool {
        self.live >= self.slots.len()
    }

    pub fn has_free_slot(&self) -> bool {
        !self.is_full()
    }

    /// Place a connection in the first free slot
    ///
    /// When every slot is occupied the connection is handed back so the
    /// caller decides what to do with it.
    pub fn allocate(&mut self, conn: S, peer: SocketAddr) -> std::result::Result<SlotId, S> {
        let Some(index) = self.slots.iter().position(|slot| !slot.is_occupied()) else {
            return Err(conn);
        };

        self.slots[index].entry = Some(SlotEntry {
            conn,
            info: ClientInfo {
                peer,
                connected_at: Instant::now(),
            },
        });
        self.live += 1;
        Ok(SlotId(index))
    }

    /// Clear a slot, returning its connection for closing
    ///
    /// Freeing a slot that is already free (or out of range) is a no-op.
    pub fn free(&mut self, slot: SlotId) -> Option<SlotEntry<S>> {
        let entry = self.slots.get_mut(slot.0)?.entry.take()?;
        self.live -= 1;
        Some(entry)
    }

    /// Live slots in ascending slot order
    pub fn live_slots(&self) -> impl Iterator<Item = (SlotId, &ClientInfo)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.entry.as_ref().map(|entry| (SlotId(index), &entry.info)))
    }

    /// Snapshot of live slot ids, used as one iteration's readiness set
    pub fn live_ids(&self) -> Vec<SlotId> {
        self.live_slots().map(|(slot, _)| slot).collect()
    }

    pub fn get(&self, slot: SlotId) -> Option<&SlotEntry<S>> {
        self.slots.get(slot.0)?.entry.as_ref()
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut SlotEntry<S>> {
        self.slots.get_mut(slot.0)?.entry.as_mut()
    }

    /// Live slots whose peer IP equals `ip`
    pub fn find_by_ip(&self, ip: IpAddr) -> Vec<SlotId> {
        self.live_slots()
            .filter(|(_, info)| info.address() == ip)
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Free every slot, returning the connections in slot order
    pub fn drain(&mut self) -> Vec<(SlotId, SlotEntry<S>)> {
        let drained: Vec<_> = self
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.entry.take().map(|entry| (SlotId(index), entry)))
            .collect();
        self.live = 0;
        drained
    }
}
