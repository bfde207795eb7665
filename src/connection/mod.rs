//! Connection Management Module
//!
//! Client slot bookkeeping and the event loop that drives it.

pub mod control;
pub mod manager;
pub mod registry;
pub mod stats;

pub use control::{ControlCommand, ServerHandle};
pub use manager::ConnectionManager;
pub use registry::{ClientInfo, Registry, SlotEntry, SlotId};
pub use stats::{ConnectionStats, StatsRecorder};
