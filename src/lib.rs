//! tcpmux
//!
//! Single-threaded TCP multiplexing server. One readiness wait covers the
//! listening socket and every connected client; each non-empty read is
//! handed to a pluggable [`Handler`].

pub mod config;
pub mod connection;
pub mod protocol;
pub mod security;
pub mod shutdown;

pub use config::Config;
pub use connection::{ConnectionManager, ServerHandle, SlotId};
pub use protocol::{Client, Handler};
pub use shutdown::ShutdownCoordinator;

/// Common error type for the server
pub type Result<T> = anyhow::Result<T>;
