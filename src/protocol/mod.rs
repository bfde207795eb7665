//! Message dispatch contract between the event loop and application code.

pub mod handler;

pub use handler::{Client, DiscardHandler, EchoHandler, Handler};
