//! Security Module
//!
//! Admission control applied before a connection is given a slot.

pub mod ban_list;

pub use ban_list::{BanDecision, BanEntry, BanList};
