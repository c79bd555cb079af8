//! Bluetooth Infrastructure
//!
//! Platform abstraction, wire protocol, connection lifecycle and the client
//! façade for the head-tracking service.

pub mod client;
pub mod mock;
pub mod platform;
pub mod protocol;
pub mod state_machine;

#[cfg(windows)]
pub mod winrt;
