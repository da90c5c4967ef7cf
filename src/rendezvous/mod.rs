//! Rendezvous connection engine
//!
//! A [`RendezvousConnection`] negotiates a byte stream with one remote party
//! by running connection strategies in a fixed fallback order, then runs the
//! file transfer protocol over the stream that won. The
//! [`ConnectionManager`] owns all negotiations of a process and routes
//! inbound control messages to them.

mod chain;
mod connection;
mod controller;
mod manager;
mod session;
mod state;

pub use chain::*;
pub use connection::*;
pub use controller::*;
pub use manager::*;
pub use session::*;
pub use state::*;

pub(crate) use controller::EngineLink;

#[cfg(test)]
pub(crate) use controller::test_support;
