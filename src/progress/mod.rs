//! Progress reporting module
//!
//! Renders the events of a rendezvous connection as terminal progress bars
//! with throughput and ETA display.

mod reporter;

pub use reporter::*;
