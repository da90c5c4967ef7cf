//! Resumable file transfer protocol
//!
//! Runs over an established byte stream once a connection strategy
//! succeeded. Every file is offered with a SEND header; the receiver either
//! takes the whole file or asks to resume from a verified prefix.

mod header;
mod item;
mod monitor;
mod phase;
mod receiver;
mod sender;

pub use header::*;
pub use item::*;
pub use monitor::*;
pub use phase::*;
pub use receiver::*;
pub use sender::*;
