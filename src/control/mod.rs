//! Control-message channel
//!
//! Negotiation requests, redirects, accepts and rejects travel out-of-band
//! through the instant-messaging session. This module defines the messages
//! and the channel seam the engine sends them through.

mod channel;
mod message;

pub use channel::*;
pub use message::*;
