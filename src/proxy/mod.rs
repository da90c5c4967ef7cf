//! Rendezvous proxy support
//!
//! Packet codec, the client-side init handshake used by the proxy strategies,
//! and a relay server that implements the other side of it.

mod handshake;
mod packet;
mod server;

pub use handshake::*;
pub use packet::*;
pub use server::*;
