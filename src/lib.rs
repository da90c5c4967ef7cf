//! # Rendezvous - Peer-to-Peer Connection Negotiation and File Transfer
//!
//! Rendezvous negotiates a byte-stream connection between two parties that
//! exchange control messages out-of-band, then runs a resumable file transfer
//! over whichever transport worked.
//!
//! ## Features
//!
//! - **Strategy Fallback**: Direct LAN, direct Internet, proxy relay and proxy
//!   redirect, tried in a fixed order with per-strategy deadlines
//! - **Proxy Traversal**: Relay handshake client plus a small relay server
//! - **Redirects**: Either side may point the other at a new address mid-negotiation
//! - **Resumable Transfer**: Partial files resume from a checksum-verified prefix
//! - **Cancellation**: Every blocking step can be stopped from any thread
//!
//! ## Quick Start
//!
//! ```no_run
//! use rendezvous::config::RendezvousConfig;
//! use rendezvous::control::{LoopbackChannel, PeerId};
//! use rendezvous::rendezvous::ConnectionManager;
//! use rendezvous::transfer::TransferItem;
//! use std::sync::Arc;
//!
//! let ((alice_channel, alice_inbox), (bob_channel, bob_inbox)) =
//!     LoopbackChannel::pair(PeerId::from("alice"), PeerId::from("bob"));
//!
//! let alice = Arc::new(ConnectionManager::new(RendezvousConfig::default(), Arc::new(alice_channel)).unwrap());
//! let bob = Arc::new(ConnectionManager::new(RendezvousConfig::default(), Arc::new(bob_channel)).unwrap());
//! alice.attach_inbox(alice_inbox).unwrap();
//! bob.attach_inbox(bob_inbox).unwrap();
//!
//! let items = TransferItem::collect(&["/data/report.pdf".into()]).unwrap();
//! let transfer = alice.create_outgoing_transfer(PeerId::from("bob"), items).unwrap();
//! transfer.send_request().unwrap();
//! ```
//!
//! ## Running a Proxy
//!
//! ```no_run
//! use rendezvous::proxy::ProxyServer;
//!
//! let server = ProxyServer::bind("0.0.0.0:5190".parse().unwrap(), None).unwrap();
//! server.run().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checksum;
pub mod config;
pub mod control;
pub mod error;
pub mod progress;
pub mod proxy;
pub mod rendezvous;
pub mod stream;
pub mod strategy;
pub mod timeout;
pub mod transfer;

// Re-export commonly used types
pub use config::{ProxyPolicy, RendezvousConfig};
pub use error::{Result, RendezvousError};
pub use progress::ProgressReporter;
pub use rendezvous::{ConnectionManager, ConnectionState, RendezvousConnection, RvEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use rendezvous::prelude::*;
    //! ```

    pub use crate::config::{ProxyPolicy, RendezvousConfig, TimeoutKind, TimeoutSettings};
    pub use crate::control::{ControlChannel, ControlMessage, LoopbackChannel, PeerId, SessionId};
    pub use crate::error::{Result, RendezvousError};
    pub use crate::progress::ProgressReporter;
    pub use crate::proxy::ProxyServer;
    pub use crate::rendezvous::{
        ConnectionListener, ConnectionManager, ConnectionState, IncomingFileTransfer, ManagerListener,
        OutgoingFileTransfer, RendezvousConnection, RvEvent,
    };
    pub use crate::transfer::{TransferItem, TransferSummary};
}
