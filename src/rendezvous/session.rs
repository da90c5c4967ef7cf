//! Routes inbound control messages of one negotiation to its connection

use super::RendezvousConnection;
use crate::control::{ControlMessage, PeerId};

/// Per-negotiation dispatcher for redirects, accepts and rejects
#[derive(Debug, Clone)]
pub struct RendezvousSessionHandler {
    connection: RendezvousConnection,
}

impl RendezvousSessionHandler {
    /// Create a handler feeding `connection`
    pub fn new(connection: RendezvousConnection) -> Self {
        Self { connection }
    }

    /// Connection this handler feeds
    pub fn connection(&self) -> &RendezvousConnection {
        &self.connection
    }

    /// Apply a message; returns false if it was not addressed to this negotiation
    pub fn handle(&self, from: &PeerId, message: ControlMessage) -> bool {
        if from != self.connection.peer() || message.session() != self.connection.session() {
            tracing::debug!(%from, session = %message.session(), "Message for another negotiation");
            return false;
        }

        match message {
            ControlMessage::Request { index, info, .. } => {
                tracing::debug!(%from, index, "Request received");
                self.connection.handle_request(index, info);
            }
            ControlMessage::Accept { .. } => self.connection.handle_accept(),
            ControlMessage::Reject { reason, .. } => self.connection.handle_reject(reason),
        }
        true
    }
}
