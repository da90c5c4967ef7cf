//! Control channel abstraction and an in-memory implementation
//!
//! The session layer owns serialization and routing of control messages; the
//! engine only needs a way to send one. Inbound messages are handed to
//! [`ConnectionManager::handle_control_message`](crate::rendezvous::ConnectionManager::handle_control_message).

use super::{ControlMessage, PeerId};
use crate::error::{Result, RendezvousError};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Outbound side of the control-message channel
pub trait ControlChannel: Send + Sync {
    /// Deliver a message to a remote party
    fn send(&self, to: &PeerId, message: ControlMessage) -> Result<()>;
}

/// A control message together with its sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Party that sent the message
    pub from: PeerId,
    /// The message
    pub message: ControlMessage,
}

/// One end of an in-memory control channel between two local parties
#[derive(Debug, Clone)]
pub struct LoopbackChannel {
    local: PeerId,
    remote: PeerId,
    outbox: Sender<InboundMessage>,
}

/// Messages addressed to one end of a [`LoopbackChannel`] pair
#[derive(Debug)]
pub struct LoopbackInbox {
    rx: Receiver<InboundMessage>,
}

impl LoopbackChannel {
    /// Create two connected ends, one for each party
    pub fn pair(a: PeerId, b: PeerId) -> ((LoopbackChannel, LoopbackInbox), (LoopbackChannel, LoopbackInbox)) {
        let (to_a, a_rx) = unbounded();
        let (to_b, b_rx) = unbounded();

        let a_end = LoopbackChannel {
            local: a.clone(),
            remote: b.clone(),
            outbox: to_b,
        };
        let b_end = LoopbackChannel {
            local: b,
            remote: a,
            outbox: to_a,
        };

        ((a_end, LoopbackInbox { rx: a_rx }), (b_end, LoopbackInbox { rx: b_rx }))
    }

    /// Party this end sends as
    pub fn local(&self) -> &PeerId {
        &self.local
    }
}

impl ControlChannel for LoopbackChannel {
    fn send(&self, to: &PeerId, message: ControlMessage) -> Result<()> {
        if to != &self.remote {
            return Err(RendezvousError::ControlChannel(format!("no route to '{}'", to)));
        }
        tracing::trace!(from = %self.local, %to, ?message, "Control message sent");
        self.outbox
            .send(InboundMessage {
                from: self.local.clone(),
                message,
            })
            .map_err(|_| RendezvousError::ControlChannel(format!("'{}' is gone", to)))
    }
}

impl LoopbackInbox {
    /// Wait up to `timeout` for the next message
    ///
    /// Returns `Ok(None)` on timeout and an error once the sending end is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<InboundMessage>> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(RendezvousError::ControlChannel("loopback peer disconnected".to_string()))
            }
        }
    }
}

/// Channel that records everything sent through it
#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct RecordingChannel {
    sent: Sender<(PeerId, ControlMessage)>,
}

#[cfg(test)]
impl RecordingChannel {
    pub(crate) fn new() -> (Self, Receiver<(PeerId, ControlMessage)>) {
        let (sent, rx) = unbounded();
        (Self { sent }, rx)
    }
}

#[cfg(test)]
impl ControlChannel for RecordingChannel {
    fn send(&self, to: &PeerId, message: ControlMessage) -> Result<()> {
        let _ = self.sent.send((to.clone(), message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{RejectReason, SessionId};

    #[test]
    fn test_pair_routes_both_ways() {
        let ((alice, alice_inbox), (bob, bob_inbox)) =
            LoopbackChannel::pair(PeerId::from("alice"), PeerId::from("bob"));

        alice
            .send(&PeerId::from("bob"), ControlMessage::Accept { session: SessionId(1) })
            .unwrap();
        let got = bob_inbox.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(got.from, PeerId::from("alice"));
        assert_eq!(got.message.session(), SessionId(1));

        bob.send(
            &PeerId::from("alice"),
            ControlMessage::Reject {
                session: SessionId(1),
                reason: RejectReason::Declined,
            },
        )
        .unwrap();
        assert!(alice_inbox.recv_timeout(Duration::from_secs(1)).unwrap().is_some());
    }

    #[test]
    fn test_unknown_peer() {
        let ((alice, _), _) = LoopbackChannel::pair(PeerId::from("alice"), PeerId::from("bob"));
        let result = alice.send(&PeerId::from("carol"), ControlMessage::Accept { session: SessionId(1) });
        assert!(matches!(result, Err(RendezvousError::ControlChannel(_))));
    }

    #[test]
    fn test_timeout_and_disconnect() {
        let ((alice, _alice_inbox), (_bob, bob_inbox)) =
            LoopbackChannel::pair(PeerId::from("alice"), PeerId::from("bob"));

        assert!(bob_inbox.recv_timeout(Duration::from_millis(10)).unwrap().is_none());
        drop(alice);
        assert!(bob_inbox.recv_timeout(Duration::from_millis(10)).is_err());
    }
}
