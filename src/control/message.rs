//! Out-of-band control messages exchanged through the session layer

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Identifier of a remote party (screen name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a peer id
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The raw name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Negotiation id; doubles as the proxy cookie and file transfer cookie
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Generate a random session id
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Negotiated transport descriptor
///
/// For a direct offer, `internal_ip` is the LAN address the offering party
/// listens on and `external_ip` the address the server saw it connect from.
/// For a proxied offer, `proxy_ip` and `port` identify a relay on a
/// rendezvous proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// LAN address of the offering party
    pub internal_ip: Option<IpAddr>,
    /// Internet address of the offering party
    pub external_ip: Option<IpAddr>,
    /// Proxy hosting the relay, for proxied offers
    pub proxy_ip: Option<IpAddr>,
    /// Listening port, or relay port for proxied offers
    pub port: u16,
    /// Whether this offer points at a proxy relay
    pub proxied: bool,
}

impl ConnectionInfo {
    /// A direct offer
    pub fn direct(internal_ip: IpAddr, external_ip: Option<IpAddr>, port: u16) -> Self {
        Self {
            internal_ip: Some(internal_ip),
            external_ip,
            proxy_ip: None,
            port,
            proxied: false,
        }
    }

    /// A proxied offer
    pub fn proxied(proxy_ip: IpAddr, relay_port: u16) -> Self {
        Self {
            internal_ip: None,
            external_ip: None,
            proxy_ip: Some(proxy_ip),
            port: relay_port,
            proxied: true,
        }
    }

    /// LAN target for a direct connection
    pub fn lan_target(&self) -> Option<SocketAddr> {
        match (self.proxied, self.internal_ip) {
            (false, Some(ip)) if self.port != 0 => Some(SocketAddr::new(ip, self.port)),
            _ => None,
        }
    }

    /// Internet target for a direct connection
    pub fn internet_target(&self) -> Option<SocketAddr> {
        match (self.proxied, self.external_ip) {
            (false, Some(ip)) if self.port != 0 => Some(SocketAddr::new(ip, self.port)),
            _ => None,
        }
    }

    /// Proxy host of a proxied offer
    pub fn relay_proxy(&self) -> Option<IpAddr> {
        if self.proxied {
            self.proxy_ip
        } else {
            None
        }
    }
}

/// What an initial request offers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescription {
    /// Name of the first (or only) file
    pub name: String,
    /// Number of files in the batch
    pub file_count: u16,
    /// Sum of all file sizes
    pub total_size: u64,
}

/// Why a negotiation was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The user declined or cancelled
    Declined,
    /// No strategy could establish a connection
    ConnectionFailed,
    /// The transfer itself failed
    TransferFailed,
    /// A proposed proxy was refused by policy
    ProxyDisallowed,
}

/// Control message routed through the session layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Negotiation request; index 1 opens a negotiation, higher indices redirect it
    Request {
        session: SessionId,
        index: u32,
        info: ConnectionInfo,
        description: Option<TransferDescription>,
    },
    /// The receiving party accepted the negotiation
    Accept { session: SessionId },
    /// Either party ended the negotiation
    Reject {
        session: SessionId,
        reason: RejectReason,
    },
}

impl ControlMessage {
    /// Index of the initial request of a negotiation
    pub const INITIAL_INDEX: u32 = 1;

    /// Negotiation this message belongs to
    pub fn session(&self) -> SessionId {
        match self {
            Self::Request { session, .. } | Self::Accept { session } | Self::Reject { session, .. } => {
                *session
            }
        }
    }

    /// Whether this is the request that opens a negotiation
    pub fn is_initial_request(&self) -> bool {
        matches!(self, Self::Request { index, .. } if *index == Self::INITIAL_INDEX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_targets() {
        let lan = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        let wan = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let info = ConnectionInfo::direct(lan, Some(wan), 4443);

        assert_eq!(info.lan_target(), Some(SocketAddr::new(lan, 4443)));
        assert_eq!(info.internet_target(), Some(SocketAddr::new(wan, 4443)));
        assert_eq!(info.relay_proxy(), None);

        let relay = ConnectionInfo::proxied(wan, 9000);
        assert_eq!(relay.lan_target(), None);
        assert_eq!(relay.internet_target(), None);
        assert_eq!(relay.relay_proxy(), Some(wan));
    }

    #[test]
    fn test_missing_port_has_no_target() {
        let info = ConnectionInfo {
            internal_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ..Default::default()
        };
        assert_eq!(info.lan_target(), None);
    }

    #[test]
    fn test_message_json_shape() {
        let message = ControlMessage::Reject {
            session: SessionId(42),
            reason: RejectReason::Declined,
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"reject\""));

        let back: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session(), SessionId(42));
        assert!(!back.is_initial_request());
    }
}
