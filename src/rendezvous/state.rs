//! Connection states, strategy kinds and engine events

use crate::config::TimeoutKind;
use crate::control::RejectReason;
use crate::error::RendezvousError;
use crate::transfer::TransferSummary;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle state of a rendezvous connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, negotiation not started or not yet accepted
    Waiting,
    /// Accepted; choosing a strategy
    Preparing,
    /// A connection strategy is running
    Connecting,
    /// A byte stream is established
    Connected,
    /// The transfer phase is running
    Transferring,
    /// Transfer complete
    Finished,
    /// Negotiation or transfer failed
    Failed,
}

impl ConnectionState {
    /// Whether no further transitions can happen
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Waiting => "WAITING",
            Self::Preparing => "PREPARING",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Transferring => "TRANSFERRING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Ways of establishing the byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StrategyKind {
    /// Connect to the peer's LAN address
    DirectLan,
    /// Connect to the peer's Internet address
    DirectInternet,
    /// Listen and let the peer connect to us
    Passive,
    /// Join a relay the peer set up on a proxy
    ProxyRelay,
    /// Set up a relay on our proxy and redirect the peer to it
    ProxyRedirect,
}

impl StrategyKind {
    /// Deadline class of this strategy
    pub fn timeout_kind(self) -> TimeoutKind {
        match self {
            Self::DirectLan => TimeoutKind::DirectLan,
            Self::DirectInternet => TimeoutKind::DirectInternet,
            Self::Passive => TimeoutKind::Passive,
            Self::ProxyRelay => TimeoutKind::ProxyRelay,
            Self::ProxyRedirect => TimeoutKind::ProxyRedirect,
        }
    }

    /// Whether this strategy goes through a rendezvous proxy
    pub fn is_proxied(self) -> bool {
        matches!(self, Self::ProxyRelay | Self::ProxyRedirect)
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DirectLan => "direct-lan",
            Self::DirectInternet => "direct-internet",
            Self::Passive => "passive",
            Self::ProxyRelay => "proxy-relay",
            Self::ProxyRedirect => "proxy-redirect",
        };
        f.write_str(name)
    }
}

/// What a controller does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerKind {
    /// Establishes the byte stream
    Strategy(StrategyKind),
    /// Sends files over an established stream
    Sender,
    /// Receives files over an established stream
    Receiver,
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strategy(kind) => kind.fmt(f),
            Self::Sender => f.write_str("sender"),
            Self::Receiver => f.write_str("receiver"),
        }
    }
}

/// Something observable that happened on a connection
#[derive(Debug, Clone)]
pub enum RvEvent {
    /// A strategy started connecting to `target`
    Connecting {
        strategy: StrategyKind,
        target: Option<SocketAddr>,
    },
    /// Looking up the rendezvous proxy
    ResolvingProxy { host: String },
    /// Listening for the peer (directly or on a proxy relay)
    WaitingForConnection { addr: SocketAddr },
    /// A strategy produced a byte stream
    Connected { strategy: StrategyKind },
    /// Checksumming a local file
    Checksumming { file: String, done: u64, total: u64 },
    /// File data is flowing
    TransferringFile {
        file: String,
        transferred: u64,
        total: u64,
    },
    /// One file was stored and verified
    FileComplete { file: String, size: u64 },
    /// Every file was transferred
    TransferComplete(TransferSummary),
    /// Cancelled on this side
    LocallyCancelled,
    /// A strategy ran out of time
    TimedOut {
        strategy: StrategyKind,
        after: Duration,
    },
    /// A controller failed
    StrategyFailed {
        controller: ControllerKind,
        error: Arc<RendezvousError>,
    },
    /// The peer proposed a proxy we refuse to use
    ProxyRedirectDisallowed,
    /// The peer rejected the negotiation
    RemoteRejected(RejectReason),
}

impl RvEvent {
    /// Failure event wrapping an error
    pub fn failed(controller: ControllerKind, error: RendezvousError) -> Self {
        Self::StrategyFailed {
            controller,
            error: Arc::new(error),
        }
    }

    /// Whether this event reports a failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::LocallyCancelled
                | Self::TimedOut { .. }
                | Self::StrategyFailed { .. }
                | Self::ProxyRedirectDisallowed
                | Self::RemoteRejected(_)
        )
    }

    /// Whether the engine may try another strategy after this failure
    pub fn allows_fallback(&self) -> bool {
        match self {
            Self::TimedOut { .. } => true,
            Self::StrategyFailed { error, .. } => error.is_recoverable(),
            _ => false,
        }
    }

    /// Reason sent to the peer when this failure ends the negotiation
    pub fn reject_reason(&self, during_transfer: bool) -> RejectReason {
        match self {
            Self::LocallyCancelled => RejectReason::Declined,
            Self::ProxyRedirectDisallowed => RejectReason::ProxyDisallowed,
            _ if during_transfer => RejectReason::TransferFailed,
            _ => RejectReason::ConnectionFailed,
        }
    }
}

impl fmt::Display for RvEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting {
                strategy,
                target: Some(target),
            } => write!(f, "{}: connecting to {}", strategy, target),
            Self::Connecting { strategy, target: None } => write!(f, "{}: connecting", strategy),
            Self::ResolvingProxy { host } => write!(f, "resolving proxy {}", host),
            Self::WaitingForConnection { addr } => write!(f, "waiting for peer at {}", addr),
            Self::Connected { strategy } => write!(f, "connected via {}", strategy),
            Self::Checksumming { file, done, total } => {
                write!(f, "checksumming {} ({}/{})", file, done, total)
            }
            Self::TransferringFile {
                file,
                transferred,
                total,
            } => write!(f, "transferring {} ({}/{})", file, transferred, total),
            Self::FileComplete { file, size } => write!(f, "received {} ({} bytes)", file, size),
            Self::TransferComplete(summary) => write!(
                f,
                "transfer complete: {} files, {} bytes",
                summary.files, summary.bytes_transferred
            ),
            Self::LocallyCancelled => f.write_str("cancelled locally"),
            Self::TimedOut { strategy, after } => write!(f, "{} timed out after {:?}", strategy, after),
            Self::StrategyFailed { controller, error } => write!(f, "{} failed: {}", controller, error),
            Self::ProxyRedirectDisallowed => f.write_str("proxy redirect disallowed"),
            Self::RemoteRejected(reason) => write!(f, "rejected by peer ({:?})", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Finished.is_terminal());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(!ConnectionState::Transferring.is_terminal());
    }

    #[test]
    fn test_fallback_classification() {
        let timed_out = RvEvent::TimedOut {
            strategy: StrategyKind::DirectLan,
            after: Duration::from_secs(5),
        };
        assert!(timed_out.allows_fallback());

        let io = RvEvent::failed(
            ControllerKind::Strategy(StrategyKind::DirectInternet),
            RendezvousError::Resolve("nowhere".to_string()),
        );
        assert!(io.allows_fallback());

        let policy = RvEvent::failed(
            ControllerKind::Strategy(StrategyKind::ProxyRelay),
            RendezvousError::ProxyNotTrusted,
        );
        assert!(!policy.allows_fallback());
        assert!(!RvEvent::LocallyCancelled.allows_fallback());
        assert!(!RvEvent::RemoteRejected(RejectReason::Declined).allows_fallback());
    }

    #[test]
    fn test_reject_reasons() {
        assert_eq!(RvEvent::LocallyCancelled.reject_reason(true), RejectReason::Declined);
        assert_eq!(
            RvEvent::ProxyRedirectDisallowed.reject_reason(false),
            RejectReason::ProxyDisallowed
        );
        let failed = RvEvent::failed(ControllerKind::Sender, RendezvousError::Cancelled);
        assert_eq!(failed.reject_reason(true), RejectReason::TransferFailed);
        assert_eq!(failed.reject_reason(false), RejectReason::ConnectionFailed);
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(StrategyKind::ProxyRedirect.to_string(), "proxy-redirect");
        assert_eq!(ControllerKind::Receiver.to_string(), "receiver");
        assert_eq!(StrategyKind::Passive.timeout_kind(), TimeoutKind::Passive);
    }
}
