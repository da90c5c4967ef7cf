//! Error types for the rendezvous engine
//!
//! All failures inside the engine are expressed as [`RendezvousError`]. Most of
//! them never cross the public API: controllers wrap them into failure events
//! and the engine decides whether to fall back to another strategy. The
//! [`ErrorClass`] of an error drives that decision.

use crate::control::RejectReason;
use crate::rendezvous::ConnectionState;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for rendezvous operations
#[derive(Error, Debug)]
pub enum RendezvousError {
    /// Filesystem error on a transfer item
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Socket-level failure while connecting, accepting or streaming
    #[error("Connection error to '{target}': {source}")]
    Connection {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Host name could not be resolved to an address
    #[error("Could not resolve '{0}'")]
    Resolve(String),

    /// Strategy did not produce a stream in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Controller was stopped before it finished
    #[error("Operation cancelled")]
    Cancelled,

    /// Malformed or out-of-sequence header or packet
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Redirect arrived with an index not newer than the current one
    #[error("Stale redirect: index {received} is not newer than {current}")]
    StaleRedirect { received: u32, current: u32 },

    /// Data checksum did not match the advertised value
    #[error("Checksum mismatch for '{file}': expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        file: String,
        expected: u32,
        actual: u32,
    },

    /// Rendezvous proxy answered with an error packet
    #[error("Proxy refused the request with code {0:#06x}")]
    ProxyRefused(u16),

    /// Peer asked us to use a proxy we do not trust
    #[error("Proxy redirect disallowed by local policy")]
    ProxyNotTrusted,

    /// Peer rejected the negotiation
    #[error("Rejected by peer: {0:?}")]
    RemoteRejected(RejectReason),

    /// Public API used in the wrong state
    #[error("Invalid state for {operation}: connection is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    /// Control channel could not deliver a message
    #[error("Control channel error: {0}")]
    ControlChannel(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Error taxonomy used by the strategy fallback logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Local I/O, filesystem or checksum failure
    Local,
    /// Malformed or out-of-sequence protocol data
    Protocol,
    /// Local policy violation, never retried
    Policy,
    /// Peer explicitly ended the negotiation
    Peer,
    /// Misuse of the public API
    Contract,
}

impl RendezvousError {
    /// Create a filesystem error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a socket error for the given target
    pub fn connection(target: impl ToString, source: std::io::Error) -> Self {
        Self::Connection {
            target: target.to_string(),
            source,
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a contract violation error
    pub fn invalid_state(operation: &'static str, state: ConnectionState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io { .. }
            | Self::Connection { .. }
            | Self::Resolve(_)
            | Self::Timeout(_)
            | Self::Cancelled
            | Self::ChecksumMismatch { .. }
            | Self::ProxyRefused(_)
            | Self::ControlChannel(_) => ErrorClass::Local,
            Self::Protocol(_) | Self::StaleRedirect { .. } => ErrorClass::Protocol,
            Self::ProxyNotTrusted => ErrorClass::Policy,
            Self::RemoteRejected(_) => ErrorClass::Peer,
            Self::InvalidState { .. } | Self::Config(_) => ErrorClass::Contract,
        }
    }

    /// Check if the engine may fall back to another strategy after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self.class(), ErrorClass::Local | ErrorClass::Protocol)
    }

    /// Get the path associated with this error, if any
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Io { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// Result type alias for rendezvous operations
pub type Result<T> = std::result::Result<T, RendezvousError>;

impl From<serde_json::Error> for RendezvousError {
    fn from(err: serde_json::Error) -> Self {
        RendezvousError::Config(err.to_string())
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add socket target context to an I/O error
    fn with_target(self, target: impl ToString) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| RendezvousError::io(path, e))
    }

    fn with_target(self, target: impl ToString) -> Result<T> {
        self.map_err(|e| RendezvousError::connection(target, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = RendezvousError::io("/test/path", io_err);
        assert_eq!(err.path().unwrap(), &PathBuf::from("/test/path"));
        assert_eq!(err.class(), ErrorClass::Local);
    }

    #[test]
    fn test_error_classes() {
        assert!(RendezvousError::Timeout(Duration::from_secs(3)).is_recoverable());
        assert!(RendezvousError::protocol("bad magic").is_recoverable());
        assert!(RendezvousError::StaleRedirect { received: 1, current: 2 }.is_recoverable());

        assert!(!RendezvousError::ProxyNotTrusted.is_recoverable());
        assert_eq!(RendezvousError::ProxyNotTrusted.class(), ErrorClass::Policy);

        let rejected = RendezvousError::RemoteRejected(RejectReason::Declined);
        assert!(!rejected.is_recoverable());
        assert_eq!(rejected.class(), ErrorClass::Peer);
    }

    #[test]
    fn test_with_target() {
        let result: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        let err = result.with_target("10.0.0.1:4443").unwrap_err();
        assert!(err.to_string().contains("10.0.0.1:4443"));
    }
}
