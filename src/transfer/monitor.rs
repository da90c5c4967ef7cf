//! Hooks the transfer protocol uses to report progress and observe stops

use crate::rendezvous::RvEvent;
use std::ops::ControlFlow;
use std::time::Duration;

/// Receives progress from a running transfer
pub trait TransferMonitor {
    /// Report a progress event
    fn emit(&self, event: RvEvent);

    /// Whether the transfer should stop as soon as possible
    fn is_stopped(&self) -> bool;

    /// Continue unless stopped; used as checksum progress verdict
    fn keep_going(&self) -> ControlFlow<()> {
        if self.is_stopped() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

/// Outcome of a completed transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Files transferred
    pub files: u16,
    /// Bytes that crossed the stream
    pub bytes_transferred: u64,
    /// Bytes skipped because the receiver already had them
    pub bytes_resumed: u64,
    /// Wall time of the transfer phase
    pub elapsed: Duration,
}

impl TransferSummary {
    /// Average data rate in bytes per second
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_transferred as f64 / secs
        } else {
            0.0
        }
    }
}
