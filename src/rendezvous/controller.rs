//! Controller trait and the pieces controllers are built from

use super::{ControllerKind, RvEvent};
use crate::config::{RendezvousConfig, TimeoutKind};
use crate::control::{ConnectionInfo, PeerId, SessionId};
use crate::error::{Result, RendezvousError};
use crate::stream::{ByteStream, SocketFactory, StreamCanceller};
use crate::transfer::{TransferMonitor, TransferSummary};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Terminal result of one controller run
#[derive(Debug)]
pub enum ControllerResult {
    /// A strategy established the byte stream
    Connected(ByteStream),
    /// The transfer phase completed
    Completed(TransferSummary),
    /// The controller failed with this event
    Failed(RvEvent),
}

/// One attempt at a phase of the negotiation
///
/// A controller is created fresh per attempt and runs once on its own
/// thread. The result of the previous controller is handed to `run`, which is
/// how the transfer phase receives the established stream.
pub trait Controller: Send + Sync {
    /// What this controller does
    fn kind(&self) -> ControllerKind;

    /// Stop flag shared with the engine and the timeout service
    fn signal(&self) -> &ControlSignal;

    /// Run to completion
    fn run(&self, ctx: &ControllerContext, previous: Option<ControllerResult>) -> ControllerResult;

    /// Ask the controller to stop; blocked I/O is aborted
    fn stop(&self) {
        self.signal().stop(StopReason::Stopped);
    }

    /// Deadline class, if this controller is timed
    fn timeout_kind(&self) -> Option<TimeoutKind> {
        match self.kind() {
            ControllerKind::Strategy(strategy) => Some(strategy.timeout_kind()),
            ControllerKind::Sender | ControllerKind::Receiver => None,
        }
    }
}

/// Why a controller was stopped
#[derive(Debug, Clone)]
pub enum StopReason {
    /// Superseded or cancelled by the engine
    Stopped,
    /// Its deadline passed
    TimedOut(Duration),
    /// The engine failed it with this error
    Aborted(Arc<RendezvousError>),
}

const RUNNING: u8 = 0;
const STOPPED: u8 = 1;
const SETTLED: u8 = 2;

#[derive(Default)]
struct SignalState {
    phase: AtomicU8,
    reason: Mutex<Option<StopReason>>,
    cancellers: Mutex<Vec<StreamCanceller>>,
}

/// Cooperative cancellation shared by a controller, the engine and its deadline
///
/// Stopping shuts down every attached stream so blocked reads and writes
/// return. A controller that has produced its result calls
/// [`settle`](Self::settle); a late deadline can no longer stop it after that,
/// but an explicit stop still can.
#[derive(Clone, Default)]
pub struct ControlSignal {
    state: Arc<SignalState>,
}

impl ControlSignal {
    /// A running signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the controller; returns false if it was already stopped, or
    /// already settled and `reason` is a deadline
    pub fn stop(&self, reason: StopReason) -> bool {
        {
            let mut slot = lock(&self.state.reason);
            match self.state.phase.load(Ordering::SeqCst) {
                STOPPED => return false,
                SETTLED if matches!(reason, StopReason::TimedOut(_)) => return false,
                _ => {}
            }
            *slot = Some(reason);
            self.state.phase.store(STOPPED, Ordering::SeqCst);
        }

        for canceller in lock(&self.state.cancellers).iter() {
            canceller.cancel();
        }
        true
    }

    /// Mark the controller's result as produced; false if it was stopped first
    pub fn settle(&self) -> bool {
        let _slot = lock(&self.state.reason);
        match self.state.phase.load(Ordering::SeqCst) {
            STOPPED => false,
            _ => {
                self.state.phase.store(SETTLED, Ordering::SeqCst);
                true
            }
        }
    }

    /// Whether the controller was told to stop
    pub fn is_stopped(&self) -> bool {
        self.state.phase.load(Ordering::SeqCst) == STOPPED
    }

    /// Why the controller was stopped
    pub fn reason(&self) -> Option<StopReason> {
        lock(&self.state.reason).clone()
    }

    /// Abort `canceller`'s stream when this signal stops
    pub fn attach(&self, canceller: StreamCanceller) {
        lock(&self.state.cancellers).push(canceller.clone());
        if self.is_stopped() {
            canceller.cancel();
        }
    }

    /// `Err(Cancelled)` once stopped
    pub fn check(&self) -> Result<()> {
        if self.is_stopped() {
            Err(RendezvousError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for ControlSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSignal")
            .field("phase", &self.state.phase.load(Ordering::SeqCst))
            .field("reason", &self.reason())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What a running controller may ask of its connection
pub(crate) trait EngineLink: Send + Sync {
    /// Deliver a progress event if `generation` is still current
    fn emit(&self, generation: u64, event: RvEvent);

    /// Send a negotiation request carrying `info`; returns its index
    fn send_request(&self, generation: u64, info: ConnectionInfo) -> Result<u32>;
}

/// Everything a controller sees of its connection
pub struct ControllerContext {
    pub(crate) peer: PeerId,
    pub(crate) session: SessionId,
    pub(crate) info: Option<ConnectionInfo>,
    pub(crate) config: Arc<RendezvousConfig>,
    pub(crate) factory: Arc<dyn SocketFactory>,
    pub(crate) deadline: Duration,
    pub(crate) generation: u64,
    pub(crate) link: Arc<dyn EngineLink>,
}

impl ControllerContext {
    /// Remote party
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Negotiation id
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Peer's transport descriptor when the controller started
    pub fn info(&self) -> Option<&ConnectionInfo> {
        self.info.as_ref()
    }

    /// Manager configuration
    pub fn config(&self) -> &RendezvousConfig {
        &self.config
    }

    /// Socket factory
    pub fn factory(&self) -> &dyn SocketFactory {
        self.factory.as_ref()
    }

    /// This controller's deadline, used as the connect timeout
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Report a progress event
    pub fn emit(&self, event: RvEvent) {
        self.link.emit(self.generation, event);
    }

    /// Send a request with our transport descriptor
    pub fn send_request(&self, info: ConnectionInfo) -> Result<u32> {
        self.link.send_request(self.generation, info)
    }

    /// Transfer monitor that reports through this context and observes `signal`
    pub fn monitor<'a>(&'a self, signal: &'a ControlSignal) -> ContextMonitor<'a> {
        ContextMonitor { ctx: self, signal }
    }
}

/// [`TransferMonitor`] backed by a controller context
pub struct ContextMonitor<'a> {
    ctx: &'a ControllerContext,
    signal: &'a ControlSignal,
}

impl TransferMonitor for ContextMonitor<'_> {
    fn emit(&self, event: RvEvent) {
        self.ctx.emit(event);
    }

    fn is_stopped(&self) -> bool {
        self.signal.is_stopped()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::control::ControlMessage;
    use crate::stream::TcpSocketFactory;

    /// Link that records events and requests
    #[derive(Default)]
    pub(crate) struct RecordingLink {
        pub(crate) events: Mutex<Vec<RvEvent>>,
        pub(crate) requests: Mutex<Vec<ControlMessage>>,
    }

    impl EngineLink for RecordingLink {
        fn emit(&self, _generation: u64, event: RvEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn send_request(&self, _generation: u64, info: ConnectionInfo) -> Result<u32> {
            let mut requests = self.requests.lock().unwrap();
            let index = requests.len() as u32 + 1;
            requests.push(ControlMessage::Request {
                session: SessionId(7),
                index,
                info,
                description: None,
            });
            Ok(index)
        }
    }

    pub(crate) fn context(
        config: RendezvousConfig,
        info: Option<ConnectionInfo>,
        link: Arc<RecordingLink>,
    ) -> ControllerContext {
        ControllerContext {
            peer: PeerId::from("peer"),
            session: SessionId(7),
            info,
            config: Arc::new(config),
            factory: Arc::new(TcpSocketFactory),
            deadline: Duration::from_secs(2),
            generation: 1,
            link,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_idempotent() {
        let signal = ControlSignal::new();
        assert!(signal.stop(StopReason::Stopped));
        assert!(!signal.stop(StopReason::Stopped));
        assert!(signal.is_stopped());
        assert!(matches!(signal.reason(), Some(StopReason::Stopped)));
        assert!(signal.check().is_err());
    }

    #[test]
    fn test_settled_ignores_deadline() {
        let signal = ControlSignal::new();
        assert!(signal.settle());
        assert!(!signal.stop(StopReason::TimedOut(Duration::from_secs(1))));
        assert!(!signal.is_stopped());

        // Explicit stops still apply
        assert!(signal.stop(StopReason::Stopped));
    }

    #[test]
    fn test_stopped_cannot_settle() {
        let signal = ControlSignal::new();
        signal.stop(StopReason::TimedOut(Duration::from_millis(5)));
        assert!(!signal.settle());
        assert!(matches!(signal.reason(), Some(StopReason::TimedOut(_))));
    }

    #[test]
    fn test_attach_after_stop_cancels() {
        use crate::transfer::test_support::socket_pair;

        let (a, _b) = socket_pair();
        let stream = ByteStream::new(a).unwrap();
        let signal = ControlSignal::new();
        signal.stop(StopReason::Stopped);
        let canceller = stream.canceller().unwrap();
        signal.attach(canceller.clone());
        assert!(canceller.is_cancelled());
    }
}
