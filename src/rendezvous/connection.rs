//! Rendezvous connection state engine
//!
//! One connection drives one negotiation: it runs connection strategies one
//! at a time, hands the first established stream to the transfer phase and
//! reports everything through [`ConnectionListener`]s.
//!
//! Bookkeeping happens under a single per-connection mutex. Controllers run
//! on their own threads and report one [`ControllerResult`] each; results
//! from controllers that were superseded in the meantime are dropped. Events
//! raised while a transition is in progress are queued and delivered in
//! order once it completes, never while the mutex is held.

use super::chain::{first_strategy, initial_outgoing, next_strategy, ChainPolicy};
use super::{
    ConnectionState, ControlSignal, Controller, ControllerContext, ControllerKind, ControllerResult, EngineLink,
    RvEvent, StopReason, StrategyKind,
};
use crate::config::{ProxyPolicy, RendezvousConfig, TimeoutKind, TimeoutSettings};
use crate::control::{ConnectionInfo, ControlChannel, ControlMessage, PeerId, RejectReason, SessionId, TransferDescription};
use crate::error::{Result, RendezvousError};
use crate::strategy::{DirectController, PassiveController, ProxyRedirectController, ProxyRelayController};
use crate::stream::SocketFactory;
use crate::timeout::{TimeoutHandle, TimeoutService, Timeoutable};
use crate::transfer::{FileReceiver, FileSender, ReceiveController, SendController, TransferItem};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

/// Observer of a single connection
///
/// Callbacks run on engine or controller threads with no engine lock held,
/// so they may call back into the connection.
pub trait ConnectionListener: Send + Sync {
    /// The connection moved from `old` to `new`
    fn state_changed(
        &self,
        conn: &RendezvousConnection,
        old: ConnectionState,
        new: ConnectionState,
        event: Option<&RvEvent>,
    );

    /// A progress or failure event that did not change the state
    fn event_received(&self, _conn: &RendezvousConnection, _event: &RvEvent) {}
}

/// Which way files flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// We offered the files
    Outgoing,
    /// The peer offered the files
    Incoming,
}

/// Collaborators shared by every connection of a manager
pub(crate) struct Environment {
    pub(crate) config: Arc<RendezvousConfig>,
    pub(crate) factory: Arc<dyn SocketFactory>,
    pub(crate) channel: Arc<dyn ControlChannel>,
    pub(crate) timeouts: TimeoutService,
}

/// Per-connection overrides of the manager configuration
#[derive(Debug, Clone)]
struct ConnectionSettings {
    proxy_policy: ProxyPolicy,
    proxy_trusted: bool,
    timeouts: TimeoutSettings,
}

impl ConnectionSettings {
    fn chain_policy(&self) -> ChainPolicy {
        ChainPolicy {
            proxy_policy: self.proxy_policy,
            proxy_trusted: self.proxy_trusted,
        }
    }
}

/// Negotiation properties
#[derive(Debug, Default)]
struct Properties {
    /// Peer's current transport descriptor; replaced on every redirect
    info: Option<ConnectionInfo>,
    /// Highest request index sent or received
    request_index: u32,
    /// Whether the receiving party accepted
    accepted: bool,
    /// Redirects received from the peer
    redirects: u32,
    description: Option<TransferDescription>,
    dest: Option<PathBuf>,
}

struct ActiveController {
    generation: u64,
    controller: Arc<dyn Controller>,
    timeout: Option<TimeoutHandle>,
}

impl ActiveController {
    fn halt(&self) {
        if let Some(timeout) = &self.timeout {
            timeout.cancel();
        }
        self.controller.stop();
    }
}

struct Core {
    state: ConnectionState,
    done: bool,
    started: bool,
    settings: ConnectionSettings,
    props: Properties,
    generation: u64,
    active: Option<ActiveController>,
    last_event: Option<RvEvent>,
}

impl Core {
    /// Move to a non-terminal state, returning the notice to deliver
    fn transition(&mut self, new: ConnectionState, event: Option<RvEvent>) -> Option<Notice> {
        if self.done || self.state == new {
            return None;
        }
        let old = self.state;
        self.state = new;
        Some(Notice::StateChanged { old, new, event })
    }
}

enum Notice {
    StateChanged {
        old: ConnectionState,
        new: ConnectionState,
        event: Option<RvEvent>,
    },
    Event(RvEvent),
}

#[derive(Default)]
struct EventQueue {
    pending: VecDeque<Notice>,
    depth: u32,
    flushing: bool,
}

enum Payload {
    Send(Arc<Vec<TransferItem>>),
    Receive,
}

enum Next {
    Start(Arc<dyn Controller>, Option<ControllerResult>),
    Finish(RvEvent),
    Fail(RvEvent),
}

pub(crate) struct ConnectionInner {
    peer: PeerId,
    session: SessionId,
    direction: TransferDirection,
    payload: Payload,
    env: Arc<Environment>,
    core: Mutex<Core>,
    queue: Mutex<EventQueue>,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    weak_self: Weak<ConnectionInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle on one negotiation; cheap to clone
#[derive(Clone)]
pub struct RendezvousConnection {
    inner: Arc<ConnectionInner>,
}

impl RendezvousConnection {
    fn create(
        env: Arc<Environment>,
        peer: PeerId,
        session: SessionId,
        direction: TransferDirection,
        payload: Payload,
        props: Properties,
    ) -> Self {
        let settings = ConnectionSettings {
            proxy_policy: env.config.proxy_policy,
            proxy_trusted: env.config.proxy_trusted,
            timeouts: env.config.timeouts.clone(),
        };
        let inner = Arc::new_cyclic(|weak_self| ConnectionInner {
            peer,
            session,
            direction,
            payload,
            env,
            core: Mutex::new(Core {
                state: ConnectionState::Waiting,
                done: false,
                started: false,
                settings,
                props,
                generation: 0,
                active: None,
                last_event: None,
            }),
            queue: Mutex::new(EventQueue::default()),
            listeners: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    pub(crate) fn outgoing(
        env: Arc<Environment>,
        peer: PeerId,
        session: SessionId,
        items: Arc<Vec<TransferItem>>,
    ) -> Self {
        let description = TransferDescription {
            name: items.first().map(TransferItem::display_name).unwrap_or_default(),
            file_count: items.len().min(u16::MAX as usize) as u16,
            total_size: items.iter().map(TransferItem::size).sum(),
        };
        let props = Properties {
            description: Some(description),
            ..Default::default()
        };
        Self::create(env, peer, session, TransferDirection::Outgoing, Payload::Send(items), props)
    }

    pub(crate) fn incoming(
        env: Arc<Environment>,
        peer: PeerId,
        session: SessionId,
        index: u32,
        info: ConnectionInfo,
        description: TransferDescription,
    ) -> Self {
        let props = Properties {
            info: Some(info),
            request_index: index,
            description: Some(description),
            ..Default::default()
        };
        Self::create(env, peer, session, TransferDirection::Incoming, Payload::Receive, props)
    }

    /// Remote party
    pub fn peer(&self) -> &PeerId {
        &self.inner.peer
    }

    /// Negotiation id
    pub fn session(&self) -> SessionId {
        self.inner.session
    }

    /// Which way files flow
    pub fn direction(&self) -> TransferDirection {
        self.inner.direction
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.core).state
    }

    /// Whether the connection reached FINISHED or FAILED
    pub fn is_done(&self) -> bool {
        lock(&self.inner.core).done
    }

    /// Event that ended the connection
    pub fn last_event(&self) -> Option<RvEvent> {
        lock(&self.inner.core).last_event.clone()
    }

    /// Peer's current transport descriptor
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        lock(&self.inner.core).props.info.clone()
    }

    /// Highest request index sent or received
    pub fn request_index(&self) -> u32 {
        lock(&self.inner.core).props.request_index
    }

    /// Number of redirects received
    pub fn redirect_count(&self) -> u32 {
        lock(&self.inner.core).props.redirects
    }

    /// Whether the receiving party accepted
    pub fn is_accepted(&self) -> bool {
        lock(&self.inner.core).props.accepted
    }

    /// What the initial request offered
    pub fn description(&self) -> Option<TransferDescription> {
        lock(&self.inner.core).props.description.clone()
    }

    /// Kind of the controller currently running
    pub fn current_controller(&self) -> Option<ControllerKind> {
        lock(&self.inner.core).active.as_ref().map(|a| a.controller.kind())
    }

    /// Register a listener; listeners are called in registration order
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        lock(&self.inner.listeners).push(listener);
    }

    /// Remove a previously registered listener
    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        lock(&self.inner.listeners).retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Abandon the negotiation; idempotent
    ///
    /// Sends a reject to the peer unless the connection already ended.
    pub fn cancel(&self) {
        if self.inner.set_state(ConnectionState::Failed, Some(RvEvent::LocallyCancelled)) {
            tracing::info!(peer = %self.peer(), session = %self.session(), "Connection cancelled");
        }
    }

    /// Override the proxy policy before the negotiation starts
    pub fn set_proxy_policy(&self, policy: ProxyPolicy) -> Result<()> {
        self.inner.configure("set_proxy_policy", |s| s.proxy_policy = policy)
    }

    /// Override proxy trust before the negotiation starts
    pub fn set_proxy_trusted(&self, trusted: bool) -> Result<()> {
        self.inner.configure("set_proxy_trusted", |s| s.proxy_trusted = trusted)
    }

    /// Override one strategy deadline before the negotiation starts
    pub fn set_strategy_timeout(&self, kind: TimeoutKind, deadline: Duration) -> Result<()> {
        self.inner
            .configure("set_strategy_timeout", |s| s.timeouts.set_override(kind, deadline))
    }

    /// Override the default deadline before the negotiation starts
    pub fn set_default_timeout(&self, deadline: Duration) -> Result<()> {
        self.inner.configure("set_default_timeout", |s| {
            s.timeouts.default_ms = deadline.as_millis() as u64
        })
    }

    /// Deadline that applies to `kind` on this connection
    pub fn strategy_timeout(&self, kind: TimeoutKind) -> Duration {
        lock(&self.inner.core).settings.timeouts.deadline_for(kind)
    }

    /// A redirect (or duplicate request) from the peer
    pub(crate) fn handle_request(&self, index: u32, info: ConnectionInfo) {
        self.inner.handle_request(index, info);
    }

    /// The peer accepted our request
    pub(crate) fn handle_accept(&self) {
        self.inner.handle_accept();
    }

    /// The peer rejected the negotiation
    pub(crate) fn handle_reject(&self, reason: RejectReason) {
        tracing::info!(peer = %self.peer(), session = %self.session(), ?reason, "Peer rejected");
        self.inner
            .set_state(ConnectionState::Failed, Some(RvEvent::RemoteRejected(reason)));
    }
}

impl fmt::Debug for RendezvousConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousConnection")
            .field("peer", &self.inner.peer)
            .field("session", &self.inner.session)
            .field("direction", &self.inner.direction)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for RendezvousConnection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl ConnectionInner {
    fn handle(&self) -> Option<RendezvousConnection> {
        self.weak_self.upgrade().map(|inner| RendezvousConnection { inner })
    }

    fn configure(&self, operation: &'static str, apply: impl FnOnce(&mut ConnectionSettings)) -> Result<()> {
        let mut core = lock(&self.core);
        if core.started || core.done {
            return Err(RendezvousError::invalid_state(operation, core.state));
        }
        apply(&mut core.settings);
        Ok(())
    }

    // Event queue

    fn begin_transition(&self) {
        lock(&self.queue).depth += 1;
    }

    fn end_transition(&self) {
        {
            let mut queue = lock(&self.queue);
            queue.depth = queue.depth.saturating_sub(1);
        }
        self.flush();
    }

    fn enqueue(&self, notice: Notice) {
        lock(&self.queue).pending.push_back(notice);
    }

    fn notify(&self, notice: Notice) {
        self.enqueue(notice);
        self.flush();
    }

    /// Deliver queued notices in order; only one thread delivers at a time
    fn flush(&self) {
        {
            let mut queue = lock(&self.queue);
            if queue.depth > 0 || queue.flushing {
                return;
            }
            queue.flushing = true;
        }
        let handle = self.handle();

        loop {
            let notice = {
                let mut queue = lock(&self.queue);
                if queue.depth > 0 {
                    queue.flushing = false;
                    return;
                }
                match queue.pending.pop_front() {
                    Some(notice) => notice,
                    None => {
                        queue.flushing = false;
                        return;
                    }
                }
            };

            let Some(conn) = handle.as_ref() else { continue };
            let listeners = lock(&self.listeners).clone();
            for listener in &listeners {
                match &notice {
                    Notice::StateChanged { old, new, event } => {
                        listener.state_changed(conn, *old, *new, event.as_ref())
                    }
                    Notice::Event(event) => listener.event_received(conn, event),
                }
            }
        }
    }

    // State changes

    /// Move to `new`; terminal states latch `done` and stop the controller
    ///
    /// Returns false if nothing changed.
    fn set_state(&self, new: ConnectionState, event: Option<RvEvent>) -> bool {
        if !new.is_terminal() {
            let notice = lock(&self.core).transition(new, event);
            let changed = notice.is_some();
            if let Some(notice) = notice {
                self.notify(notice);
            }
            return changed;
        }

        self.begin_transition();
        let outcome = {
            let mut core = lock(&self.core);
            if core.done {
                None
            } else {
                let old = core.state;
                core.state = new;
                core.done = true;
                core.last_event = event.clone();
                Some((old, core.active.take()))
            }
        };

        let Some((old, active)) = outcome else {
            self.end_transition();
            return false;
        };
        if let Some(active) = active {
            active.halt();
        }

        match (&new, &event) {
            (ConnectionState::Failed, Some(RvEvent::RemoteRejected(_))) => {}
            (ConnectionState::Failed, _) => {
                let during_transfer = matches!(old, ConnectionState::Connected | ConnectionState::Transferring);
                let reason = event
                    .as_ref()
                    .map(|e| e.reject_reason(during_transfer))
                    .unwrap_or(RejectReason::ConnectionFailed);
                self.send_control(ControlMessage::Reject {
                    session: self.session,
                    reason,
                });
            }
            _ => {}
        }

        match &event {
            Some(e) if new == ConnectionState::Failed => {
                tracing::warn!(peer = %self.peer, session = %self.session, %old, event = %e, "Connection failed")
            }
            _ => tracing::info!(peer = %self.peer, session = %self.session, %old, %new, "Connection ended"),
        }

        self.enqueue(Notice::StateChanged { old, new, event });
        self.end_transition();
        true
    }

    fn send_control(&self, message: ControlMessage) {
        if let Err(e) = self.env.channel.send(&self.peer, message) {
            tracing::warn!(peer = %self.peer, session = %self.session, "Control message not delivered: {}", e);
        }
    }

    // Controller chain

    fn strategy_controller(kind: StrategyKind) -> Arc<dyn Controller> {
        match kind {
            StrategyKind::DirectLan => Arc::new(DirectController::lan()),
            StrategyKind::DirectInternet => Arc::new(DirectController::internet()),
            StrategyKind::Passive => Arc::new(PassiveController::new()),
            StrategyKind::ProxyRelay => Arc::new(ProxyRelayController::new()),
            StrategyKind::ProxyRedirect => Arc::new(ProxyRedirectController::new()),
        }
    }

    fn transfer_controller(&self, dest: Option<&Path>) -> Result<Arc<dyn Controller>> {
        let config = &self.env.config;
        match &self.payload {
            Payload::Send(items) => Ok(Arc::new(SendController::new(FileSender::new(
                Arc::clone(items),
                self.session,
                config.buffer_size,
                config.progress_interval,
            )))),
            Payload::Receive => {
                let dest = dest.ok_or_else(|| RendezvousError::invalid_state("receive", ConnectionState::Connected))?;
                Ok(Arc::new(ReceiveController::new(FileReceiver::new(
                    dest,
                    self.session,
                    config.buffer_size,
                    config.progress_interval,
                ))))
            }
        }
    }

    /// Stop the current controller (if any) and start `next`
    ///
    /// With `expected` set, only proceeds if no controller has been installed
    /// since the one of that generation finished.
    fn change_controller(&self, next: Arc<dyn Controller>, previous: Option<ControllerResult>, expected: Option<u64>) {
        self.begin_transition();
        self.install(next, previous, expected);
        self.end_transition();
    }

    fn install(&self, next: Arc<dyn Controller>, previous: Option<ControllerResult>, expected: Option<u64>) {
        let kind = next.kind();
        let prepared = {
            let mut core = lock(&self.core);
            if core.done {
                tracing::debug!(peer = %self.peer, controller = %kind, "Connection done; not starting controller");
                None
            } else if expected.is_some_and(|g| g != core.generation || core.active.is_some()) {
                tracing::debug!(peer = %self.peer, controller = %kind, "Superseded before start");
                None
            } else {
                let old = core.active.take();
                core.generation += 1;
                let generation = core.generation;

                let deadline = next
                    .timeout_kind()
                    .map(|k| core.settings.timeouts.deadline_for(k))
                    .unwrap_or_else(|| core.settings.timeouts.default_timeout());
                let timeout = match kind {
                    ControllerKind::Strategy(strategy) => {
                        let target: Arc<dyn Timeoutable> = Arc::new(TimeoutTarget {
                            connection: self.weak_self.clone(),
                            generation,
                            strategy,
                            signal: next.signal().clone(),
                        });
                        // Requests we send wait for the peer to accept before the clock runs
                        let awaits_accept = matches!(strategy, StrategyKind::Passive | StrategyKind::ProxyRedirect)
                            && !core.props.accepted;
                        Some(if awaits_accept {
                            self.env.timeouts.start_paused(target, deadline)
                        } else {
                            self.env.timeouts.start(target, deadline)
                        })
                    }
                    ControllerKind::Sender | ControllerKind::Receiver => None,
                };

                core.active = Some(ActiveController {
                    generation,
                    controller: Arc::clone(&next),
                    timeout,
                });

                let state = match kind {
                    ControllerKind::Strategy(_) => ConnectionState::Connecting,
                    ControllerKind::Sender | ControllerKind::Receiver => ConnectionState::Transferring,
                };
                let notice = core.transition(state, None);

                let ctx = ControllerContext {
                    peer: self.peer.clone(),
                    session: self.session,
                    info: core.props.info.clone(),
                    config: Arc::clone(&self.env.config),
                    factory: Arc::clone(&self.env.factory),
                    deadline,
                    generation,
                    link: self.link(),
                };
                Some((old, notice, ctx))
            }
        };

        let Some((old, notice, ctx)) = prepared else {
            return;
        };
        if let Some(old) = old {
            tracing::debug!(peer = %self.peer, controller = %old.controller.kind(), "Stopping superseded controller");
            old.halt();
        }
        if let Some(notice) = notice {
            self.enqueue(notice);
        }

        let generation = ctx.generation;
        tracing::info!(
            peer = %self.peer,
            session = %self.session,
            controller = %kind,
            generation,
            deadline = ?ctx.deadline,
            "Starting controller"
        );

        let connection = self.weak_self.clone();
        let spawned = thread::Builder::new()
            .name(format!("rv-{}", kind))
            .spawn(move || {
                let result = next.run(&ctx, previous);
                if let Some(inner) = connection.upgrade() {
                    inner.controller_finished(generation, result);
                }
            });
        if let Err(e) = spawned {
            let error = RendezvousError::connection("controller thread", e);
            self.finished(generation, ControllerResult::Failed(RvEvent::failed(kind, error)));
        }
    }

    fn link(&self) -> Arc<dyn EngineLink> {
        Arc::new(Link {
            connection: self.weak_self.clone(),
        })
    }

    /// Consume the terminal result of the controller of `generation`
    fn controller_finished(&self, generation: u64, result: ControllerResult) {
        self.begin_transition();
        self.finished(generation, result);
        self.end_transition();
    }

    fn finished(&self, generation: u64, result: ControllerResult) {
        let next = {
            let mut core = lock(&self.core);
            let active = match core.active.take() {
                Some(active) if active.generation == generation && !core.done => active,
                other => {
                    core.active = other;
                    tracing::debug!(peer = %self.peer, generation, "Dropping result of superseded controller");
                    return;
                }
            };
            if let Some(timeout) = &active.timeout {
                timeout.cancel();
            }
            let kind = active.controller.kind();

            match result {
                ControllerResult::Connected(stream) => {
                    let strategy = match kind {
                        ControllerKind::Strategy(strategy) => strategy,
                        _ => StrategyKind::Passive,
                    };
                    tracing::info!(peer = %self.peer, %strategy, remote = %stream.peer_addr(), "Connected");
                    if let Some(notice) = core.transition(ConnectionState::Connected, Some(RvEvent::Connected { strategy })) {
                        self.enqueue(notice);
                    }
                    match self.transfer_controller(core.props.dest.as_deref()) {
                        Ok(controller) => Next::Start(controller, Some(ControllerResult::Connected(stream))),
                        Err(e) => Next::Fail(RvEvent::failed(kind, e)),
                    }
                }
                ControllerResult::Completed(summary) => Next::Finish(RvEvent::TransferComplete(summary)),
                ControllerResult::Failed(event) => {
                    let event = match (active.controller.signal().reason(), kind) {
                        (Some(StopReason::TimedOut(after)), ControllerKind::Strategy(strategy)) => {
                            RvEvent::TimedOut { strategy, after }
                        }
                        (Some(StopReason::Aborted(error)), _) => RvEvent::StrategyFailed { controller: kind, error },
                        _ => event,
                    };

                    let fallback = match kind {
                        ControllerKind::Strategy(strategy) if event.allows_fallback() => {
                            next_strategy(strategy, core.props.info.as_ref(), core.settings.chain_policy())
                        }
                        _ => None,
                    };
                    match fallback {
                        Some(strategy) => {
                            tracing::info!(peer = %self.peer, failed = %kind, next = %strategy, reason = %event, "Falling back");
                            self.enqueue(Notice::Event(event));
                            Next::Start(Self::strategy_controller(strategy), None)
                        }
                        None => Next::Fail(event),
                    }
                }
            }
        };

        match next {
            Next::Start(controller, previous) => self.install(controller, previous, Some(generation)),
            Next::Finish(event) => {
                self.set_state(ConnectionState::Finished, Some(event));
            }
            Next::Fail(event) => {
                self.set_state(ConnectionState::Failed, Some(event));
            }
        }
    }

    // Negotiation entry points

    fn start_outgoing(&self) -> Result<()> {
        let kind = {
            let mut core = lock(&self.core);
            if core.started || core.done {
                return Err(RendezvousError::invalid_state("send_request", core.state));
            }
            core.started = true;
            initial_outgoing(core.settings.chain_policy())
        };
        tracing::info!(peer = %self.peer, session = %self.session, strategy = %kind, "Starting outgoing negotiation");

        self.begin_transition();
        self.set_state(ConnectionState::Preparing, None);
        self.install(Self::strategy_controller(kind), None, None);
        self.end_transition();
        Ok(())
    }

    fn accept(&self, dest: PathBuf) -> Result<()> {
        let decision = {
            let mut core = lock(&self.core);
            if core.done || core.props.accepted || core.started {
                return Err(RendezvousError::invalid_state("accept", core.state));
            }
            core.started = true;
            core.props.accepted = true;
            core.props.dest = Some(dest);

            let policy = core.settings.chain_policy();
            let info = core.props.info.as_ref();
            if info.is_some_and(|i| i.proxied) && !(policy.proxy_trusted && policy.proxy_policy.allows_proxy()) {
                Err(RvEvent::ProxyRedirectDisallowed)
            } else {
                first_strategy(info, policy).ok_or_else(|| {
                    RvEvent::failed(
                        ControllerKind::Strategy(StrategyKind::DirectLan),
                        RendezvousError::protocol("No usable strategy for the offered connection"),
                    )
                })
            }
        };
        tracing::info!(peer = %self.peer, session = %self.session, "Accepted incoming negotiation");

        self.begin_transition();
        self.set_state(ConnectionState::Preparing, None);
        self.send_control(ControlMessage::Accept { session: self.session });
        match decision {
            Ok(kind) => self.install(Self::strategy_controller(kind), None, None),
            Err(event) => {
                self.set_state(ConnectionState::Failed, Some(event));
            }
        }
        self.end_transition();
        Ok(())
    }

    fn reject(&self) -> Result<()> {
        {
            let core = lock(&self.core);
            if core.done || core.props.accepted {
                return Err(RendezvousError::invalid_state("reject", core.state));
            }
        }
        self.set_state(ConnectionState::Failed, Some(RvEvent::LocallyCancelled));
        Ok(())
    }

    // Inbound control messages

    fn handle_request(&self, index: u32, info: ConnectionInfo) {
        enum Action {
            Ignore,
            Abort(Arc<dyn Controller>, RendezvousError),
            Disallow,
            Redirect(StrategyKind),
        }

        let action = {
            let mut core = lock(&self.core);
            if core.done {
                Action::Ignore
            } else if index <= core.props.request_index {
                let error = RendezvousError::StaleRedirect {
                    received: index,
                    current: core.props.request_index,
                };
                match &core.active {
                    Some(active) if matches!(active.controller.kind(), ControllerKind::Strategy(_)) => {
                        Action::Abort(Arc::clone(&active.controller), error)
                    }
                    _ => {
                        tracing::warn!(peer = %self.peer, "Ignoring {}", error);
                        Action::Ignore
                    }
                }
            } else {
                core.props.request_index = index;
                core.props.redirects += 1;
                core.props.info = Some(info.clone());
                let policy = core.settings.chain_policy();
                let strategy_running = matches!(
                    core.active.as_ref().map(|a| a.controller.kind()),
                    Some(ControllerKind::Strategy(_))
                );

                if matches!(core.state, ConnectionState::Connected | ConnectionState::Transferring) {
                    tracing::debug!(peer = %self.peer, index, "Redirect after connecting; ignored");
                    Action::Ignore
                } else if info.proxied && !(policy.proxy_trusted && policy.proxy_policy.allows_proxy()) {
                    Action::Disallow
                } else if !core.started {
                    // Not accepted yet; accept() picks the new descriptor up
                    tracing::debug!(peer = %self.peer, index, "Redirect before accept; descriptor stored");
                    Action::Ignore
                } else if !strategy_running && core.active.is_some() {
                    Action::Ignore
                } else if info.proxied {
                    Action::Redirect(StrategyKind::ProxyRelay)
                } else if policy.proxy_policy == ProxyPolicy::Only {
                    Action::Redirect(StrategyKind::ProxyRedirect)
                } else {
                    match first_strategy(Some(&info), policy) {
                        Some(strategy) => Action::Redirect(strategy),
                        None => Action::Ignore,
                    }
                }
            }
        };

        match action {
            Action::Ignore => {}
            Action::Abort(controller, error) => {
                tracing::warn!(peer = %self.peer, session = %self.session, "{}", error);
                controller.signal().stop(StopReason::Aborted(Arc::new(error)));
            }
            Action::Disallow => {
                tracing::warn!(peer = %self.peer, session = %self.session, index, "Refusing proxy redirect");
                self.set_state(ConnectionState::Failed, Some(RvEvent::ProxyRedirectDisallowed));
            }
            Action::Redirect(strategy) => {
                tracing::info!(peer = %self.peer, session = %self.session, index, %strategy, "Redirected by peer");
                self.change_controller(Self::strategy_controller(strategy), None, None);
            }
        }
    }

    fn handle_accept(&self) {
        let mut core = lock(&self.core);
        if core.done || self.direction == TransferDirection::Incoming {
            tracing::debug!(peer = %self.peer, "Ignoring accept");
            return;
        }
        if core.props.accepted {
            return;
        }
        core.props.accepted = true;
        if let Some(timeout) = core.active.as_ref().and_then(|a| a.timeout.as_ref()) {
            timeout.unpause();
        }
        drop(core);
        tracing::info!(peer = %self.peer, session = %self.session, "Peer accepted");
    }
}

/// Forwards a controller's requests to its connection
struct Link {
    connection: Weak<ConnectionInner>,
}

impl EngineLink for Link {
    fn emit(&self, generation: u64, event: RvEvent) {
        let Some(inner) = self.connection.upgrade() else { return };
        let current = {
            let core = lock(&inner.core);
            !core.done && core.active.as_ref().is_some_and(|a| a.generation == generation)
        };
        if current {
            inner.notify(Notice::Event(event));
        }
    }

    fn send_request(&self, generation: u64, info: ConnectionInfo) -> Result<u32> {
        let inner = self.connection.upgrade().ok_or(RendezvousError::Cancelled)?;
        let (index, description) = {
            let mut core = lock(&inner.core);
            if core.done || !core.active.as_ref().is_some_and(|a| a.generation == generation) {
                return Err(RendezvousError::Cancelled);
            }
            core.props.request_index += 1;
            let index = core.props.request_index;
            let description = if index == ControlMessage::INITIAL_INDEX {
                core.props.description.clone()
            } else {
                None
            };
            (index, description)
        };

        tracing::info!(peer = %inner.peer, session = %inner.session, index, proxied = info.proxied, "Sending request");
        inner.env.channel.send(
            &inner.peer,
            ControlMessage::Request {
                session: inner.session,
                index,
                info,
                description,
            },
        )?;
        Ok(index)
    }
}

/// Deadline target of one strategy run
struct TimeoutTarget {
    connection: Weak<ConnectionInner>,
    generation: u64,
    strategy: StrategyKind,
    signal: ControlSignal,
}

impl Timeoutable for TimeoutTarget {
    fn cancel_if_not_fruitful(&self, timeout: Duration) {
        if !self.signal.stop(StopReason::TimedOut(timeout)) {
            return;
        }
        let Some(inner) = self.connection.upgrade() else { return };
        tracing::info!(peer = %inner.peer, strategy = %self.strategy, ?timeout, "Strategy timed out");

        // Fall back without waiting for the controller's blocked I/O
        let generation = self.generation;
        let result = ControllerResult::Failed(RvEvent::TimedOut {
            strategy: self.strategy,
            after: timeout,
        });
        let spawned = thread::Builder::new()
            .name("rv-fallback".to_string())
            .spawn(move || inner.controller_finished(generation, result));
        if let Err(e) = spawned {
            tracing::error!("Could not start fallback thread: {}", e);
        }
    }
}

/// Negotiation we started, offering files
#[derive(Debug, Clone)]
pub struct OutgoingFileTransfer {
    connection: RendezvousConnection,
    items: Arc<Vec<TransferItem>>,
}

impl OutgoingFileTransfer {
    pub(crate) fn new(connection: RendezvousConnection, items: Arc<Vec<TransferItem>>) -> Self {
        Self { connection, items }
    }

    /// Start the negotiation; may only be called once
    pub fn send_request(&self) -> Result<()> {
        self.connection.inner.start_outgoing()
    }

    /// Files offered
    pub fn items(&self) -> &[TransferItem] {
        &self.items
    }

    /// Underlying connection
    pub fn connection(&self) -> &RendezvousConnection {
        &self.connection
    }
}

/// Negotiation the peer started
#[derive(Debug, Clone)]
pub struct IncomingFileTransfer {
    connection: RendezvousConnection,
}

impl IncomingFileTransfer {
    pub(crate) fn new(connection: RendezvousConnection) -> Self {
        Self { connection }
    }

    /// Accept and store the files under `dest`
    pub fn accept(&self, dest: impl Into<PathBuf>) -> Result<()> {
        self.connection.inner.accept(dest.into())
    }

    /// Decline the offer
    pub fn reject(&self) -> Result<()> {
        self.connection.inner.reject()
    }

    /// What the peer offered
    pub fn description(&self) -> Option<TransferDescription> {
        self.connection.description()
    }

    /// Underlying connection
    pub fn connection(&self) -> &RendezvousConnection {
        &self.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::RecordingChannel;
    use crate::stream::TcpSocketFactory;
    use std::io;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
    use std::time::Instant;

    /// Every connection attempt hangs for a while, then times out
    #[derive(Debug)]
    struct Hanging;

    impl SocketFactory for Hanging {
        fn connect(&self, _addr: SocketAddr, _timeout: Duration) -> io::Result<TcpStream> {
            thread::sleep(Duration::from_millis(500));
            Err(io::Error::new(io::ErrorKind::TimedOut, "unreachable"))
        }

        fn listen(&self, addr: SocketAddr) -> io::Result<TcpListener> {
            TcpSocketFactory.listen(addr)
        }
    }

    fn environment(factory: Arc<dyn SocketFactory>) -> Arc<Environment> {
        let (channel, _sent) = RecordingChannel::new();
        Arc::new(Environment {
            config: Arc::new(RendezvousConfig::default()),
            factory,
            channel: Arc::new(channel),
            timeouts: TimeoutService::new(),
        })
    }

    fn lan(last: u8, port: u16) -> ConnectionInfo {
        ConnectionInfo::direct(IpAddr::V4(Ipv4Addr::new(10, 255, 0, last)), None, port)
    }

    fn offered(env: Arc<Environment>, info: ConnectionInfo) -> RendezvousConnection {
        let description = TransferDescription {
            name: "a.txt".to_string(),
            file_count: 1,
            total_size: 1,
        };
        RendezvousConnection::incoming(env, PeerId::from("bob"), SessionId(3), 1, info, description)
    }

    #[test]
    fn test_settings_before_start() {
        let conn = offered(environment(Arc::new(Hanging)), lan(1, 4000));
        conn.set_strategy_timeout(TimeoutKind::DirectLan, Duration::from_millis(750))
            .unwrap();
        conn.set_default_timeout(Duration::from_secs(9)).unwrap();

        assert_eq!(conn.strategy_timeout(TimeoutKind::DirectLan), Duration::from_millis(750));
        assert_eq!(conn.strategy_timeout(TimeoutKind::ProxyRelay), Duration::from_secs(9));
        assert_eq!(conn.state(), ConnectionState::Waiting);
        assert_eq!(conn.direction(), TransferDirection::Incoming);
    }

    #[test]
    fn test_redirect_before_accept_replaces_offer() {
        let conn = offered(environment(Arc::new(Hanging)), lan(1, 4000));
        conn.handle_request(2, lan(2, 5000));

        assert_eq!(conn.connection_info(), Some(lan(2, 5000)));
        assert_eq!(conn.request_index(), 2);
        assert_eq!(conn.state(), ConnectionState::Waiting);
        assert_eq!(conn.current_controller(), None);
    }

    #[test]
    fn test_newer_redirect_supersedes_running_strategy() {
        let conn = offered(environment(Arc::new(Hanging)), lan(1, 4000));
        IncomingFileTransfer::new(conn.clone()).accept("/tmp").unwrap();
        let first = lock(&conn.inner.core).generation;

        conn.handle_request(2, lan(2, 5000));
        conn.handle_request(3, lan(3, 6000));

        assert_eq!(lock(&conn.inner.core).generation, first + 2);
        assert_eq!(conn.redirect_count(), 2);
        assert_eq!(conn.connection_info(), Some(lan(3, 6000)));
        assert_eq!(
            conn.current_controller(),
            Some(ControllerKind::Strategy(StrategyKind::DirectLan))
        );

        // Results of the superseded attempts must not move the connection
        let started = Instant::now();
        while started.elapsed() < Duration::from_millis(700) {
            assert_eq!(conn.state(), ConnectionState::Connecting);
            thread::sleep(Duration::from_millis(50));
        }
        conn.cancel();
        assert!(conn.is_done());
    }

    #[test]
    fn test_done_latch() {
        let conn = offered(environment(Arc::new(Hanging)), lan(1, 4000));
        conn.cancel();
        assert_eq!(conn.state(), ConnectionState::Failed);

        conn.handle_request(2, lan(2, 5000));
        conn.handle_accept();
        conn.handle_reject(RejectReason::Declined);

        assert_eq!(conn.state(), ConnectionState::Failed);
        assert!(matches!(conn.last_event(), Some(RvEvent::LocallyCancelled)));
        assert_eq!(conn.request_index(), 1);
        assert!(conn.set_proxy_trusted(false).is_err());
    }
}
