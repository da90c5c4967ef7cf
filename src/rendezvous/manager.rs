//! Process-wide registry of rendezvous negotiations

use super::connection::Environment;
use super::{IncomingFileTransfer, OutgoingFileTransfer, RendezvousConnection, RendezvousSessionHandler};
use crate::config::RendezvousConfig;
use crate::control::{ControlChannel, ControlMessage, LoopbackInbox, PeerId, SessionId};
use crate::error::{Result, RendezvousError};
use crate::stream::{SocketFactory, TcpSocketFactory};
use crate::timeout::TimeoutService;
use crate::transfer::TransferItem;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const INBOX_POLL: Duration = Duration::from_millis(100);

/// Notified about negotiations started by remote parties
pub trait ManagerListener: Send + Sync {
    /// A peer offered files; call `accept` or `reject` on the transfer
    fn new_incoming(&self, transfer: &IncomingFileTransfer);
}

type Registry = HashMap<(PeerId, SessionId), RendezvousSessionHandler>;

/// Creates outgoing negotiations and dispatches inbound control messages
pub struct ConnectionManager {
    env: Arc<Environment>,
    registry: Mutex<Registry>,
    listeners: Mutex<Vec<Arc<dyn ManagerListener>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionManager {
    /// Create a manager using plain `std::net` sockets
    pub fn new(config: RendezvousConfig, channel: Arc<dyn ControlChannel>) -> Result<Self> {
        Self::with_socket_factory(config, channel, Arc::new(TcpSocketFactory))
    }

    /// Create a manager with a custom socket factory
    pub fn with_socket_factory(
        config: RendezvousConfig,
        channel: Arc<dyn ControlChannel>,
        factory: Arc<dyn SocketFactory>,
    ) -> Result<Self> {
        config.validate()?;
        tracing::debug!(screen_name = %config.screen_name, policy = ?config.proxy_policy, "Connection manager created");

        Ok(Self {
            env: Arc::new(Environment {
                config: Arc::new(config),
                factory,
                channel,
                timeouts: TimeoutService::new(),
            }),
            registry: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Manager configuration
    pub fn config(&self) -> &RendezvousConfig {
        &self.env.config
    }

    /// Register a listener for incoming negotiations
    pub fn add_listener(&self, listener: Arc<dyn ManagerListener>) {
        lock(&self.listeners).push(listener);
    }

    /// Prepare a negotiation offering `items` to `peer`
    ///
    /// Nothing is sent until [`OutgoingFileTransfer::send_request`].
    pub fn create_outgoing_transfer(&self, peer: PeerId, items: Vec<TransferItem>) -> Result<OutgoingFileTransfer> {
        if items.is_empty() {
            return Err(RendezvousError::config("Nothing to transfer"));
        }
        let items = Arc::new(items);

        let mut registry = lock(&self.registry);
        let session = loop {
            let candidate = SessionId::random();
            if !registry.contains_key(&(peer.clone(), candidate)) {
                break candidate;
            }
        };
        let connection =
            RendezvousConnection::outgoing(Arc::clone(&self.env), peer.clone(), session, Arc::clone(&items));
        registry.insert((peer.clone(), session), RendezvousSessionHandler::new(connection.clone()));
        drop(registry);

        tracing::info!(%peer, %session, files = items.len(), "Outgoing transfer created");
        Ok(OutgoingFileTransfer::new(connection, items))
    }

    /// Feed an inbound control message
    ///
    /// Returns false if the message matched no negotiation and opened none.
    pub fn handle_control_message(&self, from: &PeerId, message: ControlMessage) -> bool {
        let key = (from.clone(), message.session());
        let handler = lock(&self.registry).get(&key).cloned();
        if let Some(handler) = handler {
            return handler.handle(from, message);
        }

        match message {
            ControlMessage::Request {
                session,
                index,
                info,
                description: Some(description),
            } if index == ControlMessage::INITIAL_INDEX => {
                let connection = RendezvousConnection::incoming(
                    Arc::clone(&self.env),
                    from.clone(),
                    session,
                    index,
                    info,
                    description.clone(),
                );
                {
                    let mut registry = lock(&self.registry);
                    if registry.contains_key(&key) {
                        // Lost a race with a duplicate of the same request
                        return false;
                    }
                    registry.insert(key, RendezvousSessionHandler::new(connection.clone()));
                }
                tracing::info!(
                    peer = %from,
                    %session,
                    name = %description.name,
                    files = description.file_count,
                    bytes = description.total_size,
                    "Incoming transfer offered"
                );

                let transfer = IncomingFileTransfer::new(connection);
                let listeners = lock(&self.listeners).clone();
                for listener in &listeners {
                    listener.new_incoming(&transfer);
                }
                true
            }
            other => {
                tracing::debug!(peer = %from, session = %other.session(), "No negotiation for control message");
                false
            }
        }
    }

    /// Look up a negotiation by session id
    pub fn connection(&self, session: SessionId) -> Option<RendezvousConnection> {
        lock(&self.registry)
            .iter()
            .find(|((_, s), _)| *s == session)
            .map(|(_, handler)| handler.connection().clone())
    }

    /// All registered negotiations
    pub fn connections(&self) -> Vec<RendezvousConnection> {
        lock(&self.registry)
            .values()
            .map(|handler| handler.connection().clone())
            .collect()
    }

    /// Drop finished and failed negotiations; returns how many were removed
    pub fn prune_finished(&self) -> usize {
        let mut registry = lock(&self.registry);
        let before = registry.len();
        registry.retain(|_, handler| !handler.connection().is_done());
        before - registry.len()
    }

    /// Cancel every negotiation still running
    pub fn cancel_all(&self) {
        let connections = self.connections();
        for connection in connections.iter().filter(|c| !c.is_done()) {
            connection.cancel();
        }
    }

    /// Pump messages from a loopback inbox into this manager on a background thread
    ///
    /// The thread ends when the manager is dropped or the sending end goes away.
    pub fn attach_inbox(self: &Arc<Self>, inbox: LoopbackInbox) -> Result<JoinHandle<()>> {
        let manager = Arc::downgrade(self);
        let name = format!("rv-inbox-{}", self.env.config.screen_name);
        thread::Builder::new()
            .name(name)
            .spawn(move || loop {
                match inbox.recv_timeout(INBOX_POLL) {
                    Ok(Some(inbound)) => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.handle_control_message(&inbound.from, inbound.message);
                    }
                    Ok(None) => {
                        if manager.strong_count() == 0 {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Inbox closed: {}", e);
                        break;
                    }
                }
            })
            .map_err(|e| RendezvousError::ControlChannel(format!("could not start inbox thread: {}", e)))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
