//! Rendezvous proxy relay server
//!
//! A hosting client sends INIT_SEND and is told a relay port. A joining
//! client sends INIT_RECV with that port and the same cookie; the server then
//! sends READY to both and copies bytes between them until either side
//! closes.

use super::packet::{ProxyPacket, ERROR_BAD_REQUEST, ERROR_BAD_VERSION, ERROR_NO_SUCH_RELAY};
use crate::control::SessionId;
use crate::error::{IoResultExt, Result, RendezvousError};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// First relay port handed out
const FIRST_RELAY_PORT: u16 = 1024;

/// How long a client may take to send its init packet
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Hosted relays nobody joined are dropped after this long
const RELAY_TTL: Duration = Duration::from_secs(300);

struct PendingRelay {
    host: TcpStream,
    screen_name: String,
    created: Instant,
}

#[derive(Default)]
struct RelayTable {
    pending: HashMap<(u16, SessionId), PendingRelay>,
    next_port: u16,
}

impl RelayTable {
    fn allocate_port(&mut self) -> u16 {
        if self.next_port < FIRST_RELAY_PORT {
            self.next_port = FIRST_RELAY_PORT;
        }
        let port = self.next_port;
        self.next_port = self.next_port.checked_add(1).unwrap_or(FIRST_RELAY_PORT);
        port
    }

    fn expire(&mut self, now: Instant) {
        self.pending.retain(|(port, cookie), relay| {
            let keep = now.duration_since(relay.created) < RELAY_TTL;
            if !keep {
                tracing::debug!(port, %cookie, host = %relay.screen_name, "Expired unjoined relay");
                let _ = relay.host.shutdown(Shutdown::Both);
            }
            keep
        });
    }
}

/// Rendezvous proxy server
pub struct ProxyServer {
    listener: TcpListener,
    public_ip: Ipv4Addr,
    relays: Arc<Mutex<RelayTable>>,
    shutdown: Arc<AtomicBool>,
    bytes_relayed: Arc<AtomicU64>,
}

impl ProxyServer {
    /// Bind the server
    ///
    /// `public_ip` is announced in relay acknowledgements; it defaults to the
    /// bind address, or loopback when bound to the unspecified address.
    pub fn bind(addr: SocketAddr, public_ip: Option<Ipv4Addr>) -> Result<Self> {
        let listener = TcpListener::bind(addr).with_target(addr)?;
        let public_ip = public_ip.unwrap_or(match addr.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => ip,
            _ => Ipv4Addr::LOCALHOST,
        });

        Ok(Self {
            listener,
            public_ip,
            relays: Arc::new(Mutex::new(RelayTable::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
            bytes_relayed: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Get the bound address
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get shutdown flag for external control
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Total bytes copied between relay ends
    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed.load(Ordering::Relaxed)
    }

    /// Number of hosted relays waiting for their peer
    pub fn pending_relays(&self) -> usize {
        self.relays.lock().map(|t| t.pending.len()).unwrap_or(0)
    }

    /// Run the server (blocking)
    pub fn run(&self) -> Result<()> {
        self.listener.set_nonblocking(true).with_target("listener")?;
        tracing::info!(addr = ?self.listener.local_addr().ok(), public_ip = %self.public_ip, "Proxy server running");

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    tracing::debug!("Accepted proxy client {}", addr);

                    let relays = Arc::clone(&self.relays);
                    let bytes = Arc::clone(&self.bytes_relayed);
                    let public_ip = self.public_ip;

                    thread::spawn(move || {
                        if let Err(e) = Self::handle_client(stream, public_ip, relays, bytes) {
                            tracing::warn!("Proxy client {} error: {}", addr, e);
                        }
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            }
        }

        // Unblock hosts still waiting for a peer
        if let Ok(mut table) = self.relays.lock() {
            for relay in table.pending.values() {
                let _ = relay.host.shutdown(Shutdown::Both);
            }
            table.pending.clear();
        }
        tracing::info!(bytes_relayed = self.bytes_relayed(), "Proxy server stopped");
        Ok(())
    }

    fn handle_client(
        mut stream: TcpStream,
        public_ip: Ipv4Addr,
        relays: Arc<Mutex<RelayTable>>,
        bytes: Arc<AtomicU64>,
    ) -> Result<()> {
        let peer = stream.peer_addr().with_target("proxy client")?;
        stream.set_nonblocking(false).with_target(peer)?;
        stream.set_read_timeout(Some(INIT_TIMEOUT)).with_target(peer)?;

        let packet = match ProxyPacket::read_from(&mut stream) {
            Ok(packet) => packet,
            Err(e) => {
                let code = match &e {
                    RendezvousError::Protocol(message) if message.contains("version") => ERROR_BAD_VERSION,
                    _ => ERROR_BAD_REQUEST,
                };
                let _ = ProxyPacket::Error { code }.write_to(&mut stream);
                return Err(e);
            }
        };
        stream.set_read_timeout(None).with_target(peer)?;

        match packet {
            ProxyPacket::InitSend { screen_name, cookie } => {
                let mut writer = stream.try_clone().with_target(peer)?;
                let port = {
                    let mut table = relays
                        .lock()
                        .map_err(|_| RendezvousError::protocol("relay table poisoned"))?;
                    table.expire(Instant::now());
                    let port = table.allocate_port();
                    table.pending.insert(
                        (port, cookie),
                        PendingRelay {
                            host: stream,
                            screen_name: screen_name.clone(),
                            created: Instant::now(),
                        },
                    );
                    port
                };

                // The relay is joinable before the host learns its port
                if let Err(e) = (ProxyPacket::Ack { port, ip: public_ip }).write_to(&mut writer) {
                    if let Ok(mut table) = relays.lock() {
                        table.pending.remove(&(port, cookie));
                    }
                    return Err(e);
                }
                tracing::info!(host = %screen_name, %cookie, port, "Relay hosted");
                Ok(())
            }
            ProxyPacket::InitRecv {
                screen_name,
                port,
                cookie,
            } => {
                let relay = relays
                    .lock()
                    .map_err(|_| RendezvousError::protocol("relay table poisoned"))?
                    .pending
                    .remove(&(port, cookie));

                let Some(relay) = relay else {
                    tracing::warn!(joiner = %screen_name, %cookie, port, "No such relay");
                    ProxyPacket::Error {
                        code: ERROR_NO_SUCH_RELAY,
                    }
                    .write_to(&mut stream)?;
                    return Ok(());
                };

                let mut host = relay.host;
                ProxyPacket::Ready.write_to(&mut host)?;
                ProxyPacket::Ready.write_to(&mut stream)?;
                tracing::info!(host = %relay.screen_name, joiner = %screen_name, %cookie, port, "Relay ready");

                bridge(host, stream, bytes)
            }
            other => {
                ProxyPacket::Error {
                    code: ERROR_BAD_REQUEST,
                }
                .write_to(&mut stream)?;
                Err(RendezvousError::protocol(format!(
                    "Unexpected {:?} from proxy client",
                    other.command()
                )))
            }
        }
    }
}

/// Copy bytes both ways until both directions have closed
fn bridge(a: TcpStream, b: TcpStream, bytes: Arc<AtomicU64>) -> Result<()> {
    let a_peer = a.peer_addr().ok();
    let b_peer = b.peer_addr().ok();

    let a_read = a.try_clone().with_target("relay")?;
    let b_write = b.try_clone().with_target("relay")?;
    let counter = Arc::clone(&bytes);
    let forward = thread::spawn(move || pump(a_read, b_write, counter));

    let backward = pump(b, a, bytes);
    let forward = forward.join().unwrap_or(0);

    tracing::debug!(?a_peer, ?b_peer, forward, backward, "Relay closed");
    Ok(())
}

fn pump(mut from: TcpStream, mut to: TcpStream, bytes: Arc<AtomicU64>) -> u64 {
    let copied = io::copy(&mut from, &mut to).unwrap_or(0);
    bytes.fetch_add(copied, Ordering::Relaxed);
    let _ = to.shutdown(Shutdown::Write);
    let _ = from.shutdown(Shutdown::Read);
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{await_ready, host_relay, join_relay};
    use std::io::{Read, Write};
    use std::thread::JoinHandle;

    fn start() -> (SocketAddr, Arc<AtomicBool>, JoinHandle<()>) {
        let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), None).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_flag();
        let handle = thread::spawn(move || {
            let _ = server.run();
        });
        (addr, shutdown, handle)
    }

    #[test]
    fn test_relay_bridges_bytes() {
        let (addr, shutdown, handle) = start();

        let mut host = TcpStream::connect(addr).unwrap();
        let relay = host_relay(&mut host, "alice", SessionId(77)).unwrap();
        assert_eq!(relay.ip, Ipv4Addr::LOCALHOST);

        let joiner = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            join_relay(&mut stream, "bob", relay.port, SessionId(77)).unwrap();
            stream.write_all(b"hello host").unwrap();
            let mut reply = [0u8; 10];
            stream.read_exact(&mut reply).unwrap();
            reply
        });

        await_ready(&mut host).unwrap();
        let mut buf = [0u8; 10];
        host.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello host");
        host.write_all(b"hello join").unwrap();

        assert_eq!(&joiner.join().unwrap(), b"hello join");

        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn test_wrong_cookie_refused() {
        let (addr, shutdown, handle) = start();

        let mut host = TcpStream::connect(addr).unwrap();
        let relay = host_relay(&mut host, "alice", SessionId(1)).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        let result = join_relay(&mut stream, "mallory", relay.port, SessionId(2));
        assert!(matches!(result, Err(RendezvousError::ProxyRefused(ERROR_NO_SUCH_RELAY))));

        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn test_distinct_relay_ports() {
        let (addr, shutdown, handle) = start();

        let mut first = TcpStream::connect(addr).unwrap();
        let mut second = TcpStream::connect(addr).unwrap();
        let a = host_relay(&mut first, "alice", SessionId(1)).unwrap();
        let b = host_relay(&mut second, "carol", SessionId(1)).unwrap();
        assert_ne!(a.port, b.port);

        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn test_hosted_relay_registered_before_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let relays = Arc::new(Mutex::new(RelayTable::default()));

        let table = Arc::clone(&relays);
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            ProxyServer::handle_client(stream, Ipv4Addr::LOCALHOST, table, Arc::new(AtomicU64::new(0)))
        });

        let mut host = TcpStream::connect(addr).unwrap();
        let relay = host_relay(&mut host, "alice", SessionId(9)).unwrap();

        // Entry present and table unlocked as soon as the ACK is readable
        {
            let table = relays.try_lock().unwrap();
            assert!(table.pending.contains_key(&(relay.port, SessionId(9))));
        }
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_releases_waiting_host() {
        let (addr, shutdown, handle) = start();

        let mut host = TcpStream::connect(addr).unwrap();
        host_relay(&mut host, "alice", SessionId(5)).unwrap();

        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(await_ready(&mut host).is_err());
    }
}
