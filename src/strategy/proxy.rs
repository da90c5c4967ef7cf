//! Proxied strategies: join the peer's relay, or host one and redirect
//! the peer to it

use crate::control::ConnectionInfo;
use crate::error::{Result, RendezvousError};
use crate::proxy::{await_ready, host_relay, join_relay};
use crate::rendezvous::{
    ControlSignal, Controller, ControllerContext, ControllerKind, ControllerResult, RvEvent, StrategyKind,
};
use crate::stream::ByteStream;
use std::net::{IpAddr, SocketAddr};

/// Open a stream to `addr` whose blocking I/O `signal` can abort
fn open(ctx: &ControllerContext, signal: &ControlSignal, addr: SocketAddr) -> Result<ByteStream> {
    let socket = ctx
        .factory()
        .connect(addr, ctx.deadline())
        .map_err(|e| RendezvousError::connection(addr, e))?;
    let stream = ByteStream::new(socket)?;
    signal.attach(
        stream
            .canceller()
            .map_err(|e| RendezvousError::connection(addr, e))?,
    );
    signal.check()?;
    Ok(stream)
}

/// Joins a relay the peer set up on its proxy
#[derive(Debug, Default)]
pub struct ProxyRelayController {
    signal: ControlSignal,
}

impl ProxyRelayController {
    /// Create a relay-joining controller
    pub fn new() -> Self {
        Self::default()
    }

    fn connect(&self, ctx: &ControllerContext) -> Result<ByteStream> {
        let info = ctx
            .info()
            .filter(|i| i.proxied)
            .ok_or_else(|| RendezvousError::protocol("Peer offered no proxy relay"))?;
        let proxy_ip = info
            .relay_proxy()
            .ok_or_else(|| RendezvousError::protocol("Proxy relay offer without proxy address"))?;
        let addr = SocketAddr::new(proxy_ip, ctx.config().proxy_port);

        ctx.emit(RvEvent::Connecting {
            strategy: StrategyKind::ProxyRelay,
            target: Some(addr),
        });
        let mut stream = open(ctx, &self.signal, addr)?;

        join_relay(&mut stream, &ctx.config().screen_name, info.port, ctx.session())?;
        tracing::info!(peer = %ctx.peer(), proxy = %addr, relay_port = info.port, "Joined proxy relay");

        if !self.signal.settle() {
            return Err(RendezvousError::Cancelled);
        }
        Ok(stream)
    }
}

impl Controller for ProxyRelayController {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Strategy(StrategyKind::ProxyRelay)
    }

    fn signal(&self) -> &ControlSignal {
        &self.signal
    }

    fn run(&self, ctx: &ControllerContext, _previous: Option<ControllerResult>) -> ControllerResult {
        match self.connect(ctx) {
            Ok(stream) => ControllerResult::Connected(stream),
            Err(e) => ControllerResult::Failed(RvEvent::failed(self.kind(), e)),
        }
    }
}

/// Hosts a relay on our proxy and redirects the peer to it
#[derive(Debug, Default)]
pub struct ProxyRedirectController {
    signal: ControlSignal,
}

impl ProxyRedirectController {
    /// Create a relay-hosting controller
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(&self, ctx: &ControllerContext) -> Result<SocketAddr> {
        let config = ctx.config();
        ctx.emit(RvEvent::ResolvingProxy {
            host: config.proxy_host.clone(),
        });
        let addrs = ctx
            .factory()
            .resolve(&config.proxy_host, config.proxy_port)
            .map_err(|e| RendezvousError::Resolve(format!("{}: {}", config.proxy_host, e)))?;

        // Relay acknowledgements carry IPv4 addresses only
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| RendezvousError::Resolve(config.proxy_host.clone()))
    }

    fn connect(&self, ctx: &ControllerContext) -> Result<ByteStream> {
        let addr = self.resolve(ctx)?;
        self.signal.check()?;

        ctx.emit(RvEvent::Connecting {
            strategy: StrategyKind::ProxyRedirect,
            target: Some(addr),
        });
        let mut stream = open(ctx, &self.signal, addr)?;

        let relay = host_relay(&mut stream, &ctx.config().screen_name, ctx.session())?;
        let info = ConnectionInfo::proxied(IpAddr::V4(relay.ip), relay.port);
        ctx.emit(RvEvent::WaitingForConnection {
            addr: SocketAddr::new(IpAddr::V4(relay.ip), relay.port),
        });
        let index = ctx.send_request(info)?;
        tracing::info!(peer = %ctx.peer(), proxy = %addr, relay_port = relay.port, index, "Redirected peer to proxy relay");

        await_ready(&mut stream)?;
        if !self.signal.settle() {
            return Err(RendezvousError::Cancelled);
        }
        Ok(stream)
    }
}

impl Controller for ProxyRedirectController {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Strategy(StrategyKind::ProxyRedirect)
    }

    fn signal(&self) -> &ControlSignal {
        &self.signal
    }

    fn run(&self, ctx: &ControllerContext, _previous: Option<ControllerResult>) -> ControllerResult {
        match self.connect(ctx) {
            Ok(stream) => ControllerResult::Connected(stream),
            Err(e) => {
                // A stop turns the blocked READY read into a connection error
                let e = if self.signal.is_stopped() { RendezvousError::Cancelled } else { e };
                ControllerResult::Failed(RvEvent::failed(self.kind(), e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RendezvousConfig;
    use crate::control::ControlMessage;
    use crate::proxy::ProxyServer;
    use crate::rendezvous::test_support::{context, RecordingLink};
    use crate::rendezvous::StopReason;
    use std::net::Ipv4Addr;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn proxy_config(port: u16) -> RendezvousConfig {
        RendezvousConfig {
            screen_name: "alice".to_string(),
            proxy_host: "127.0.0.1".to_string(),
            proxy_port: port,
            ..Default::default()
        }
    }

    #[test]
    fn test_redirect_and_relay_meet() {
        let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), None).unwrap();
        let port = server.local_addr().unwrap().port();
        let shutdown = server.shutdown_flag();
        let server_thread = thread::spawn(move || server.run());

        // Host side
        let host_link = Arc::new(RecordingLink::default());
        let host_ctx = context(proxy_config(port), None, Arc::clone(&host_link));
        let host = thread::spawn(move || ProxyRedirectController::new().run(&host_ctx, None));

        // Wait for the redirect request and join with it
        let started = Instant::now();
        let info = loop {
            if let Some(ControlMessage::Request { info, .. }) = host_link.requests.lock().unwrap().first() {
                break info.clone();
            }
            assert!(started.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(5));
        };
        assert!(info.proxied);
        assert_eq!(info.proxy_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));

        let join_ctx = context(proxy_config(port), Some(info), Arc::new(RecordingLink::default()));
        let joined = ProxyRelayController::new().run(&join_ctx, None);

        let hosted = host.join().unwrap();
        let (ControllerResult::Connected(mut a), ControllerResult::Connected(mut b)) = (hosted, joined) else {
            panic!("relay did not connect both ends");
        };

        use std::io::{Read, Write};
        a.write_all(b"via relay").unwrap();
        let mut buf = [0u8; 9];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"via relay");

        shutdown.store(true, Ordering::SeqCst);
        drop((a, b));
        server_thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_relay_needs_proxied_offer() {
        let info = ConnectionInfo::direct(IpAddr::V4(Ipv4Addr::LOCALHOST), None, 4000);
        let ctx = context(proxy_config(1), Some(info), Arc::new(RecordingLink::default()));
        match ProxyRelayController::new().run(&ctx, None) {
            ControllerResult::Failed(RvEvent::StrategyFailed { error, .. }) => {
                assert!(matches!(*error, RendezvousError::Protocol(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_redirect_stop_while_waiting() {
        let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), None).unwrap();
        let port = server.local_addr().unwrap().port();
        let shutdown = server.shutdown_flag();
        let server_thread = thread::spawn(move || server.run());

        let link = Arc::new(RecordingLink::default());
        let ctx = context(proxy_config(port), None, Arc::clone(&link));
        let controller = Arc::new(ProxyRedirectController::new());

        let runner = Arc::clone(&controller);
        let handle = thread::spawn(move || runner.run(&ctx, None));

        let started = Instant::now();
        while link.requests.lock().unwrap().is_empty() {
            assert!(started.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(5));
        }
        controller.signal().stop(StopReason::Stopped);

        match handle.join().unwrap() {
            ControllerResult::Failed(RvEvent::StrategyFailed { error, .. }) => {
                assert!(matches!(*error, RendezvousError::Cancelled));
            }
            other => panic!("unexpected {:?}", other),
        }

        shutdown.store(true, Ordering::SeqCst);
        server_thread.join().unwrap().unwrap();
    }
}
