//! Reverse connection: listen and let the peer connect to us

use crate::control::ConnectionInfo;
use crate::error::{IoResultExt, Result, RendezvousError};
use crate::rendezvous::{
    ControlSignal, Controller, ControllerContext, ControllerKind, ControllerResult, RvEvent, StrategyKind,
};
use crate::stream::{local_interface_ip, ByteStream};
use std::io;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Listens on the configured address and advertises it in a request
#[derive(Debug, Default)]
pub struct PassiveController {
    signal: ControlSignal,
}

impl PassiveController {
    /// Create a passive listener controller
    pub fn new() -> Self {
        Self::default()
    }

    fn connect(&self, ctx: &ControllerContext) -> Result<ByteStream> {
        let config = ctx.config();
        let listener = ctx.factory().listen(config.listen_addr).with_target(config.listen_addr)?;
        let local = listener.local_addr().with_target(config.listen_addr)?;
        listener.set_nonblocking(true).with_target(local)?;

        let lan_ip = config.advertised_lan_ip.unwrap_or_else(local_interface_ip);
        let external_ip = config.advertised_external_ip.unwrap_or(lan_ip);
        let info = ConnectionInfo::direct(lan_ip, Some(external_ip), local.port());

        ctx.emit(RvEvent::WaitingForConnection {
            addr: SocketAddr::new(lan_ip, local.port()),
        });
        let index = ctx.send_request(info)?;
        tracing::info!(peer = %ctx.peer(), session = %ctx.session(), %local, index, "Listening for peer");

        loop {
            self.signal.check()?;
            match listener.accept() {
                Ok((socket, addr)) => {
                    socket.set_nonblocking(false).with_target(addr)?;
                    tracing::debug!(peer = %ctx.peer(), %addr, "Peer connected to passive listener");
                    let stream = ByteStream::new(socket)?;
                    if !self.signal.settle() {
                        return Err(RendezvousError::Cancelled);
                    }
                    return Ok(stream);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => return Err(RendezvousError::connection(local, e)),
            }
        }
    }
}

impl Controller for PassiveController {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Strategy(StrategyKind::Passive)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RendezvousConfig;
    use crate::control::ControlMessage;
    use crate::rendezvous::test_support::{context, RecordingLink};
    use crate::rendezvous::StopReason;
    use std::net::{IpAddr, Ipv4Addr, TcpStream};
    use std::sync::Arc;
    use std::time::Instant;

    fn loopback_config() -> RendezvousConfig {
        RendezvousConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            advertised_lan_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ..Default::default()
        }
    }

    fn advertised_port(link: &RecordingLink) -> Option<u16> {
        match link.requests.lock().unwrap().first() {
            Some(ControlMessage::Request { info, .. }) => Some(info.port),
            _ => None,
        }
    }

    #[test]
    fn test_accepts_peer() {
        let link = Arc::new(RecordingLink::default());
        let ctx = context(loopback_config(), None, Arc::clone(&link));
        let controller = PassiveController::new();

        let peer_link = Arc::clone(&link);
        let peer = thread::spawn(move || {
            let started = Instant::now();
            let port = loop {
                if let Some(port) = advertised_port(&peer_link) {
                    break port;
                }
                assert!(started.elapsed() < Duration::from_secs(5));
                thread::sleep(Duration::from_millis(5));
            };
            TcpStream::connect(("127.0.0.1", port)).unwrap()
        });

        let result = controller.run(&ctx, None);
        let _peer_socket = peer.join().unwrap();
        assert!(matches!(result, ControllerResult::Connected(_)));

        match &link.requests.lock().unwrap()[0] {
            ControlMessage::Request { info, .. } => {
                assert!(!info.proxied);
                assert_eq!(info.internal_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
                assert_eq!(info.external_ip, info.internal_ip);
            }
            other => panic!("unexpected {:?}", other),
        };
    }

    #[test]
    fn test_stop_ends_listening() {
        let link = Arc::new(RecordingLink::default());
        let ctx = context(loopback_config(), None, link);
        let controller = Arc::new(PassiveController::new());

        let stopper = Arc::clone(&controller);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stopper.signal().stop(StopReason::TimedOut(Duration::from_millis(50)));
        });

        match controller.run(&ctx, None) {
            ControllerResult::Failed(RvEvent::StrategyFailed { error, .. }) => {
                assert!(matches!(*error, RendezvousError::Cancelled));
            }
            other => panic!("unexpected {:?}", other),
        }
        handle.join().unwrap();
    }
}
