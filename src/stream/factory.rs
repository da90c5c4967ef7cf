//! Socket factory used by strategies instead of opening sockets directly

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

/// Opens raw sockets on behalf of connection strategies
///
/// Swapping the factory is how a SOCKS or test transport gets plugged in.
pub trait SocketFactory: Send + Sync + fmt::Debug {
    /// Open an outgoing connection, giving up after `timeout`
    fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream>;

    /// Open a listening socket
    fn listen(&self, addr: SocketAddr) -> io::Result<TcpListener>;

    /// Resolve a host name to socket addresses
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok((host, port).to_socket_addrs()?.collect())
    }
}

/// Plain `std::net` sockets
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpSocketFactory;

impl SocketFactory for TcpSocketFactory {
    fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nonblocking(false)?;
        Ok(stream)
    }

    fn listen(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        TcpListener::bind(addr)
    }
}

/// Best guess at the address of the interface that routes to the Internet
///
/// Connecting a UDP socket sends no packets; it only asks the kernel to pick
/// a route. Falls back to loopback on hosts without a default route.
pub fn local_interface_ip() -> IpAddr {
    let probe = || -> io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_and_listen() {
        let factory = TcpSocketFactory;
        let listener = factory.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = factory.connect(addr, Duration::from_secs(2)).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[test]
    fn test_connect_refused() {
        let factory = TcpSocketFactory;
        let listener = factory.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(factory.connect(addr, Duration::from_secs(2)).is_err());
    }

    #[test]
    fn test_resolve_localhost() {
        let addrs = TcpSocketFactory.resolve("localhost", 5190).unwrap();
        assert!(addrs.iter().all(|a| a.port() == 5190));
        assert!(!addrs.is_empty());
    }

    #[test]
    fn test_local_interface_ip() {
        assert!(!local_interface_ip().is_unspecified());
    }
}
