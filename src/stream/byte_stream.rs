//! Connected byte stream shared by every strategy and transfer controller

use crate::error::{IoResultExt, Result};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A connected, bidirectional byte channel over a raw socket
#[derive(Debug)]
pub struct ByteStream {
    stream: TcpStream,
    peer: SocketAddr,
}

impl ByteStream {
    /// Wrap a connected socket
    pub fn new(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr().with_target("socket")?;
        // Headers are small; don't let Nagle hold them back
        let _ = stream.set_nodelay(true);
        Ok(Self { stream, peer })
    }

    /// Remote address of the socket
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Local address of the socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Independent handle on the input side
    pub fn reader(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }

    /// Independent handle on the output side
    pub fn writer(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }

    /// Handle that can abort blocking reads and writes from another thread
    pub fn canceller(&self) -> io::Result<StreamCanceller> {
        Ok(StreamCanceller {
            stream: Arc::new(self.stream.try_clone()?),
            fired: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Close both directions
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Read for ByteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for ByteStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// Shuts a socket down so blocked I/O on other handles returns immediately
#[derive(Debug, Clone)]
pub struct StreamCanceller {
    stream: Arc<TcpStream>,
    fired: Arc<AtomicBool>,
}

impl StreamCanceller {
    /// Abort all pending I/O on the socket; idempotent
    pub fn cancel(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called
    pub fn is_cancelled(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    fn pair() -> (ByteStream, ByteStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server, _) = listener.accept().unwrap();
        (
            ByteStream::new(client.join().unwrap()).unwrap(),
            ByteStream::new(server).unwrap(),
        )
    }

    #[test]
    fn test_bidirectional() {
        let (mut a, mut b) = pair();
        a.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").unwrap();
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_canceller_unblocks_read() {
        let (a, _b) = pair();
        let canceller = a.canceller().unwrap();
        let mut reader = a.reader().unwrap();

        let started = Instant::now();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 1];
            reader.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(50));
        canceller.cancel();
        canceller.cancel();

        // Shutdown turns the blocked read into EOF or an error
        let result = handle.join().unwrap();
        assert!(matches!(result, Ok(0) | Err(_)));
        assert!(canceller.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
