//! Byte channels a session reads ciphertext from and writes ciphertext to.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use mio::event::Source;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

/// A non-blocking, bidirectional byte channel.
///
/// Reads return `WouldBlock` when no data is available and `Ok(0)` once the
/// peer has closed its side.
pub trait Channel: Read + Write + Send {
    fn is_open(&self) -> bool;

    /// Close both directions. Idempotent.
    fn shutdown(&mut self);
}

/// The encrypted TCP socket of a session.
#[derive(Debug)]
pub struct TcpChannel {
    stream: TcpStream,
    open: bool,
}

impl TcpChannel {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream, open: true }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.stream.take_error()
    }
}

impl Read for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.open {
            return Ok(0);
        }
        self.stream.read(buf)
    }
}

impl Write for TcpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.open {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Channel for TcpChannel {
    fn is_open(&self) -> bool {
        self.open
    }

    fn shutdown(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                tracing::debug!(error = %e, "Socket shutdown failed");
            }
        }
    }
}

impl Source for TcpChannel {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}
