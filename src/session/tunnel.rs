//! Plaintext relay between an established session and a remote socket.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::Interest;

use crate::buffer::{BufferKind, BufferPool, NetBuffer};
use crate::reactor::{Dispatch, EventHandler, Reactor, Registration};

use super::context::SessionSettings;
use super::SessionError;

/// Size of the buffer remote reads land in.
pub const TUNNEL_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes either direction may queue before its producer is paused.
pub const QUEUE_LIMIT: usize = 4 * TUNNEL_BUFFER_SIZE;

const DRAIN_POLL: Duration = Duration::from_millis(1);

/// Outcome of servicing remote readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoteRead {
    /// The remote socket would block.
    Drained,
    /// The session queue reached [`QUEUE_LIMIT`]; the socket may hold more.
    Paused,
    /// The remote closed its side.
    Closed,
}

/// Outbound plaintext connection of a tunnelled session.
///
/// Bytes for the remote are queued in `pending` until the connect completes
/// and whenever the remote socket stops accepting writes. The session stops
/// unwrapping once [`TunnelRelay::is_backlogged`] reports the queue full.
pub struct TunnelRelay {
    target: SocketAddr,
    stream: TcpStream,
    registration: Option<Registration>,
    buffer: NetBuffer,
    pending: Vec<u8>,
    connected: bool,
}

impl TunnelRelay {
    /// Start a non-blocking connect to `target`; `handler` gets the remote
    /// socket's readiness.
    pub(crate) fn open(
        target: SocketAddr,
        reactor: &Reactor,
        pool: &BufferPool,
        buffer_size: usize,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, SessionError> {
        let connect_error = |source: io::Error| SessionError::TunnelConnect { addr: target, source };
        let mut stream = TcpStream::connect(target).map_err(connect_error)?;
        let registration = reactor
            .register(&mut stream, Interest::READABLE | Interest::WRITABLE, handler, Dispatch::Pool)
            .map_err(connect_error)?;

        tracing::debug!(target = %target, "Tunnel connecting");
        Ok(Self {
            target,
            stream,
            registration: Some(registration),
            buffer: pool.acquire_buffer(BufferKind::Heap, buffer_size),
            pending: pool.acquire_accumulator(),
            connected: false,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether `pending` has reached [`QUEUE_LIMIT`].
    pub fn is_backlogged(&self) -> bool {
        self.pending.len() >= QUEUE_LIMIT
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queue decrypted bytes for the remote and write what it accepts.
    pub(crate) fn forward_to_remote(&mut self, data: &[u8]) -> io::Result<()> {
        self.pending.extend_from_slice(data);
        if self.connected {
            self.flush_pending()?;
        }
        Ok(())
    }

    /// Handle remote readiness: finish the connect, flush queued bytes, and
    /// append what is readable to `to_session` until it holds
    /// [`QUEUE_LIMIT`] bytes.
    pub(crate) fn on_ready(&mut self, to_session: &mut Vec<u8>) -> Result<RemoteRead, SessionError> {
        if !self.connected {
            if !self.finish_connect()? {
                return Ok(RemoteRead::Drained);
            }
            tracing::debug!(target = %self.target, "Tunnel connected");
        }
        self.flush_pending()?;

        loop {
            if to_session.len() >= QUEUE_LIMIT {
                return Ok(RemoteRead::Paused);
            }
            let room = (QUEUE_LIMIT - to_session.len()).min(self.buffer.capacity());
            match self.stream.read(&mut self.buffer.chunk_mut()[..room]) {
                Ok(0) => return Ok(RemoteRead::Closed),
                Ok(n) => to_session.extend_from_slice(&self.buffer.chunk()[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(RemoteRead::Drained),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn finish_connect(&mut self) -> Result<bool, SessionError> {
        let connect_error = |source: io::Error| SessionError::TunnelConnect {
            addr: self.target,
            source,
        };
        if let Some(e) = self.stream.take_error().map_err(connect_error)? {
            return Err(connect_error(e));
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.connected = true;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(connect_error(e)),
        }
    }

    fn flush_pending(&mut self) -> io::Result<()> {
        let mut written = 0;
        while written < self.pending.len() {
            match self.stream.write(&self.pending[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.pending.drain(..written);
        Ok(())
    }

    /// Deliver what is still queued, then half-close and wait for the
    /// remote to finish. Writes are bounded by `write_stall_timeout`, the
    /// wait for the remote's EOF by `close_linger`.
    fn drain(&mut self, settings: SessionSettings) -> Result<(), SessionError> {
        let stall = settings.write_stall_timeout;
        let deadline = Instant::now() + stall;
        while !self.connected && !self.finish_connect()? {
            if Instant::now() >= deadline {
                return Err(SessionError::WriteStalled(stall));
            }
            thread::sleep(DRAIN_POLL);
        }

        let mut stalled_since: Option<Instant> = None;
        while !self.pending.is_empty() {
            let before = self.pending.len();
            self.flush_pending()?;
            if self.pending.is_empty() {
                break;
            }
            if self.pending.len() < before {
                stalled_since = None;
            }
            if stalled_since.get_or_insert_with(Instant::now).elapsed() >= stall {
                return Err(SessionError::WriteStalled(stall));
            }
            // An echoing remote stops reading once its replies back up.
            if self.discard_readable()? {
                return Ok(());
            }
            thread::sleep(DRAIN_POLL);
        }

        self.stream.shutdown(Shutdown::Write)?;
        let deadline = Instant::now() + settings.close_linger;
        while !self.discard_readable()? {
            if Instant::now() >= deadline {
                tracing::debug!(target = %self.target, "Tunnel remote did not close in time");
                break;
            }
            thread::sleep(DRAIN_POLL);
        }
        Ok(())
    }

    /// Read and drop everything the remote has sent. Returns `true` at EOF.
    fn discard_readable(&mut self) -> io::Result<bool> {
        loop {
            match self.stream.read(self.buffer.chunk_mut()) {
                Ok(0) => return Ok(true),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Deregister, close the socket, and hand the buffers back. With
    /// `drain` set, queued bytes reach the remote first.
    pub(crate) fn close(mut self, pool: &BufferPool, drain: Option<SessionSettings>) {
        if let Some(registration) = self.registration.take() {
            registration.cancel(&mut self.stream);
        }
        if let Some(settings) = drain {
            if let Err(e) = self.drain(settings) {
                tracing::debug!(
                    target = %self.target,
                    error = %e,
                    undelivered = self.pending.len(),
                    "Tunnel drain failed"
                );
            }
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                tracing::debug!(target = %self.target, error = %e, "Tunnel shutdown failed");
            }
        }
        pool.release_buffer(self.buffer);
        pool.release_accumulator(self.pending);
        tracing::debug!(target = %self.target, "Tunnel closed");
    }
}

impl std::fmt::Debug for TunnelRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRelay")
            .field("target", &self.target)
            .field("connected", &self.connected)
            .field("pending", &self.pending.len())
            .finish()
    }
}
