//! TLS listener on the reactor.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections until the socket would block
//! - Enforce `max_sessions` by dropping excess connections
//! - Hand accepted sockets to the session builder

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use mio::net::{TcpListener, TcpStream};
use mio::Interest;

use crate::config::ListenerConfig;
use crate::lock;
use crate::net::connection::SessionTracker;
use crate::reactor::{Dispatch, EventHandler, Reactor, Readiness, Registration};
use crate::session::SessionBuilder;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to bind to address.
    Bind(std::io::Error),
    /// Failed to accept connection.
    Accept(std::io::Error),
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind(e) => write!(f, "Failed to bind: {}", e),
            ListenerError::Accept(e) => write!(f, "Failed to accept: {}", e),
        }
    }
}

impl std::error::Error for ListenerError {}

struct Socket {
    listener: TcpListener,
    registration: Registration,
}

/// Accepts TLS connections and starts a server session for each.
///
/// The reactor holds the listener until [`TlsListener::close`].
pub struct TlsListener {
    local_addr: SocketAddr,
    max_sessions: usize,
    builder: SessionBuilder,
    tracker: SessionTracker,
    socket: Mutex<Option<Socket>>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl TlsListener {
    /// Bind to the configured address and start accepting on `reactor`.
    pub fn bind(
        config: &ListenerConfig,
        reactor: &Reactor,
        builder: SessionBuilder,
    ) -> Result<Arc<Self>, ListenerError> {
        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|e| ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

        let mut listener = TcpListener::bind(addr).map_err(ListenerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        let tracker = builder.session_tracker().cloned().unwrap_or_default();
        let builder = builder.tracker(tracker.clone());

        let this = Arc::new(Self {
            local_addr,
            max_sessions: config.max_sessions,
            builder,
            tracker,
            socket: Mutex::new(None),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        });

        // Hold the socket lock so an early event waits for the registration.
        let mut socket = lock(&this.socket);
        let handler: Arc<dyn EventHandler> = this.clone();
        let registration = reactor
            .register(&mut listener, Interest::READABLE, handler, Dispatch::Inline)
            .map_err(ListenerError::Bind)?;
        *socket = Some(Socket {
            listener,
            registration,
        });
        drop(socket);

        tracing::info!(
            address = %local_addr,
            max_sessions = config.max_sessions,
            "Listener bound"
        );
        Ok(this)
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Tracker of the sessions this listener started.
    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Connections dropped because the session limit was reached.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.socket).is_none()
    }

    /// Stop accepting. Live sessions are unaffected.
    pub fn close(&self) {
        if let Some(mut socket) = lock(&self.socket).take() {
            socket.registration.cancel(&mut socket.listener);
            tracing::info!(address = %self.local_addr, "Listener closed");
        }
    }

    fn accept_one(&self) -> Option<std::io::Result<(TcpStream, SocketAddr)>> {
        let socket = lock(&self.socket);
        let socket = socket.as_ref()?;
        Some(socket.listener.accept())
    }

    fn start_session(&self, stream: TcpStream, peer: SocketAddr) {
        if self.tracker.active_count() >= self.max_sessions {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                peer_addr = %peer,
                max_sessions = self.max_sessions,
                "Session limit reached, dropping connection"
            );
            return;
        }

        self.accepted.fetch_add(1, Ordering::Relaxed);
        match self.builder.accept(stream) {
            Ok(session) => {
                tracing::debug!(session = %session.id(), peer_addr = %peer, "Connection accepted");
            }
            Err(e) => {
                tracing::warn!(peer_addr = %peer, error = %e, "Failed to start session");
            }
        }
    }
}

impl EventHandler for TlsListener {
    fn on_ready(&self, _readiness: Readiness) {
        loop {
            match self.accept_one() {
                None => return,
                Some(Ok((stream, peer))) => self.start_session(stream, peer),
                Some(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Some(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Some(Err(e)) => {
                    tracing::error!(error = %ListenerError::Accept(e), "Accept loop interrupted");
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for TlsListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsListener")
            .field("local_addr", &self.local_addr)
            .field("max_sessions", &self.max_sessions)
            .field("active", &self.tracker.active_count())
            .finish()
    }
}
