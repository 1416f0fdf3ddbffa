//! Reactor-driven TLS session.
//!
//! Lock order: `context` → `registration` → `tunnel` → `outbound`. The
//! outbound queue is a leaf; nothing is locked while it is held except the
//! buffer pool.
//!
//! `send` and `close` may be called from any thread, including from inside
//! callbacks. When another worker holds the context they only record the
//! request; that worker runs it right after releasing the lock.
//!
//! A tunnelled session pauses each direction once its queue reaches
//! [`QUEUE_LIMIT`]: unwrapping stops while the remote is backlogged, and
//! remote reads stop while `outbound` is full. Whoever drains a queue
//! resumes the paused side.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use mio::net::TcpStream;
use mio::Interest;

use crate::buffer::BufferPool;
use crate::engine::{EngineFactory, Role};
use crate::net::connection::{SessionGuard, SessionId, SessionTracker};
use crate::observability::metrics::{MetricsSink, NoopMetrics};
use crate::reactor::{Dispatch, EventHandler, Reactor, Readiness, Registration};
use crate::{lock, try_lock};

use super::callback::{DiscardCallback, SessionCallback};
use super::channel::{Channel, TcpChannel};
use super::context::{SessionContext, SessionFlags, SessionSettings};
use super::handshake::{self, Drive, SessionEvents};
use super::tunnel::{RemoteRead, TunnelRelay, QUEUE_LIMIT, TUNNEL_BUFFER_SIZE};
use super::SessionError;

/// Wires sessions up before their first use. Cheap to clone.
#[derive(Clone)]
pub struct SessionBuilder {
    reactor: Reactor,
    pool: Arc<BufferPool>,
    factory: Arc<dyn EngineFactory>,
    callback: Arc<dyn SessionCallback>,
    metrics: Arc<dyn MetricsSink>,
    tunnel_target: Option<SocketAddr>,
    settings: SessionSettings,
    tracker: Option<SessionTracker>,
}

impl SessionBuilder {
    pub fn new(reactor: Reactor, pool: Arc<BufferPool>, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            reactor,
            pool,
            factory,
            callback: Arc::new(DiscardCallback),
            metrics: Arc::new(NoopMetrics),
            tunnel_target: None,
            settings: SessionSettings::default(),
            tracker: None,
        }
    }

    pub fn callback(mut self, callback: Arc<dyn SessionCallback>) -> Self {
        self.callback = callback;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Relay decrypted traffic to `target` once the handshake finishes.
    pub fn tunnel_to(mut self, target: SocketAddr) -> Self {
        self.tunnel_target = Some(target);
        self
    }

    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn tracker(mut self, tracker: SessionTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn session_tracker(&self) -> Option<&SessionTracker> {
        self.tracker.as_ref()
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Start a server session on an accepted socket.
    pub fn accept(&self, stream: TcpStream) -> Result<Arc<TlsSession>, SessionError> {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let peer = stream.peer_addr().ok();
        let session = self.build(stream, Role::Server, peer, true);
        session.start(Interest::READABLE)?;
        Ok(session)
    }

    /// Start a client session; the handshake begins once the connect completes.
    pub fn connect(&self, addr: SocketAddr) -> Result<Arc<TlsSession>, SessionError> {
        let stream = TcpStream::connect(addr)?;
        let session = self.build(stream, Role::Client, Some(addr), false);
        session.start(Interest::READABLE | Interest::WRITABLE)?;
        Ok(session)
    }

    fn build(&self, stream: TcpStream, role: Role, peer: Option<SocketAddr>, connected: bool) -> Arc<TlsSession> {
        let id = SessionId::new();
        let flags = Arc::new(SessionFlags::default());
        let context = SessionContext::new(
            id,
            self.pool.clone(),
            TcpChannel::new(stream),
            flags.clone(),
            self.settings,
        );

        let session = Arc::new_cyclic(|me| TlsSession {
            id,
            role,
            peer,
            context: Mutex::new(context),
            registration: Mutex::new(None),
            tunnel: Mutex::new(None),
            outbound: Mutex::new(self.pool.acquire_accumulator()),
            flags,
            settings: self.settings,
            connected: AtomicBool::new(connected),
            inbound_paused: AtomicBool::new(false),
            inbound_resume: AtomicBool::new(false),
            remote_paused: AtomicBool::new(false),
            me: me.clone(),
            reactor: self.reactor.clone(),
            pool: self.pool.clone(),
            factory: self.factory.clone(),
            callback: self.callback.clone(),
            metrics: self.metrics.clone(),
            tunnel_target: self.tunnel_target,
            guard: Mutex::new(None),
        });

        if let Some(tracker) = &self.tracker {
            *lock(&session.guard) = Some(tracker.track(&session));
        }
        self.metrics.session_opened(role);
        tracing::debug!(session = %id, %role, peer = ?peer, "Session opened");
        session
    }
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("tunnel_target", &self.tunnel_target)
            .field("settings", &self.settings)
            .finish()
    }
}

/// One TLS connection driven by the reactor.
pub struct TlsSession {
    id: SessionId,
    role: Role,
    peer: Option<SocketAddr>,
    context: Mutex<SessionContext<TcpChannel>>,
    registration: Mutex<Option<Registration>>,
    tunnel: Mutex<Option<TunnelRelay>>,
    /// Plaintext waiting to be wrapped, in send order.
    outbound: Mutex<Vec<u8>>,
    flags: Arc<SessionFlags>,
    settings: SessionSettings,
    connected: AtomicBool,
    /// Unwrapping stopped because the tunnel is backlogged.
    inbound_paused: AtomicBool,
    /// The tunnel drained below the limit; unwrapping should continue.
    inbound_resume: AtomicBool,
    /// Remote reads stopped because `outbound` is full.
    remote_paused: AtomicBool,
    me: Weak<TlsSession>,
    reactor: Reactor,
    pool: Arc<BufferPool>,
    factory: Arc<dyn EngineFactory>,
    callback: Arc<dyn SessionCallback>,
    metrics: Arc<dyn MetricsSink>,
    tunnel_target: Option<SocketAddr>,
    guard: Mutex<Option<SessionGuard>>,
}

impl TlsSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn tunnel_target(&self) -> Option<SocketAddr> {
        self.tunnel_target
    }

    pub fn is_established(&self) -> bool {
        self.flags.is_established()
    }

    pub fn is_closed(&self) -> bool {
        self.flags.is_closed()
    }

    /// Start the handshake. Only the first call has an effect; sessions
    /// built by [`SessionBuilder`] are already started.
    pub fn begin_handshake(&self) -> Result<bool, SessionError> {
        let begun = lock(&self.context).begin_handshake(self.factory.as_ref(), self.role);
        match begun {
            Ok(true) if self.connected.load(Ordering::Acquire) => self.drive_once(),
            _ => self.run_deferred(),
        }
        begun
    }

    /// Queue plaintext for the peer. Data sent before the handshake
    /// finishes goes out right after it, in order.
    pub fn send(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.flags.close_requested() || self.flags.is_closed() {
            return Err(SessionError::Closed);
        }
        lock(&self.outbound).extend_from_slice(data);
        self.run_deferred();
        Ok(())
    }

    /// Close gracefully: flush queued data and `close_notify`, then tear
    /// down. Repeated calls are no-ops.
    pub fn close(&self) {
        self.flags.request_close(false);
        self.run_deferred();
    }

    fn start(self: &Arc<Self>, interest: Interest) -> Result<(), SessionError> {
        let started = self.register_and_begin(interest);
        if let Err(e) = started {
            self.flags.request_close(true);
            self.run_deferred();
            return Err(e);
        }
        if self.connected.load(Ordering::Acquire) {
            self.drive_once();
        }
        Ok(())
    }

    fn register_and_begin(self: &Arc<Self>, interest: Interest) -> Result<(), SessionError> {
        let mut ctx = lock(&self.context);
        ctx.begin_handshake(self.factory.as_ref(), self.role)?;
        let handler: Arc<dyn EventHandler> = self.clone();
        let registration = self
            .reactor
            .register(ctx.channel_mut(), interest, handler, Dispatch::Pool)?;
        *lock(&self.registration) = Some(registration);
        Ok(())
    }

    /// Returns `Ok(false)` while the connect is still in progress.
    fn finish_connect(&self) -> Result<bool, SessionError> {
        let mut ctx = lock(&self.context);
        if let Some(e) = ctx.channel().take_error()? {
            return Err(e.into());
        }
        match ctx.channel().peer_addr() {
            Ok(peer) => {
                self.connected.store(true, Ordering::Release);
                if let Some(registration) = lock(&self.registration).as_ref() {
                    registration.reregister(ctx.channel_mut(), Interest::READABLE)?;
                }
                tracing::debug!(session = %self.id, peer = %peer, "Connected");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn drive_once(&self) {
        let outcome = {
            let mut ctx = lock(&self.context);
            self.drive(&mut ctx)
        };
        self.settle(outcome);
        self.run_deferred();
    }

    fn drive(&self, ctx: &mut SessionContext<TcpChannel>) -> Result<Drive, SessionError> {
        handshake::drive(ctx, &mut Delivery { session: self })
    }

    fn settle(&self, outcome: Result<Drive, SessionError>) {
        match outcome {
            Ok(Drive::Waiting) => {}
            Ok(Drive::Closed) => {
                tracing::debug!(session = %self.id, "Peer closed");
                self.flags.request_close(false);
            }
            Err(e) => self.fail(e),
        }
    }

    fn on_remote_ready(&self) {
        self.pull_remote();
        self.run_deferred();
    }

    /// Service the remote socket: flush what is queued for it and move what
    /// it sent into `outbound`.
    fn pull_remote(&self) {
        if self.flags.is_closed() {
            return;
        }
        let outcome = {
            let mut tunnel = lock(&self.tunnel);
            let Some(relay) = tunnel.as_mut() else {
                return;
            };
            let outcome = relay.on_ready(&mut lock(&self.outbound));
            if !relay.is_backlogged() && self.inbound_paused.swap(false, Ordering::AcqRel) {
                tracing::trace!(session = %self.id, "Tunnel drained, resuming reads");
                self.inbound_resume.store(true, Ordering::Release);
            }
            outcome
        };
        match outcome {
            Ok(RemoteRead::Drained) => {}
            Ok(RemoteRead::Paused) => {
                tracing::trace!(session = %self.id, limit = QUEUE_LIMIT, "Outbound full, pausing remote");
                self.remote_paused.store(true, Ordering::Release);
            }
            Ok(RemoteRead::Closed) => {
                tracing::debug!(session = %self.id, "Tunnel remote closed");
                self.flags.request_close(false);
            }
            Err(e) => self.fail(e),
        }
    }

    fn open_tunnel(&self) -> Result<(), SessionError> {
        let Some(target) = self.tunnel_target else {
            return Ok(());
        };
        let mut tunnel = lock(&self.tunnel);
        if tunnel.is_some() {
            return Ok(());
        }
        let session = self.me.upgrade().ok_or(SessionError::Closed)?;
        let handler: Arc<dyn EventHandler> = Arc::new(RemoteHandler { session });
        *tunnel = Some(TunnelRelay::open(
            target,
            &self.reactor,
            &self.pool,
            TUNNEL_BUFFER_SIZE,
            handler,
        )?);
        Ok(())
    }

    /// Report a fatal error and force the session closed.
    fn fail(&self, error: SessionError) {
        if self.flags.is_closed() || self.flags.is_forced() {
            tracing::debug!(session = %self.id, error = %error, "Error after close");
            return;
        }
        tracing::warn!(session = %self.id, error = %error, "Session failed");
        self.metrics.session_failed(error.kind());
        self.callback.on_exception(self, &error);
        self.flags.request_close(true);
    }

    /// Run queued sends and a requested close, unless another worker holds
    /// the context (it will run them when it lets go).
    fn run_deferred(&self) {
        loop {
            let Some(mut ctx) = try_lock(&self.context) else {
                return;
            };
            if ctx.is_closed() {
                return;
            }
            if self.inbound_resume.swap(false, Ordering::AcqRel) && !self.flags.close_requested() {
                let outcome = self.drive(&mut ctx);
                if !matches!(outcome, Ok(Drive::Waiting)) {
                    drop(ctx);
                    self.settle(outcome);
                    continue;
                }
            }
            if self.flags.is_established() && !self.flags.is_forced() {
                if let Err(e) = self.flush_outbound(&mut *ctx) {
                    drop(ctx);
                    self.fail(e);
                    continue;
                }
            }
            if self.flags.close_requested() {
                self.teardown(ctx);
                return;
            }
            drop(ctx);
            if self.remote_paused.swap(false, Ordering::AcqRel) {
                self.pull_remote();
            }
            if !self.has_deferred_work() {
                return;
            }
        }
    }

    fn has_deferred_work(&self) -> bool {
        if self.flags.is_closed() {
            return false;
        }
        self.flags.close_requested()
            || self.inbound_resume.load(Ordering::Acquire)
            || self.remote_paused.load(Ordering::Acquire)
            || (self.flags.is_established() && !lock(&self.outbound).is_empty())
    }

    fn flush_outbound(&self, ctx: &mut SessionContext<TcpChannel>) -> Result<(), SessionError> {
        let pending = {
            let mut outbound = lock(&self.outbound);
            if outbound.is_empty() {
                return Ok(());
            }
            std::mem::replace(&mut *outbound, self.pool.acquire_accumulator())
        };
        let wrapped = ctx.wrap_app_data(&pending);
        self.pool.release_accumulator(pending);
        self.metrics.bytes_wrapped(wrapped?);
        Ok(())
    }

    fn teardown(&self, mut ctx: MutexGuard<'_, SessionContext<TcpChannel>>) {
        let forced = self.flags.is_forced();
        if !ctx.close(forced) {
            return;
        }
        if let Some(registration) = lock(&self.registration).take() {
            registration.cancel(ctx.channel_mut());
        }
        debug_assert!(!ctx.channel().is_open());
        drop(ctx);

        let relay = lock(&self.tunnel).take();
        if let Some(relay) = relay {
            relay.close(&self.pool, (!forced).then_some(self.settings));
        }
        let outbound = std::mem::take(&mut *lock(&self.outbound));
        self.pool.release_accumulator(outbound);
        self.metrics.session_closed();
        lock(&self.guard).take();

        tracing::debug!(session = %self.id, forced, "Session closed");
        self.callback.on_closed(self);
    }
}

impl EventHandler for TlsSession {
    fn on_ready(&self, readiness: Readiness) {
        if self.flags.is_closed() || !self.flags.has_begun() {
            return;
        }
        if !self.connected.load(Ordering::Acquire) {
            match self.finish_connect() {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    self.fail(e);
                    self.run_deferred();
                    return;
                }
            }
        }
        tracing::trace!(session = %self.id, ?readiness, "Session ready");
        self.drive_once();
    }

    fn on_failure(&self) {
        self.fail(SessionError::Panicked);
        self.run_deferred();
    }
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("established", &self.is_established())
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct RemoteHandler {
    session: Arc<TlsSession>,
}

impl EventHandler for RemoteHandler {
    fn on_ready(&self, _readiness: Readiness) {
        self.session.on_remote_ready();
    }

    fn on_failure(&self) {
        self.session.fail(SessionError::Panicked);
        self.session.run_deferred();
    }
}

/// Routes state machine effects to the tunnel or the application.
struct Delivery<'a> {
    session: &'a TlsSession,
}

impl SessionEvents for Delivery<'_> {
    fn handshake_finished(&mut self, elapsed: Duration) -> Result<(), SessionError> {
        let session = self.session;
        session.metrics.handshake_completed(session.role, elapsed);
        session.open_tunnel()?;
        session.callback.on_handshake_complete(session);
        Ok(())
    }

    fn plaintext(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let session = self.session;
        session.metrics.bytes_unwrapped(data.len());
        if session.tunnel_target.is_some() {
            if let Some(relay) = lock(&session.tunnel).as_mut() {
                relay.forward_to_remote(data)?;
            }
            return Ok(());
        }
        session.callback.on_data(session, data);
        Ok(())
    }

    fn accepts_plaintext(&mut self) -> bool {
        let session = self.session;
        let tunnel = lock(&session.tunnel);
        match tunnel.as_ref() {
            Some(relay) if relay.is_backlogged() => {
                // Set under the tunnel lock so a concurrent drain sees it.
                session.inbound_paused.store(true, Ordering::Release);
                tracing::trace!(session = %session.id, pending = relay.pending_len(), "Tunnel backlogged, pausing reads");
                false
            }
            _ => true,
        }
    }
}
