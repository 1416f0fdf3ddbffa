//! Per-connection state: engine, record buffers, channel, lifecycle flags.
//!
//! Buffers stay in write mode between calls. Every wrap/unwrap flips the
//! input, runs the engine, then compacts, so a record split across reads
//! is kept intact until the rest arrives.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::buffer::{BufferKind, BufferPool, NetBuffer};
use crate::config::SessionConfig;
use crate::engine::{CryptoEngine, EngineFactory, EngineResult, EngineStatus, HandshakeStatus, Role};
use crate::net::connection::SessionId;

use super::channel::Channel;
use super::SessionError;

/// Lifecycle flags shared between a session and its context.
#[derive(Debug, Default)]
pub struct SessionFlags {
    has_begun: AtomicBool,
    established: AtomicBool,
    close_requested: AtomicBool,
    forced_close: AtomicBool,
    closed: AtomicBool,
}

impl SessionFlags {
    pub fn has_begun(&self) -> bool {
        self.has_begun.load(Ordering::Acquire)
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    pub fn is_forced(&self) -> bool {
        self.forced_close.load(Ordering::Acquire)
    }

    /// Ask for teardown. A forced request also cuts a running close loop short.
    pub(crate) fn request_close(&self, forced: bool) {
        if forced {
            self.forced_close.store(true, Ordering::Release);
        }
        self.close_requested.store(true, Ordering::Release);
    }
}

/// Timing knobs for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// How long a graceful close keeps flushing `close_notify`, and waits
    /// for a tunnel remote to finish.
    pub close_linger: Duration,
    /// How long a write may keep hitting `WouldBlock` before the session fails.
    pub write_stall_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            close_linger: Duration::from_millis(config.close_linger_ms),
            write_stall_timeout: Duration::from_millis(config.write_stall_timeout_ms),
        }
    }
}

/// How a read from the channel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadEnd {
    /// The channel has nothing more right now.
    Drained,
    /// `in_net` filled up before the channel was drained.
    Full,
    /// The peer closed its side.
    Eof,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadOutcome {
    pub bytes: usize,
    pub end: ReadEnd,
}

struct Buffers {
    in_net: NetBuffer,
    out_net: NetBuffer,
    in_app: NetBuffer,
    scratch: NetBuffer,
    out_app: NetBuffer,
}

impl Buffers {
    fn acquire(pool: &BufferPool, packet_size: usize, app_size: usize) -> Self {
        Self {
            in_net: pool.acquire_buffer(BufferKind::Direct, packet_size),
            out_net: pool.acquire_buffer(BufferKind::Direct, packet_size),
            in_app: pool.acquire_buffer(BufferKind::Heap, app_size),
            scratch: pool.acquire_buffer(BufferKind::Heap, app_size),
            out_app: pool.acquire_buffer(BufferKind::Heap, app_size),
        }
    }

    fn release(self, pool: &BufferPool) {
        pool.release_buffer(self.in_net);
        pool.release_buffer(self.out_net);
        pool.release_buffer(self.in_app);
        pool.release_buffer(self.scratch);
        pool.release_buffer(self.out_app);
    }
}

/// Where an unwrap writes its plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnwrapInto {
    /// Handshake unwraps; output is discarded.
    Scratch,
    /// Application data, delivered afterwards.
    App,
}

pub struct SessionContext<C: Channel> {
    id: SessionId,
    pool: Arc<BufferPool>,
    channel: C,
    engine: Option<Box<dyn CryptoEngine>>,
    buffers: Option<Buffers>,
    flags: Arc<SessionFlags>,
    settings: SessionSettings,
    handshake_started: Option<Instant>,
}

impl<C: Channel> SessionContext<C> {
    pub fn new(
        id: SessionId,
        pool: Arc<BufferPool>,
        channel: C,
        flags: Arc<SessionFlags>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            id,
            pool,
            channel,
            engine: None,
            buffers: None,
            flags,
            settings,
            handshake_started: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn flags(&self) -> &Arc<SessionFlags> {
        &self.flags
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Create the engine and size the buffers from it. Only the first call
    /// does anything; later calls return `Ok(false)`.
    pub fn begin_handshake(&mut self, factory: &dyn EngineFactory, role: Role) -> Result<bool, SessionError> {
        if self.flags.is_closed() {
            return Err(SessionError::Closed);
        }
        if self.flags.has_begun.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        let mut engine = factory.new_engine(role)?;
        engine.begin_handshake()?;
        let packet_size = engine.packet_buffer_size();
        let app_size = engine.application_buffer_size();
        self.buffers = Some(Buffers::acquire(&self.pool, packet_size, app_size));
        self.engine = Some(engine);
        self.handshake_started = Some(Instant::now());

        tracing::debug!(session = %self.id, %role, packet_size, app_size, "Handshake started");
        Ok(true)
    }

    pub(crate) fn engine(&self) -> Result<&dyn CryptoEngine, SessionError> {
        self.engine.as_deref().ok_or(SessionError::NotStarted)
    }

    pub(crate) fn engine_mut(&mut self) -> Result<&mut (dyn CryptoEngine + 'static), SessionError> {
        self.engine.as_deref_mut().ok_or(SessionError::NotStarted)
    }

    pub fn is_closed(&self) -> bool {
        self.flags.is_closed()
    }

    /// Returns `true` the first time only.
    pub(crate) fn mark_established(&mut self) -> bool {
        !self.flags.established.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn handshake_elapsed(&self) -> Duration {
        self.handshake_started.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Identities of the five session buffers, while they are held.
    pub fn buffer_ids(&self) -> Option<[u64; 5]> {
        self.buffers.as_ref().map(|b| {
            [
                b.in_net.id(),
                b.out_net.id(),
                b.in_app.id(),
                b.scratch.id(),
                b.out_app.id(),
            ]
        })
    }

    /// Whether unread ciphertext is waiting, in `in_net` or inside the engine.
    pub(crate) fn has_buffered_input(&self) -> bool {
        let buffered = self.buffers.as_ref().is_some_and(|b| b.in_net.position() > 0);
        buffered || self.engine.as_deref().is_some_and(|e| e.has_pending_input())
    }

    pub(crate) fn in_net_full(&self) -> bool {
        self.buffers.as_ref().is_some_and(|b| !b.in_net.has_remaining())
    }

    /// Read from the channel until it would block, `in_net` is full, or the
    /// peer closes.
    pub(crate) fn read_in_net(&mut self) -> Result<ReadOutcome, SessionError> {
        let buffers = self.buffers.as_mut().ok_or(SessionError::Closed)?;
        let mut bytes = 0;
        loop {
            if !self.channel.is_open() {
                return Ok(ReadOutcome { bytes, end: ReadEnd::Eof });
            }
            if !buffers.in_net.has_remaining() {
                return Ok(ReadOutcome { bytes, end: ReadEnd::Full });
            }
            match buffers.in_net.read_from(&mut self.channel) {
                Ok(0) => return Ok(ReadOutcome { bytes, end: ReadEnd::Eof }),
                Ok(n) => bytes += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome { bytes, end: ReadEnd::Drained });
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Wrap with an empty source (handshake and alert records) into `out_net`.
    pub(crate) fn wrap_handshake(&mut self) -> Result<EngineResult, SessionError> {
        let engine = self.engine.as_deref_mut().ok_or(SessionError::NotStarted)?;
        let buffers = self.buffers.as_mut().ok_or(SessionError::Closed)?;
        buffers.out_app.clear();
        buffers.out_app.flip();
        let result = engine.wrap(&mut buffers.out_app, &mut buffers.out_net);
        buffers.out_app.clear();
        let result = result?;
        tracing::trace!(session = %self.id, ?result, "wrap");
        Ok(result)
    }

    /// Unwrap buffered ciphertext: flip, unwrap, compact.
    pub(crate) fn unwrap(&mut self, into: UnwrapInto) -> Result<EngineResult, SessionError> {
        let engine = self.engine.as_deref_mut().ok_or(SessionError::NotStarted)?;
        let buffers = self.buffers.as_mut().ok_or(SessionError::Closed)?;
        let dst = match into {
            UnwrapInto::Scratch => &mut buffers.scratch,
            UnwrapInto::App => &mut buffers.in_app,
        };
        buffers.in_net.flip();
        let result = engine.unwrap(&mut buffers.in_net, dst);
        buffers.in_net.compact();
        let result = result?;
        if into == UnwrapInto::Scratch {
            buffers.scratch.clear();
        }
        tracing::trace!(session = %self.id, ?result, "unwrap");
        Ok(result)
    }

    /// Hand the decrypted contents of `in_app` to `deliver`, then clear it.
    pub(crate) fn drain_app<R>(&mut self, deliver: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let buffers = self.buffers.as_mut()?;
        buffers.in_app.flip();
        let delivered = buffers.in_app.has_remaining().then(|| deliver(buffers.in_app.chunk()));
        buffers.in_app.clear();
        delivered
    }

    /// Write all of `out_net` to the channel.
    pub(crate) fn flush_out_net(&mut self) -> Result<usize, SessionError> {
        let buffers = self.buffers.as_mut().ok_or(SessionError::Closed)?;
        flush(&mut self.channel, &mut buffers.out_net, self.settings.write_stall_timeout)
    }

    /// Regrow `in_net` after an underflow on a full buffer.
    pub(crate) fn enlarge_in_net(&mut self) -> Result<(), SessionError> {
        let wanted = self.engine()?.packet_buffer_size();
        let buffers = self.buffers.as_mut().ok_or(SessionError::Closed)?;
        if wanted <= buffers.in_net.capacity() {
            return Err(SessionError::Contract {
                op: "unwrap",
                status: EngineStatus::BufferUnderflow,
            });
        }
        tracing::debug!(session = %self.id, from = buffers.in_net.capacity(), to = wanted, "Enlarging inbound record buffer");
        grow(&self.pool, &mut buffers.in_net, wanted);
        Ok(())
    }

    /// Regrow `in_app` and `scratch` after an unwrap overflow.
    pub(crate) fn enlarge_in_app(&mut self) -> Result<(), SessionError> {
        let wanted = self.engine()?.application_buffer_size();
        let buffers = self.buffers.as_mut().ok_or(SessionError::Closed)?;
        if wanted <= buffers.in_app.capacity() {
            return Err(SessionError::Contract {
                op: "unwrap",
                status: EngineStatus::BufferOverflow,
            });
        }
        tracing::debug!(session = %self.id, from = buffers.in_app.capacity(), to = wanted, "Enlarging application buffer");
        grow(&self.pool, &mut buffers.in_app, wanted);
        grow(&self.pool, &mut buffers.scratch, wanted);
        Ok(())
    }

    /// Regrow `out_net` after a wrap overflow on an empty buffer.
    pub(crate) fn enlarge_out_net(&mut self) -> Result<(), SessionError> {
        let wanted = self.engine()?.packet_buffer_size();
        let buffers = self.buffers.as_mut().ok_or(SessionError::Closed)?;
        if wanted <= buffers.out_net.capacity() {
            return Err(SessionError::Contract {
                op: "wrap",
                status: EngineStatus::BufferOverflow,
            });
        }
        tracing::debug!(session = %self.id, from = buffers.out_net.capacity(), to = wanted, "Enlarging outbound record buffer");
        grow(&self.pool, &mut buffers.out_net, wanted);
        Ok(())
    }

    /// Encrypt `data` and write it out. Returns the plaintext bytes wrapped.
    pub fn wrap_app_data(&mut self, data: &[u8]) -> Result<usize, SessionError> {
        let mut offset = 0;
        while offset < data.len() {
            let staged = {
                let buffers = self.buffers.as_mut().ok_or(SessionError::Closed)?;
                buffers.out_app.clear();
                let n = buffers.out_app.put_slice(&data[offset..]);
                buffers.out_app.flip();
                n
            };

            loop {
                let engine = self.engine.as_deref_mut().ok_or(SessionError::NotStarted)?;
                let buffers = self.buffers.as_mut().ok_or(SessionError::Closed)?;
                if !buffers.out_app.has_remaining() {
                    break;
                }
                let result = engine.wrap(&mut buffers.out_app, &mut buffers.out_net)?;
                match result.status {
                    EngineStatus::Ok if result.bytes_consumed == 0 && result.bytes_produced == 0 => {
                        return Err(SessionError::Contract {
                            op: "wrap",
                            status: result.status,
                        });
                    }
                    EngineStatus::Ok => {
                        self.flush_out_net()?;
                    }
                    EngineStatus::BufferOverflow if buffers.out_net.position() > 0 => {
                        self.flush_out_net()?;
                    }
                    EngineStatus::BufferOverflow => self.enlarge_out_net()?,
                    EngineStatus::Closed => return Err(SessionError::Closed),
                    EngineStatus::BufferUnderflow => {
                        return Err(SessionError::Contract {
                            op: "wrap",
                            status: result.status,
                        });
                    }
                }
            }
            offset += staged;
        }

        // Post-handshake messages the engine queued while wrapping.
        while self.engine()?.handshake_status() == HandshakeStatus::NeedWrap {
            let result = self.wrap_handshake()?;
            if result.bytes_produced == 0 {
                break;
            }
            self.flush_out_net()?;
        }
        if let Some(buffers) = self.buffers.as_mut() {
            buffers.out_app.clear();
        }
        Ok(data.len())
    }

    /// Tear the context down. Unless `forced`, `close_notify` is flushed
    /// first, bounded by the close linger. Buffers go back to the pool.
    /// Returns `false` if the context was already closed.
    pub fn close(&mut self, forced: bool) -> bool {
        if self.flags.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.flags.request_close(forced);

        if !forced && self.engine.is_some() && self.buffers.is_some() && self.channel.is_open() {
            if let Err(e) = self.send_close_notify() {
                tracing::debug!(session = %self.id, error = %e, "close_notify not delivered");
            }
        }
        self.channel.shutdown();
        if let Some(buffers) = self.buffers.take() {
            buffers.release(&self.pool);
        }
        true
    }

    fn send_close_notify(&mut self) -> Result<(), SessionError> {
        self.engine_mut()?.close_outbound();
        let deadline = Instant::now() + self.settings.close_linger;

        while !self.flags.is_forced() && self.channel.is_open() && Instant::now() < deadline {
            match self.engine()?.handshake_status() {
                HandshakeStatus::NeedWrap => {
                    let result = self.wrap_handshake()?;
                    if result.status == EngineStatus::BufferOverflow {
                        self.enlarge_out_net()?;
                        continue;
                    }
                    if result.bytes_produced > 0 {
                        self.flush_out_net()?;
                    }
                    if result.status == EngineStatus::Closed || result.bytes_produced == 0 {
                        break;
                    }
                }
                HandshakeStatus::NeedUnwrap => {
                    let read = self.read_in_net()?;
                    let result = self.unwrap(UnwrapInto::Scratch)?;
                    if result.status == EngineStatus::Closed || read.end == ReadEnd::Eof {
                        break;
                    }
                    if result.status == EngineStatus::BufferUnderflow {
                        thread::yield_now();
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }
}

fn flush<W: Write + ?Sized>(channel: &mut W, out_net: &mut NetBuffer, stall: Duration) -> Result<usize, SessionError> {
    out_net.flip();
    let total = out_net.remaining();
    let mut stalled_since: Option<Instant> = None;

    let outcome = loop {
        if !out_net.has_remaining() {
            break Ok(total);
        }
        match out_net.write_to(channel) {
            Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(_) => stalled_since = None,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let since = *stalled_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= stall {
                    break Err(SessionError::WriteStalled(stall));
                }
                thread::yield_now();
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => break Err(e.into()),
        }
    };
    out_net.clear();
    outcome
}

fn grow(pool: &BufferPool, buffer: &mut NetBuffer, capacity: usize) {
    let mut grown = pool.acquire_buffer(buffer.kind(), capacity);
    buffer.flip();
    grown.put_slice(buffer.chunk());
    let old = std::mem::replace(buffer, grown);
    pool.release_buffer(old);
}
