//! Readiness reactor.
//!
//! # Data Flow
//! ```text
//! mio::Poll (dedicated thread)
//!     → token lookup → Slot (handler + coalesced readiness bits)
//!     → Dispatch::Inline: handler runs on the poll thread
//!     → Dispatch::Pool:   handler runs on the runtime's blocking pool
//! ```
//!
//! # Design Decisions
//! - mio is edge-triggered: handlers must drain their sources until
//!   `WouldBlock` before returning
//! - At most one handler invocation per registration at a time; readiness
//!   that arrives meanwhile is OR-ed into the slot and delivered right after
//! - A panicking handler is contained here and told via `on_failure`
//! - Handlers are synchronous and may block briefly (lock waits, write
//!   stalls, close linger), so they never run on async worker threads

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tokio::runtime::Handle;

use crate::config::ReactorConfig;
use crate::lock;

const WAKE_TOKEN: Token = Token(0);

/// Readiness delivered to a handler. Bits from several events may be merged.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness(u8);

impl Readiness {
    pub const READABLE: Readiness = Readiness(0b0000_0001);
    pub const WRITABLE: Readiness = Readiness(0b0000_0010);
    pub const READ_CLOSED: Readiness = Readiness(0b0000_0100);
    pub const WRITE_CLOSED: Readiness = Readiness(0b0000_1000);
    pub const ERROR: Readiness = Readiness(0b0001_0000);

    fn from_event(event: &Event) -> Self {
        let mut bits = 0;
        if event.is_readable() {
            bits |= Self::READABLE.0;
        }
        if event.is_writable() {
            bits |= Self::WRITABLE.0;
        }
        if event.is_read_closed() {
            bits |= Self::READ_CLOSED.0;
        }
        if event.is_write_closed() {
            bits |= Self::WRITE_CLOSED.0;
        }
        if event.is_error() {
            bits |= Self::ERROR.0;
        }
        Readiness(bits)
    }

    pub fn contains(&self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_readable(&self) -> bool {
        self.contains(Self::READABLE) || self.contains(Self::READ_CLOSED)
    }

    pub fn is_writable(&self) -> bool {
        self.contains(Self::WRITABLE)
    }

    pub fn is_error(&self) -> bool {
        self.contains(Self::ERROR)
    }
}

impl std::ops::BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("readable", &self.contains(Self::READABLE))
            .field("writable", &self.contains(Self::WRITABLE))
            .field("read_closed", &self.contains(Self::READ_CLOSED))
            .field("write_closed", &self.contains(Self::WRITE_CLOSED))
            .field("error", &self.is_error())
            .finish()
    }
}

/// Receives readiness for one registered source.
pub trait EventHandler: Send + Sync {
    fn on_ready(&self, readiness: Readiness);

    /// Called after `on_ready` panicked.
    fn on_failure(&self) {}
}

/// Where a handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// On the poll thread. For short, never-blocking handlers (accept loops).
    Inline,
    /// On the runtime's blocking pool. Handlers may wait on locks or
    /// short write stalls.
    Pool,
}

struct Slot {
    handler: Arc<dyn EventHandler>,
    dispatch: Dispatch,
    pending: AtomicU8,
    running: AtomicBool,
    cancelled: AtomicBool,
}

impl Slot {
    fn run(&self) {
        loop {
            let bits = self.pending.swap(0, Ordering::AcqRel);
            if bits != 0 && !self.cancelled.load(Ordering::Acquire) {
                let handler = &self.handler;
                if catch_unwind(AssertUnwindSafe(|| handler.on_ready(Readiness(bits)))).is_err() {
                    tracing::error!("Event handler panicked");
                    if catch_unwind(AssertUnwindSafe(|| handler.on_failure())).is_err() {
                        tracing::error!("Event handler failure hook panicked");
                    }
                }
                continue;
            }

            self.running.store(false, Ordering::Release);
            // Readiness may have landed between the swap and the store.
            if self.pending.load(Ordering::Acquire) == 0 || self.running.swap(true, Ordering::AcqRel) {
                return;
            }
        }
    }
}

struct Shared {
    registry: Registry,
    waker: Waker,
    runtime: Handle,
    slots: Mutex<HashMap<Token, Arc<Slot>>>,
    next_token: AtomicUsize,
    shutdown: AtomicBool,
}

impl Shared {
    fn schedule(&self, slot: Arc<Slot>, readiness: Readiness) {
        slot.pending.fetch_or(readiness.0, Ordering::AcqRel);
        if slot.running.swap(true, Ordering::AcqRel) {
            return;
        }
        match slot.dispatch {
            Dispatch::Inline => slot.run(),
            Dispatch::Pool => {
                self.runtime.spawn_blocking(move || slot.run());
            }
        }
    }
}

/// Handle to a running reactor. Cheap to clone.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
}

/// The poll thread of a reactor.
pub struct ReactorThread {
    handle: JoinHandle<()>,
}

impl ReactorThread {
    /// Wait for the poll thread to exit (after [`Reactor::shutdown`]).
    pub fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!("Reactor thread panicked");
        }
    }
}

impl Reactor {
    /// Spawn the poll thread. Pool-dispatched handlers run on `runtime`.
    pub fn start(config: &ReactorConfig, runtime: Handle) -> io::Result<(Self, ReactorThread)> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        let shared = Arc::new(Shared {
            registry,
            waker,
            runtime,
            slots: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(1),
            shutdown: AtomicBool::new(false),
        });

        let events_capacity = config.events_capacity;
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("tls-reactor".into())
            .spawn(move || poll_loop(poll, thread_shared, events_capacity))?;

        tracing::info!(events_capacity, "Reactor started");
        Ok((Self { shared }, ReactorThread { handle }))
    }

    /// Register `source` for `interest`; `handler` receives its readiness.
    pub fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        interest: Interest,
        handler: Arc<dyn EventHandler>,
        dispatch: Dispatch,
    ) -> io::Result<Registration> {
        if self.is_shutdown() {
            return Err(io::Error::new(io::ErrorKind::Other, "reactor is shut down"));
        }
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(Slot {
            handler,
            dispatch,
            pending: AtomicU8::new(0),
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        });
        lock(&self.shared.slots).insert(token, slot);

        if let Err(e) = self.shared.registry.register(source, token, interest) {
            lock(&self.shared.slots).remove(&token);
            return Err(e);
        }
        tracing::trace!(token = token.0, ?dispatch, "Source registered");
        Ok(Registration {
            shared: self.shared.clone(),
            token,
        })
    }

    /// Stop the poll thread. Registered handlers are dropped.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.shared.waker.wake() {
            tracing::error!(error = %e, "Failed to wake reactor for shutdown");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Number of live registrations.
    pub fn registrations(&self) -> usize {
        lock(&self.shared.slots).len()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("registrations", &self.registrations())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// A live registration. Consumed by [`Registration::cancel`].
pub struct Registration {
    shared: Arc<Shared>,
    token: Token,
}

impl Registration {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn reregister<S: Source + ?Sized>(&self, source: &mut S, interest: Interest) -> io::Result<()> {
        self.shared.registry.reregister(source, self.token, interest)
    }

    /// Stop delivering readiness and deregister `source`.
    pub fn cancel<S: Source + ?Sized>(self, source: &mut S) {
        if let Some(slot) = lock(&self.shared.slots).remove(&self.token) {
            slot.cancelled.store(true, Ordering::Release);
        }
        if let Err(e) = self.shared.registry.deregister(source) {
            tracing::debug!(token = self.token.0, error = %e, "Deregister failed");
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("token", &self.token.0).finish()
    }
}

fn poll_loop(mut poll: Poll, shared: Arc<Shared>, events_capacity: usize) {
    let mut events = Events::with_capacity(events_capacity);
    while !shared.shutdown.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(error = %e, "Reactor poll failed");
            break;
        }
        for event in events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            let slot = lock(&shared.slots).get(&token).cloned();
            if let Some(slot) = slot {
                shared.schedule(slot, Readiness::from_event(event));
            }
        }
    }
    lock(&shared.slots).clear();
    tracing::info!("Reactor stopped");
}
