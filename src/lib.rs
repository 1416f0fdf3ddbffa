//! Non-blocking TLS session engine with pooled buffers and a plaintext tunnel relay.

pub mod buffer;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod reactor;
pub mod session;

use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

pub use buffer::BufferPool;
pub use config::schema::TunnelConfig;
pub use reactor::Reactor;
pub use session::{SessionBuilder, SessionCallback, TlsSession};

/// Lock, recovering from poisoning. Teardown has to run even after a
/// handler panicked while holding the lock.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Non-blocking variant of [`lock`]. `None` while another thread holds it.
pub(crate) fn try_lock<T: ?Sized>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}
