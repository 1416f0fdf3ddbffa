//! Session identity and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique session IDs for tracing
//! - Track live sessions for limits and graceful shutdown
//! - Close every live session on shutdown

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;

use crate::lock;
use crate::session::TlsSession;

/// Global atomic counter for session IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Generate a new unique session ID.
    pub fn new() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

#[derive(Debug)]
struct TrackerInner {
    active: watch::Sender<usize>,
    sessions: Mutex<HashMap<SessionId, Weak<TlsSession>>>,
}

/// Tracks live sessions for limits and graceful shutdown.
///
/// Uses a watch channel to signal when the session count changes.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    inner: Arc<TrackerInner>,
}

impl SessionTracker {
    pub fn new() -> Self {
        let (active, _) = watch::channel(0);
        Self {
            inner: Arc::new(TrackerInner {
                active,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Record a live session. Returns a guard that untracks it on drop.
    pub fn track(&self, session: &Arc<TlsSession>) -> SessionGuard {
        let id = session.id();
        lock(&self.inner.sessions).insert(id, Arc::downgrade(session));
        self.inner.active.send_modify(|n| *n += 1);
        SessionGuard {
            inner: self.inner.clone(),
            id,
        }
    }

    /// Get current live session count.
    pub fn active_count(&self) -> usize {
        *self.inner.active.borrow()
    }

    /// Ask every live session to close gracefully.
    pub fn close_all(&self) -> usize {
        let sessions: Vec<Arc<TlsSession>> = lock(&self.inner.sessions)
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for session in &sessions {
            session.close();
        }
        sessions.len()
    }

    /// Wait until no session is live or `deadline` passes. Returns whether
    /// the tracker drained.
    pub async fn wait_idle(&self, deadline: Duration) -> bool {
        let mut rx = self.inner.active.subscribe();
        let drained = tokio::time::timeout(deadline, rx.wait_for(|n| *n == 0))
            .await
            .is_ok();
        drained
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a session's lifetime.
/// Decrements the live count when dropped.
#[derive(Debug)]
pub struct SessionGuard {
    inner: Arc<TrackerInner>,
    id: SessionId,
}

impl SessionGuard {
    /// Get the tracked session's ID.
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        lock(&self.inner.sessions).remove(&self.id);
        self.inner.active.send_modify(|n| *n = n.saturating_sub(1));
        tracing::trace!(session = %self.id, "Session untracked");
    }
}
