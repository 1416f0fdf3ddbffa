//! Thread-safe cache of reusable buffers.
//!
//! # Responsibilities
//! - Hand out `NetBuffer`s of an exact capacity, reusing released ones
//! - Do the same for raw byte arrays and growable accumulators
//! - Keep every queue bounded (`CACHE_LIMIT` entries)
//!
//! # Design Decisions
//! - One coarse lock per pool: every operation is O(1) and sits off the
//!   byte-copy path, so sharding would buy nothing
//! - Best-effort cache, not LRU: releases beyond the cap are dropped
//! - Pools are plain values behind an `Arc`; listeners may own separate ones

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::buf::{BufferKind, NetBuffer};

/// Maximum number of cached entries per capacity (and per array length).
pub const CACHE_LIMIT: usize = 512;

/// Accumulators that grew beyond this are dropped instead of cached.
const MAX_RETAINED_ACCUMULATOR: usize = 1024 * 1024;

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Entries currently cached across all queues.
    pub cached_entries: usize,
    /// Sum of the capacities of all cached entries.
    pub cached_bytes: usize,
    /// Acquisitions served from the cache.
    pub hits: u64,
    /// Acquisitions that had to allocate.
    pub misses: u64,
}

#[derive(Default)]
struct PoolInner {
    buffers: HashMap<(BufferKind, usize), VecDeque<NetBuffer>>,
    arrays: HashMap<usize, VecDeque<Box<[u8]>>>,
    accumulators: VecDeque<Vec<u8>>,
    stats: PoolStats,
}

impl PoolInner {
    fn cached(&mut self, bytes: usize) {
        self.stats.cached_entries += 1;
        self.stats.cached_bytes += bytes;
    }

    fn uncached(&mut self, bytes: usize) {
        self.stats.cached_entries -= 1;
        self.stats.cached_bytes -= bytes;
        self.stats.hits += 1;
    }
}

/// A pool of reusable buffers, shared by every session of a listener.
pub struct BufferPool {
    limit: usize,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    /// Create a pool with the default per-queue cap.
    pub fn new() -> Self {
        Self::with_limit(CACHE_LIMIT)
    }

    /// Create a pool with a custom per-queue cap.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a cleared buffer of exactly `capacity` bytes.
    pub fn acquire_buffer(&self, kind: BufferKind, capacity: usize) -> NetBuffer {
        let mut inner = self.lock();
        if let Some(buf) = inner
            .buffers
            .get_mut(&(kind, capacity))
            .and_then(VecDeque::pop_front)
        {
            inner.uncached(capacity);
            return buf;
        }
        inner.stats.misses += 1;
        drop(inner);

        tracing::trace!(?kind, capacity, "Allocating buffer");
        NetBuffer::new(kind, capacity)
    }

    /// Return a buffer to the pool. The buffer is cleared before it is cached.
    pub fn release_buffer(&self, mut buf: NetBuffer) {
        buf.clear();
        let capacity = buf.capacity();
        let mut inner = self.lock();
        let queue = inner.buffers.entry((buf.kind(), capacity)).or_default();
        debug_assert!(
            !queue.iter().any(|b| b.id() == buf.id()),
            "buffer released twice"
        );
        if queue.len() >= self.limit {
            return;
        }
        queue.push_back(buf);
        inner.cached(capacity);
    }

    /// Get a byte array of exactly `len` bytes. Zero-length requests never
    /// allocate. Reused arrays may hold bytes from their previous owner.
    pub fn acquire_bytes(&self, len: usize) -> Box<[u8]> {
        if len == 0 {
            return Box::default();
        }
        let mut inner = self.lock();
        if let Some(arr) = inner.arrays.get_mut(&len).and_then(VecDeque::pop_front) {
            inner.uncached(len);
            return arr;
        }
        inner.stats.misses += 1;
        drop(inner);

        vec![0u8; len].into_boxed_slice()
    }

    /// Return a byte array to the pool.
    pub fn release_bytes(&self, arr: Box<[u8]>) {
        let len = arr.len();
        if len == 0 {
            return;
        }
        let mut inner = self.lock();
        let queue = inner.arrays.entry(len).or_default();
        if queue.len() >= self.limit {
            return;
        }
        queue.push_back(arr);
        inner.cached(len);
    }

    /// Get an empty growable accumulator, reusing a released allocation when
    /// one is cached.
    pub fn acquire_accumulator(&self) -> Vec<u8> {
        let mut inner = self.lock();
        if let Some(acc) = inner.accumulators.pop_front() {
            inner.uncached(acc.capacity());
            return acc;
        }
        inner.stats.misses += 1;
        Vec::new()
    }

    /// Return an accumulator. It is truncated before caching; allocations
    /// that never grew or grew past 1 MiB are simply dropped.
    pub fn release_accumulator(&self, mut acc: Vec<u8>) {
        let capacity = acc.capacity();
        if capacity == 0 || capacity > MAX_RETAINED_ACCUMULATOR {
            return;
        }
        acc.clear();
        let mut inner = self.lock();
        if inner.accumulators.len() >= self.limit {
            return;
        }
        inner.accumulators.push_back(acc);
        inner.cached(capacity);
    }

    /// Number of cached buffers of the given kind and capacity.
    pub fn pooled_buffers(&self, kind: BufferKind, capacity: usize) -> usize {
        self.lock()
            .buffers
            .get(&(kind, capacity))
            .map_or(0, VecDeque::len)
    }

    /// Number of cached byte arrays of the given length.
    pub fn pooled_arrays(&self, len: usize) -> usize {
        self.lock().arrays.get(&len).map_or(0, VecDeque::len)
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().stats
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("limit", &self.limit)
            .field("stats", &self.stats())
            .finish()
    }
}
