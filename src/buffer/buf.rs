//! Fixed-capacity byte buffer with position/limit cursors.
//!
//! A `NetBuffer` is either in *write mode* (bytes are appended between
//! `position` and `limit`, where `limit == capacity`) or *read mode* (after
//! [`NetBuffer::flip`], the bytes written so far are readable between
//! `position` and `limit`). Every wrap/unwrap in the session layer follows
//! the same discipline: flip, operate, compact.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity source for allocations; pooled buffers keep their id across reuse.
static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Pool key for a buffer's role.
///
/// Not a memory class: both kinds are the same boxed heap slice. The kind
/// only keeps the pool's free lists for TLS records apart from those for
/// plaintext scratch space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Plaintext and scratch space.
    Heap,
    /// Encrypted TLS records, sized to the engine's packet size.
    Direct,
}

/// A byte buffer with Java-NIO style cursors.
///
/// Always a plain `Box<[u8]>`, whatever its [`BufferKind`]. Nothing is
/// allocated off-heap or pinned for I/O; the kind is a cache key only.
pub struct NetBuffer {
    id: u64,
    kind: BufferKind,
    data: Box<[u8]>,
    position: usize,
    limit: usize,
}

impl NetBuffer {
    /// Allocate a zeroed buffer in write mode.
    pub fn new(kind: BufferKind, capacity: usize) -> Self {
        Self {
            id: BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            kind,
            data: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            limit: capacity,
        }
    }

    /// Allocation identity. Stable for the lifetime of the allocation.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// Reset to an empty buffer in write mode. Contents are not zeroed.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.data.len();
    }

    /// Switch from write mode to read mode.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Move unread bytes to the front and switch back to write mode.
    pub fn compact(&mut self) {
        let unread = self.remaining();
        if unread > 0 && self.position > 0 {
            self.data.copy_within(self.position..self.limit, 0);
        }
        self.position = unread;
        self.limit = self.data.len();
    }

    /// Bytes between position and limit.
    pub fn chunk(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// Mutable bytes between position and limit.
    pub fn chunk_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.position..self.limit]
    }

    /// Advance the position after bytes were consumed or produced in place.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`NetBuffer::remaining`].
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.remaining(), "advance past limit");
        self.position += n;
    }

    /// Copy as much of `src` as fits. Returns the number of bytes copied.
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data[self.position..self.position + n].copy_from_slice(&src[..n]);
        self.position += n;
        n
    }

    /// Read from `reader` into the writable region.
    pub fn read_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        let n = reader.read(self.chunk_mut())?;
        self.position += n;
        Ok(n)
    }

    /// Write the readable region to `writer`.
    pub fn write_to<W: Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<usize> {
        let n = writer.write(self.chunk())?;
        self.position += n;
        Ok(n)
    }
}

impl fmt::Debug for NetBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetBuffer")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("capacity", &self.data.len())
            .finish()
    }
}
