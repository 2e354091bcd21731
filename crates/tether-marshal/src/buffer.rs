//! Fixed-size buffer pool with single-owner transfer semantics.
//!
//! Buffers are owned by exactly one party at any instant: the pool while
//! free, the producer while filling, and never retained once handed to a
//! sink. Every buffer obtained from the pool is returned via `free` exactly
//! once on every exit path.

use crate::error::MarshalError;
use crossbeam_queue::ArrayQueue;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A fixed-capacity byte buffer owned by a single party at a time.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    capacity: usize,
}

impl Buffer {
    fn with_capacity(capacity: usize) -> Self {
        Self { data: Vec::with_capacity(capacity), capacity }
    }

    /// The fixed capacity this buffer was created with
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently stored
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if no bytes are stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Free space remaining before the fixed capacity is reached
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    /// Borrow the stored bytes
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append bytes, up to the remaining fixed capacity; returns how many
    /// bytes were taken.
    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.remaining());
        self.data.extend_from_slice(&bytes[..take]);
        take
    }

    /// Discard stored bytes, keeping the allocation
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Mutable access to the backing vector for codec use.
    ///
    /// The vector may grow past the fixed capacity when a single encoded
    /// value does not fit; the pool reclaims the allocation either way.
    pub fn vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

/// Allocation accounting snapshot for a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers handed out by `allocate`
    pub allocations: u64,
    /// Buffers returned via `free`
    pub frees: u64,
}

impl PoolStats {
    /// Buffers currently held by producers
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.allocations.saturating_sub(self.frees)
    }
}

/// A pool of fixed-size buffers.
///
/// `allocate` returns `None` on exhaustion rather than growing; callers
/// decide whether to degrade or fail. Freeing a buffer makes it available
/// to subsequent allocations.
pub struct BufferPool {
    free: ArrayQueue<Buffer>,
    buffer_size: usize,
    allocations: AtomicU64,
    frees: AtomicU64,
}

impl BufferPool {
    /// Create a pool holding `capacity` buffers of `buffer_size` bytes each.
    #[must_use]
    pub fn new(capacity: usize, buffer_size: usize) -> Arc<Self> {
        let free = ArrayQueue::new(capacity.max(1));
        for _ in 0..capacity.max(1) {
            // Queue was sized to hold every buffer; push cannot fail here.
            let _ = free.push(Buffer::with_capacity(buffer_size));
        }
        Arc::new(Self {
            free,
            buffer_size,
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        })
    }

    /// Take a free buffer, or `None` if the pool is exhausted.
    #[must_use]
    pub fn allocate(&self) -> Option<Buffer> {
        let buffer = self.free.pop()?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Some(buffer)
    }

    /// Return a buffer to the pool.
    pub fn free(&self, mut buffer: Buffer) {
        buffer.clear();
        self.frees.fetch_add(1, Ordering::Relaxed);
        // A buffer from a different (larger) pool generation is dropped
        // rather than queued past capacity.
        let _ = self.free.push(buffer);
    }

    /// The fixed size of buffers handed out by this pool
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers currently free
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Accounting snapshot
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("available", &self.free.len())
            .finish()
    }
}

/// A `Write` adapter staging bytes through pool buffers before a sink.
///
/// Each buffer is flushed to the sink the moment it fills and returned to
/// the pool immediately after; the writer never retains a buffer past the
/// point its contents were handed to the sink.
pub struct PooledWriter<W: Write> {
    pool: Arc<BufferPool>,
    sink: W,
    current: Option<Buffer>,
    closed: bool,
}

impl<W: Write> PooledWriter<W> {
    /// Create a writer staging through `pool` into `sink`.
    pub fn new(pool: Arc<BufferPool>, sink: W) -> Self {
        Self { pool, sink, current: None, closed: false }
    }

    fn flush_current(&mut self) -> io::Result<()> {
        if let Some(buffer) = self.current.take() {
            let result = self.sink.write_all(buffer.as_slice());
            // Returned on the error path too; the pool sees every buffer
            // exactly once.
            self.pool.free(buffer);
            result?;
        }
        Ok(())
    }

    /// Flush staged bytes and mark the writer closed.
    ///
    /// Closing twice is a no-op. Buffers are returned to the pool on both
    /// the success and the error path.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from the final flush.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.flush_current()?;
        self.sink.flush()
    }

    /// The pool this writer stages through
    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

impl<W: Write> Write for PooledWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let buffer = match &mut self.current {
            Some(buffer) => buffer,
            slot => match self.pool.allocate() {
                Some(buffer) => slot.insert(buffer),
                None => return Err(io::Error::other(MarshalError::PoolExhausted)),
            },
        };
        let taken = buffer.fill(buf);
        if buffer.remaining() == 0 {
            self.flush_current()?;
        }
        Ok(taken)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_current()?;
        self.sink.flush()
    }
}

impl<W: Write> Drop for PooledWriter<W> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Best-effort flush; the buffer must reach the pool even if the
        // sink rejects the bytes.
        if let Some(buffer) = self.current.take() {
            let _ = self.sink.write_all(buffer.as_slice());
            self.pool.free(buffer);
        }
        let _ = self.sink.flush();
    }
}
