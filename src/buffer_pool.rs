//! Buffer pool for reducing allocation overhead
//!
//! The broker owns one `BufferPool` and shares it with every connection.
//! Buffers are checked out as [`PooledBuf`] guards that return themselves
//! to the pool on drop, so a buffer is never used by two holders at once.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;

/// Default buffer size for pooled buffers
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default number of buffers kept in the pool
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Maximum buffer size to return to pool (don't pool oversized buffers)
const MAX_POOLED_BUFFER_SIZE: usize = 64 * 1024;

/// A pool of reusable BytesMut buffers
#[derive(Debug)]
pub struct BufferPool {
    pool: ArrayQueue<BytesMut>,
    buffer_size: usize,
}

impl BufferPool {
    /// Create a new buffer pool with default settings
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_POOL_CAPACITY, DEFAULT_BUFFER_SIZE)
    }

    /// Create a pool holding at most `capacity` idle buffers of `buffer_size` bytes
    pub fn with_capacity(capacity: usize, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            pool: ArrayQueue::new(capacity.max(1)),
            buffer_size,
        })
    }

    /// Check out a buffer, allocating if the pool is empty
    #[inline]
    pub fn acquire(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .pool
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        PooledBuf {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Return a buffer to the pool for reuse
    /// Buffer is cleared before being added to pool
    /// Oversized buffers are dropped instead of pooled
    #[inline]
    fn release(&self, mut buf: BytesMut) {
        if buf.capacity() <= MAX_POOLED_BUFFER_SIZE {
            buf.clear();
            // If pool is full, buffer is simply dropped
            let _ = self.pool.push(buf);
        }
    }

    /// Get the number of idle buffers currently in the pool
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

/// A buffer checked out of a [`BufferPool`]
///
/// Dereferences to `BytesMut`. Returned to the pool when dropped.
#[derive(Debug)]
pub struct PooledBuf {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}
