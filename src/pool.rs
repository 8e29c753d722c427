//! Pooled payload buffers.
//!
//! Every buffer the connection reads into is leased from a [`BufferPool`]. A lease is an RAII
//! [`PooledBuffer`] that goes back to the pool when dropped, so buffers are returned on every
//! exit path, including errors and cancellation.
use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::BytesMut;
use parking_lot::Mutex;

/// Idle buffers kept by default.
const DEFAULT_MAX_IDLE: usize = 64;

struct PoolInner {
    buffer_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<BytesMut>>,
    outstanding: AtomicUsize,
}

/// A shared pool of fixed-size buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self::with_max_idle(buffer_size, DEFAULT_MAX_IDLE)
    }

    pub fn with_max_idle(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size: buffer_size.max(1),
                max_idle,
                idle: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Leases an empty buffer with at least [`BufferPool::buffer_size`] bytes of capacity.
    pub fn lease(&self) -> PooledBuffer {
        let buf = self
            .inner
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.inner.buffer_size));
        self.inner.outstanding.fetch_add(1, Ordering::Relaxed);

        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of leases not yet returned.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Relaxed)
    }

    /// Number of buffers waiting to be leased again.
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    fn release(&self, mut buf: BytesMut) {
        self.inner.outstanding.fetch_sub(1, Ordering::Relaxed);

        buf.clear();
        if buf.capacity() < self.inner.buffer_size {
            return;
        }
        let mut idle = self.inner.idle.lock();
        if idle.len() < self.inner.max_idle {
            idle.push(buf);
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// A buffer leased from a [`BufferPool`].
pub struct PooledBuffer {
    buf: BytesMut,
    pool: BufferPool,
}

impl PooledBuffer {
    /// Bytes that can still be written before the buffer reaches the pool's buffer size.
    pub fn spare(&self) -> usize {
        self.pool.buffer_size().saturating_sub(self.buf.len())
    }

    /// Whether the buffer reached the pool's buffer size.
    pub fn is_full(&self) -> bool {
        self.spare() == 0
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_and_return() {
        let pool = BufferPool::new(16);
        let mut a = pool.lease();
        a.extend_from_slice(b"hello");
        let b = pool.lease();
        assert_eq!(pool.outstanding(), 2);
        assert_eq!(a.spare(), 11);

        drop(a);
        drop(b);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 2);

        let again = pool.lease();
        assert!(again.is_empty());
        assert!(again.capacity() >= 16);
    }

    #[test]
    fn test_idle_is_bounded() {
        let pool = BufferPool::with_max_idle(8, 1);
        let leases: Vec<_> = (0..3).map(|_| pool.lease()).collect();
        drop(leases);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_split_contents_outlive_lease() {
        let pool = BufferPool::new(8);
        let mut buf = pool.lease();
        buf.extend_from_slice(b"12345678");
        let frozen = buf.split().freeze();
        assert!(buf.is_empty());
        drop(buf);

        assert_eq!(&frozen[..], b"12345678");
        assert_eq!(pool.outstanding(), 0);
    }
}
