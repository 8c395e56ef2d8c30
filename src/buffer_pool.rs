//! Fixed-size buffer pools for the upstream and per-client read loops
//! (spec §5 "Buffer pools").
//!
//! Each pool yields reusable, fixed-capacity buffers so hot read loops don't
//! allocate every iteration. A pooled buffer must never be handed to a
//! consumer directly: callers copy the read slice into a freshly owned
//! `Vec<u8>` before returning the pooled buffer, so nothing downstream can
//! retain pool-owned memory.

use parking_lot::Mutex;

/// A pool of reusable `Vec<u8>` buffers, all of the same fixed capacity.
pub struct BufferPool {
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

/// A buffer checked out from a [`BufferPool`]. Returned to the pool on
/// drop, so holders should copy out what they need before it goes away.
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        BufferPool {
            capacity,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> PooledBuffer<'_> {
        let mut buf = self.free.lock().pop().unwrap_or_default();
        buf.clear();
        buf.resize(self.capacity, 0);
        PooledBuffer { pool: self, buf }
    }
}

impl<'a> std::ops::Deref for PooledBuffer<'a> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl<'a> std::ops::DerefMut for PooledBuffer<'a> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl<'a> Drop for PooledBuffer<'a> {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.free.lock().push(buf);
    }
}
