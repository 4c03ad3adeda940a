//! Bounded pool of fixed-size header scratch buffers.
//!
//! Encoding and decoding a message header needs a few bytes of scratch space.
//! Instead of allocating per message, buffers are checked out of a small pool
//! and handed back when the [`PooledHeader`] guard drops, on every exit path.
//!
//! Buffers are never cleared on return: callers must overwrite the whole buffer
//! before reading from it.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

/// Default number of idle buffers retained by a pool.
pub const DEFAULT_POOL_CAPACITY: usize = 8;

/// A pool of `[u8; N]` scratch buffers.
///
/// At most `capacity` idle buffers are kept. A checkout from an empty pool
/// starts from a fresh array; surplus buffers are discarded on return.
#[derive(Debug)]
pub struct HeaderPool<const N: usize> {
    idle: Mutex<Vec<[u8; N]>>,
    capacity: usize,
}

impl<const N: usize> HeaderPool<N> {
    /// Create a pool retaining up to [`DEFAULT_POOL_CAPACITY`] buffers.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY)
    }

    /// Create a pool retaining up to `capacity` idle buffers.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Check out a buffer. Its contents are unspecified.
    pub fn checkout(&self) -> PooledHeader<'_, N> {
        let buf = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or([0u8; N]);
        PooledHeader { buf, pool: self }
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Maximum number of idle buffers retained.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn give_back(&self, buf: [u8; N]) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.capacity {
            idle.push(buf);
        }
    }
}

impl<const N: usize> Default for HeaderPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A checked-out buffer; returns itself to the pool on drop.
pub struct PooledHeader<'a, const N: usize> {
    buf: [u8; N],
    pool: &'a HeaderPool<N>,
}

impl<const N: usize> Deref for PooledHeader<'_, N> {
    type Target = [u8; N];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl<const N: usize> DerefMut for PooledHeader<'_, N> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl<const N: usize> Drop for PooledHeader<'_, N> {
    fn drop(&mut self) {
        self.pool.give_back(self.buf);
    }
}

impl<const N: usize> std::fmt::Debug for PooledHeader<'_, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHeader").field("size", &N).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_and_return() {
        let pool: HeaderPool<4> = HeaderPool::new();
        assert_eq!(pool.idle(), 0);

        {
            let mut buf = pool.checkout();
            buf.copy_from_slice(&[1, 2, 3, 4]);
            assert_eq!(*buf, [1, 2, 3, 4]);
        }

        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn returned_buffers_are_reused_without_clearing() {
        let pool: HeaderPool<4> = HeaderPool::with_capacity(1);
        {
            let mut buf = pool.checkout();
            buf.copy_from_slice(&[0xAA; 4]);
        }
        let buf = pool.checkout();
        assert_eq!(*buf, [0xAA; 4]);
    }

    #[test]
    fn idle_buffers_are_bounded() {
        let pool: HeaderPool<4> = HeaderPool::with_capacity(2);
        {
            let _a = pool.checkout();
            let _b = pool.checkout();
            let _c = pool.checkout();
            let _d = pool.checkout();
        }
        assert_eq!(pool.idle(), 2);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn returned_on_early_exit() {
        fn fails(pool: &HeaderPool<4>) -> Result<(), &'static str> {
            let _buf = pool.checkout();
            Err("bail out")
        }

        let pool: HeaderPool<4> = HeaderPool::new();
        assert!(fails(&pool).is_err());
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn shared_across_threads() {
        let pool: std::sync::Arc<HeaderPool<4>> = std::sync::Arc::new(HeaderPool::with_capacity(4));
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let pool = std::sync::Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut buf = pool.checkout();
                        buf.copy_from_slice(&[i; 4]);
                        assert_eq!(*buf, [i; 4]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.idle() <= 4);
    }
}
