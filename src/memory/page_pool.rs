//! # Page Buffer Pool
//!
//! Bounded pool of page-sized buffers backing the cache entries.
//!
//! ## Purpose
//!
//! Every resident page owns one 4096-byte buffer for the lifetime of its
//! cache entry. Entries churn on every trim, so the buffers are recycled
//! through this pool instead of hitting the allocator each time. The pool is
//! sized to the cache's `max_pages`; when a workload pins more pages than
//! that, `acquire` falls through to a fresh heap allocation and the excess is
//! dropped on release, so the retained footprint stays bounded.
//!
//! ## Design
//!
//! `PooledBuf` uses `ManuallyDrop` instead of `Option` to make invalid states
//! unrepresentable: the buffer is always valid until `Drop` returns it to the
//! pool. Buffer contents are NOT cleared on recycle — callers that need zeroed
//! or file-backed contents overwrite the buffer themselves.

use crate::config::PAGE_SIZE;
use parking_lot::Mutex;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// A bounded pool of reusable page-sized buffers.
///
/// Cloning shares the pool; buffers return to it when dropped.
pub struct PagePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<Box<[u8; PAGE_SIZE]>>>,
    capacity: usize,
}

impl PagePool {
    /// Create a pool retaining at most `capacity` idle buffers.
    ///
    /// Buffers are allocated lazily on first acquire, not up front; a cache
    /// that never fills keeps its footprint proportional to what it touched.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
            }),
        }
    }

    /// Hand out a buffer, recycled if one is idle, freshly allocated if not.
    ///
    /// Recycled buffers keep their previous contents.
    pub fn acquire(&self) -> PooledBuf {
        let recycled = self.inner.free.lock().pop();
        let buf = recycled.unwrap_or_else(|| Box::new([0u8; PAGE_SIZE]));

        PooledBuf {
            buf: ManuallyDrop::new(buf),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Number of idle buffers currently held.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// The retained-buffer bound this pool was created with.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl Clone for PagePool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A page buffer that returns to its pool when dropped.
///
/// Derefs to `[u8; PAGE_SIZE]`.
pub struct PooledBuf {
    /// Always valid until Drop; ManuallyDrop lets Drop take ownership
    /// without moving out of self.
    buf: ManuallyDrop<Box<[u8; PAGE_SIZE]>>,
    pool: Arc<PoolInner>,
}

impl PooledBuf {
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut_slice()
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf").finish_non_exhaustive()
    }
}

impl Deref for PooledBuf {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        // SAFETY: drop runs once; the buffer is valid until this point and
        // ManuallyDrop::take moves it out exactly here.
        let buf = unsafe { ManuallyDrop::take(&mut self.buf) };
        let mut free = self.pool.free.lock();
        if free.len() < self.pool.capacity {
            free.push(buf);
        }
    }
}
