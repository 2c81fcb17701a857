//! Pooled receive buffers and the fragments that reference them.
//!
//! A [`PooledBuffer`] is a fixed-capacity region of recycled storage that a
//! socket writes into and the frame decoder reads out of. The two paths run on
//! different worker threads, so all cursor and refcount mutation goes through
//! a single per-buffer mutex.
//!
//! # Buffer Layout
//!
//! ```text
//! [0..............read_index..........write_index...........capacity]
//!  ^               ^                   ^                     ^
//!  |               |                   |                     |
//!  storage start   next unread byte    next free byte        storage end
//!
//! Regions:
//! - [0..read_index]:            consumed by the decoder via fragments
//! - [read_index..write_index]:  received, not yet consumed
//! - [write_index..capacity]:    free, available to the next socket receive
//! ```
//!
//! # Invariants
//!
//! - `read_index <= write_index <= capacity`
//! - A buffer is reclaimable iff it is not `receiving` and no live
//!   [`Fragment`] references it.
//! - Storage is recycled, never freed while the pool lives: reclamation resets
//!   the indices to zero and returns the buffer to the pool's free list.
//!
//! # Locking
//!
//! The buffer lock is a leaf lock: it is never held across a call into the
//! pool. Reclamation decides eligibility and resets the indices under the
//! buffer lock, releases it, and only then hands the buffer back to the pool.

use crate::pool::PoolShared;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::trace;

/// A fixed-capacity receive buffer owned by a [`crate::BufferPool`].
///
/// Shared between the I/O-completion path (which appends received bytes) and
/// the decode path (which consumes them through [`Fragment`]s). Handed out as
/// `Arc<PooledBuffer>`; the pool keeps its own reference while the buffer is
/// busy.
pub struct PooledBuffer {
    id: usize,
    capacity: usize,
    state: Mutex<BufferState>,
    pool: Weak<PoolShared>,
}

struct BufferState {
    storage: Box<[u8]>,
    write_index: usize,
    read_index: usize,
    fragment_count: usize,
    receiving: bool,
}

impl PooledBuffer {
    pub(crate) fn new(id: usize, capacity: usize, pool: Weak<PoolShared>) -> Arc<Self> {
        Arc::new(Self {
            id,
            capacity,
            state: Mutex::new(BufferState {
                storage: vec![0u8; capacity].into_boxed_slice(),
                write_index: 0,
                read_index: 0,
                fragment_count: 0,
                receiving: false,
            }),
            pool,
        })
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Identifier assigned by the owning pool (stable across reuse).
    pub fn id(&self) -> usize {
        self.id
    }

    /// Total storage capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes received but not yet consumed (`write_index - read_index`).
    pub fn unread_bytes(&self) -> usize {
        let state = self.state();
        state.write_index - state.read_index
    }

    /// Free bytes available to the next receive (`capacity - write_index`).
    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.state().write_index
    }

    /// Whether the buffer is currently targeted by an in-flight receive.
    pub fn is_receiving(&self) -> bool {
        self.state().receiving
    }

    /// Number of live fragments referencing this buffer.
    pub fn fragment_count(&self) -> usize {
        self.state().fragment_count
    }

    /// Exposes the free region to the I/O layer and records how much of it was
    /// filled.
    ///
    /// `f` receives `storage[write_index..capacity]` and returns the number of
    /// bytes it wrote at the front of that slice; the write cursor advances by
    /// that amount. Returns `(start, written)` where `start` is the offset the
    /// bytes landed at, i.e. the range for the resulting [`Fragment`].
    ///
    /// # Panics
    ///
    /// Panics if `f` claims to have written more bytes than the free region
    /// holds.
    pub fn write_with<F>(&self, f: F) -> (usize, usize)
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let mut state = self.state();
        let start = state.write_index;
        let written = f(&mut state.storage[start..]);
        assert!(
            written <= self.capacity - start,
            "wrote past end of buffer free region"
        );
        state.write_index = start + written;
        (start, written)
    }

    /// Marks the buffer as the target of in-flight receives. Called by the
    /// pool on acquisition.
    pub(crate) fn mark_receiving(&self) {
        self.state().receiving = true;
    }

    /// Clears the receiving flag and attempts reclamation. Called when the
    /// connection swaps to a fresh buffer or tears down.
    pub fn finish_receiving(self: &Arc<Self>) {
        self.state().receiving = false;
        self.try_free();
    }

    /// Copies `dst.len()` bytes starting at `offset` out of the buffer and
    /// advances the read cursor. Only called by [`Fragment::read_into`], which
    /// guarantees the range was previously written and is consumed in FIFO
    /// order.
    pub(crate) fn read_at(&self, offset: usize, dst: &mut [u8]) {
        let mut state = self.state();
        debug_assert!(offset + dst.len() <= state.write_index);
        dst.copy_from_slice(&state.storage[offset..offset + dst.len()]);
        state.read_index += dst.len();
        debug_assert!(state.read_index <= state.write_index);
    }

    fn register_fragment(&self) {
        self.state().fragment_count += 1;
    }

    /// Drops one fragment reference and attempts reclamation.
    pub(crate) fn release_fragment(self: &Arc<Self>) {
        {
            let mut state = self.state();
            debug_assert!(state.fragment_count > 0);
            state.fragment_count -= 1;
        }
        self.try_free();
    }

    /// Reclaims the buffer if it is not receiving and fully drained: resets
    /// the cursors and returns it to the pool's free list. Returns whether the
    /// buffer was reclaimed.
    pub(crate) fn try_free(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state();
            if state.receiving || state.fragment_count > 0 {
                return false;
            }
            state.write_index = 0;
            state.read_index = 0;
        }
        trace!(buffer = self.id, "buffer reclaimed");
        if let Some(pool) = self.pool.upgrade() {
            pool.release(Arc::clone(self));
        }
        true
    }
}

// Manual Debug: the storage contents are noise, the counters are the signal.
impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("PooledBuffer")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("write_index", &state.write_index)
            .field("read_index", &state.read_index)
            .field("fragment_count", &state.fragment_count)
            .field("receiving", &state.receiving)
            .finish()
    }
}

/// One socket-receive's worth of bytes within a [`PooledBuffer`].
///
/// A fragment owns the byte range `[start, start + len)` of its buffer and a
/// local cursor tracking how much of it the decoder has consumed. Dropping a
/// fragment (drained or not) releases its reference on the buffer, which may
/// return the buffer to the pool. Abrupt stream teardown therefore never leaks
/// buffers.
pub struct Fragment {
    buffer: Arc<PooledBuffer>,
    start: usize,
    len: usize,
    cursor: usize,
}

impl Fragment {
    /// Creates a fragment over `[start, start + len)` of `buffer`, taking a
    /// reference on the buffer.
    pub fn new(buffer: Arc<PooledBuffer>, start: usize, len: usize) -> Self {
        debug_assert!(start + len <= buffer.capacity());
        buffer.register_fragment();
        Self {
            buffer,
            start,
            len,
            cursor: 0,
        }
    }

    /// Total bytes this fragment covers.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the fragment covers zero bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.len - self.cursor
    }

    /// Whether every byte of the fragment has been consumed.
    pub fn is_drained(&self) -> bool {
        self.cursor == self.len
    }

    /// Copies up to `dst.len()` unconsumed bytes into `dst`, advancing the
    /// fragment cursor and the owning buffer's read cursor. Returns the number
    /// of bytes copied (possibly zero). Never blocks.
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.remaining());
        if n == 0 {
            return 0;
        }
        self.buffer.read_at(self.start + self.cursor, &mut dst[..n]);
        self.cursor += n;
        n
    }
}

impl Drop for Fragment {
    fn drop(&mut self) {
        self.buffer.release_fragment();
    }
}

impl std::fmt::Debug for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fragment")
            .field("buffer", &self.buffer.id())
            .field("start", &self.start)
            .field("len", &self.len)
            .field("cursor", &self.cursor)
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn detached(capacity: usize) -> Arc<PooledBuffer> {
    PooledBuffer::new(0, capacity, Weak::new())
}
