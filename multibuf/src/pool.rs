//! Bounded pool of receive buffers with blocking admission control.
//!
//! The pool pre-populates `min_buffers`, grows lazily up to `max_buffers`, and
//! never shrinks. Once every buffer is busy, [`BufferPool::acquire`] blocks
//! the caller until a buffer is reclaimed — this is deliberate backpressure:
//! receive posting stalls until consumers drain frames, bounding memory under
//! load. Exhaustion is not an error; only disposal is.
//!
//! # Locking
//!
//! A single pool-wide mutex guards the free and busy lists and the disposed
//! flag. Buffer-internal locks are leaf locks: a buffer lock is never held
//! while acquiring the pool lock (see [`crate::buffer`]), which rules out
//! lock-ordering deadlocks between the two tiers.

use crate::{buffer::PooledBuffer, Error};
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};
use tracing::{debug, trace};

/// Configuration for a [`BufferPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Fixed capacity of every buffer, in bytes.
    pub buffer_size: usize,
    /// Number of buffers allocated at construction.
    pub min_buffers: usize,
    /// Hard cap on the number of buffers; acquisition blocks at this bound.
    pub max_buffers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: 200 * 1024,
            min_buffers: 4,
            max_buffers: 64,
        }
    }
}

impl PoolConfig {
    /// Validates the configuration, panicking on invalid values.
    ///
    /// # Panics
    ///
    /// - `buffer_size` is zero
    /// - `min_buffers` is zero
    /// - `max_buffers < min_buffers`
    fn validate(&self) {
        assert!(self.buffer_size > 0, "buffer_size must be non-zero");
        assert!(self.min_buffers > 0, "min_buffers must be non-zero");
        assert!(
            self.max_buffers >= self.min_buffers,
            "max_buffers ({}) must be >= min_buffers ({})",
            self.max_buffers,
            self.min_buffers
        );
    }
}

/// Metrics for the buffer pool.
struct PoolMetrics {
    /// Number of buffers currently busy (out of the pool).
    busy: Gauge,
    /// Number of buffers available in the free list.
    available: Gauge,
    /// Total number of successful acquisitions.
    acquisitions_total: Counter,
    /// Total number of acquisitions that had to block on a saturated pool.
    waits_total: Counter,
    /// Total number of explicit evictions.
    evictions_total: Counter,
}

impl PoolMetrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            busy: Gauge::default(),
            available: Gauge::default(),
            acquisitions_total: Counter::default(),
            waits_total: Counter::default(),
            evictions_total: Counter::default(),
        };

        registry.register(
            "receive_buffers_busy",
            "Number of receive buffers currently out of the pool",
            metrics.busy.clone(),
        );
        registry.register(
            "receive_buffers_available",
            "Number of receive buffers in the free list",
            metrics.available.clone(),
        );
        registry.register(
            "receive_buffer_acquisitions_total",
            "Total number of successful buffer acquisitions",
            metrics.acquisitions_total.clone(),
        );
        registry.register(
            "receive_buffer_waits_total",
            "Total number of acquisitions that blocked on a saturated pool",
            metrics.waits_total.clone(),
        );
        registry.register(
            "receive_buffer_evictions_total",
            "Total number of explicit busy-buffer evictions",
            metrics.evictions_total.clone(),
        );

        metrics
    }
}

struct PoolState {
    free: VecDeque<Arc<PooledBuffer>>,
    /// Busy buffers in acquisition order (oldest first).
    busy: Vec<Arc<PooledBuffer>>,
    /// Total buffers ever created (also the next buffer id).
    total: usize,
    disposed: bool,
}

/// Shared pool state reachable from buffers via a weak reference, so that
/// reclamation can return a buffer without the buffer owning the pool.
pub(crate) struct PoolShared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    reclaimed: Condvar,
    metrics: PoolMetrics,
}

impl PoolShared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves a reclaimed buffer from busy to free and wakes one waiter.
    /// Invoked from buffer reclamation, never directly by callers. A buffer
    /// no longer present in the busy list (already released, or the pool was
    /// disposed) is dropped on the floor.
    pub(crate) fn release(&self, buffer: Arc<PooledBuffer>) {
        let mut state = self.state();
        if state.disposed {
            return;
        }
        let Some(index) = state.busy.iter().position(|b| Arc::ptr_eq(b, &buffer)) else {
            return;
        };
        state.busy.remove(index);
        state.free.push_back(buffer);
        self.metrics.busy.dec();
        self.metrics.available.inc();
        drop(state);
        self.reclaimed.notify_one();
    }
}

/// A bounded pool of fixed-size receive buffers.
///
/// Cheaply cloneable; all clones share the same pool.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Creates a pool pre-populated with `min_buffers` buffers, registering
    /// its metrics against `registry`.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn new(config: PoolConfig, registry: &mut Registry) -> Self {
        config.validate();
        let metrics = PoolMetrics::new(registry);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                free: VecDeque::with_capacity(config.min_buffers),
                busy: Vec::new(),
                total: 0,
                disposed: false,
            }),
            reclaimed: Condvar::new(),
            metrics,
            config,
        });

        {
            let mut state = shared.state();
            for id in 0..shared.config.min_buffers {
                let buffer = PooledBuffer::new(id, shared.config.buffer_size, Arc::downgrade(&shared));
                state.free.push_back(buffer);
            }
            state.total = shared.config.min_buffers;
            shared.metrics.available.set(state.free.len() as i64);
        }

        Self { shared }
    }

    /// Acquires a buffer for receiving, blocking while the pool is saturated.
    ///
    /// Returns a free buffer if one is available, lazily allocates a new one
    /// while under `max_buffers`, and otherwise waits until a buffer is
    /// reclaimed. The returned buffer is marked receiving and tracked in the
    /// busy list.
    ///
    /// # Errors
    ///
    /// [`Error::PoolClosed`] if the pool is disposed before or while waiting.
    pub fn acquire(&self) -> Result<Arc<PooledBuffer>, Error> {
        let shared = &self.shared;
        let mut state = shared.state();
        loop {
            if state.disposed {
                return Err(Error::PoolClosed);
            }
            if let Some(buffer) = state.free.pop_front() {
                buffer.mark_receiving();
                state.busy.push(Arc::clone(&buffer));
                shared.metrics.available.dec();
                shared.metrics.busy.inc();
                shared.metrics.acquisitions_total.inc();
                trace!(buffer = buffer.id(), "buffer acquired");
                return Ok(buffer);
            }
            if state.total < shared.config.max_buffers {
                let buffer = PooledBuffer::new(
                    state.total,
                    shared.config.buffer_size,
                    Arc::downgrade(shared),
                );
                state.total += 1;
                buffer.mark_receiving();
                state.busy.push(Arc::clone(&buffer));
                shared.metrics.busy.inc();
                shared.metrics.acquisitions_total.inc();
                trace!(buffer = buffer.id(), "buffer allocated");
                return Ok(buffer);
            }
            // Saturated: wait for a reclamation, re-checking the predicate on
            // every wakeup (spurious wakeups, lost races to other waiters).
            shared.metrics.waits_total.inc();
            state = shared
                .reclaimed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Forcibly reclaims the oldest busy buffer that is eligible (not
    /// receiving, no live fragments). Returns whether a buffer was reclaimed.
    ///
    /// Drained buffers normally return to the free list on their own the
    /// moment the last fragment drops; this is an explicit recovery hook and
    /// never touches a buffer still targeted by an in-flight receive.
    pub fn evict_oldest_busy(&self) -> bool {
        let oldest = self.shared.state().busy.first().cloned();
        let Some(buffer) = oldest else {
            return false;
        };
        if buffer.try_free() {
            self.shared.metrics.evictions_total.inc();
            debug!(buffer = buffer.id(), "busy buffer evicted");
            true
        } else {
            false
        }
    }

    /// Disposes the pool: drains both lists and wakes every waiter so blocked
    /// acquisitions fail fast with [`Error::PoolClosed`] instead of hanging.
    ///
    /// Buffers still referenced by live fragments stay valid until those
    /// fragments drop; their storage is then released rather than recycled.
    pub fn dispose(&self) {
        {
            let mut state = self.shared.state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.free.clear();
            state.busy.clear();
            self.shared.metrics.available.set(0);
            self.shared.metrics.busy.set(0);
        }
        debug!("buffer pool disposed");
        self.shared.reclaimed.notify_all();
    }

    /// Number of buffers currently busy.
    pub fn busy(&self) -> usize {
        self.shared.state().busy.len()
    }

    /// Number of buffers in the free list.
    pub fn idle(&self) -> usize {
        self.shared.state().free.len()
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("BufferPool")
            .field("config", &self.shared.config)
            .field("free", &state.free.len())
            .field("busy", &state.busy.len())
            .field("total", &state.total)
            .field("disposed", &state.disposed)
            .finish()
    }
}
