//! Per-connection receive state: ties a pool, a current buffer, and a decoder
//! together into the full ingestion path.
//!
//! One [`ReceiveState`] exists per client connection. Each socket completion
//! lands its bytes in the connection's current pooled buffer via
//! [`ReceiveState::receive_with`]; the filled range becomes a fragment queued
//! for the decoder, and when the buffer has no free space left the connection
//! transparently swaps to a fresh one from the pool (blocking if the pool is
//! saturated). Decoding is then driven with
//! [`ReceiveState::try_decode_next`] until it reports
//! [`DecodeOutcome::NeedMoreData`].

use crate::{
    buffer::{Fragment, PooledBuffer},
    decoder::{CommandDecoder, DecodeOutcome, FrameDecoder, LENGTH_HEADER_SIZE, TYPE_TAG_SIZE},
    pool::BufferPool,
    Error,
};
use std::sync::Arc;
use tracing::trace;

/// Low-water mark for buffer swap: once the current buffer's free region
/// drops below the largest header span, retire it and start the next receive
/// in a fresh buffer. Keeping headers out of tiny tail regions keeps receives
/// usefully sized; correctness does not depend on it (fragments reassemble
/// across buffers regardless).
const SWAP_THRESHOLD: usize = LENGTH_HEADER_SIZE + TYPE_TAG_SIZE + LENGTH_HEADER_SIZE;

/// Receive-side state of one client connection.
pub struct ReceiveState<D> {
    pool: BufferPool,
    decoder: FrameDecoder<D>,
    /// Buffer the next socket receive writes into. Held with its receiving
    /// flag set, so the pool will not reclaim it out from under the socket.
    current: Arc<PooledBuffer>,
}

impl<D: CommandDecoder> ReceiveState<D> {
    /// Binds a new connection to `pool`, acquiring its first receive buffer.
    ///
    /// Blocks if the pool is saturated.
    ///
    /// # Errors
    ///
    /// [`Error::PoolClosed`] if the pool was disposed.
    pub fn new(pool: BufferPool, decoder: FrameDecoder<D>) -> Result<Self, Error> {
        let current = pool.acquire()?;
        Ok(Self {
            pool,
            decoder,
            current,
        })
    }

    /// The buffer the next receive will write into.
    pub fn current_buffer(&self) -> &Arc<PooledBuffer> {
        &self.current
    }

    /// Whether any received bytes await decoding.
    pub fn has_any_data(&self) -> bool {
        self.decoder.has_any_data()
    }

    /// Lands one socket completion's worth of bytes.
    ///
    /// `f` is handed the current buffer's free region and returns how many
    /// bytes it filled at the front (a real caller copies out of the socket's
    /// completion here; zero means the peer sent nothing). The filled range is
    /// queued for the decoder. If the buffer's free region has dropped below
    /// the swap threshold, the connection first swaps to a freshly acquired
    /// buffer; the old buffer stays alive only as long as undecoded fragments
    /// reference it.
    ///
    /// # Errors
    ///
    /// [`Error::PoolClosed`] if a buffer swap was needed and the pool was
    /// disposed.
    pub fn receive_with<F>(&mut self, f: F) -> Result<usize, Error>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let threshold = SWAP_THRESHOLD.min(self.pool.config().buffer_size);
        if self.current.remaining_capacity() < threshold {
            self.swap_buffer()?;
        }
        let (start, written) = self.current.write_with(f);
        if written > 0 {
            self.decoder
                .add_fragment(Fragment::new(Arc::clone(&self.current), start, written));
        }
        Ok(written)
    }

    /// Attempts to decode the next buffered frame. See
    /// [`FrameDecoder::try_decode_next`].
    pub fn try_decode_next(&mut self) -> Result<DecodeOutcome<D::Command>, Error> {
        self.decoder.try_decode_next()
    }

    /// Tears the connection down: releases every buffered fragment and the
    /// current receive buffer back to the pool. Dropping the state does the
    /// same; this exists for call sites that want teardown to read as an
    /// action.
    pub fn close(mut self) {
        self.decoder.reset();
    }

    /// Retires the full buffer and acquires a fresh one. Ordering matters:
    /// the old buffer's receiving flag is cleared before blocking on the
    /// pool, otherwise a saturated pool could deadlock waiting on a buffer
    /// this connection is still pinning.
    fn swap_buffer(&mut self) -> Result<(), Error> {
        trace!(buffer = self.current.id(), "receive buffer exhausted, swapping");
        self.current.finish_receiving();
        self.current = self.pool.acquire()?;
        Ok(())
    }
}

impl<D> Drop for ReceiveState<D> {
    fn drop(&mut self) {
        // Undecoded fragments are dropped by the decoder's stream when it is
        // dropped; releasing the receiving flag here lets the current buffer
        // return to the pool once those references drain.
        self.current.finish_receiving();
    }
}

impl<D> std::fmt::Debug for ReceiveState<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveState")
            .field("current", &self.current.id())
            .field("decoder", &self.decoder)
            .finish()
    }
}
