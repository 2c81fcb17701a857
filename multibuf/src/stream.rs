//! A read-only logical stream over a FIFO of buffer fragments.
//!
//! The decoder sees one contiguous byte sequence even though the bytes live in
//! arbitrary ranges of multiple pooled buffers. Reads are windowed: the
//! decoder declares the exact byte budget of the next sub-field with
//! [`FrameStream::open_window`] and reads within it, so no random access or
//! cross-fragment seeking (and therefore no wholesale copying) is ever needed.
//! Protocol fields all have fixed or previously-declared lengths, which makes
//! this sufficient.
//!
//! The stream never blocks: a short read means "not enough yet" and the caller
//! re-drives the decoder on the next socket-completion event.

use crate::buffer::Fragment;
use std::collections::VecDeque;

/// Insertion-ordered queue of fragments presenting a contiguous view of a
/// connection's received bytes.
pub struct FrameStream {
    /// Oldest fragment first; bytes must be consumed in arrival order or
    /// frame boundaries would corrupt.
    fragments: VecDeque<Fragment>,
    /// Total unread bytes across all fragments.
    available: usize,
    /// Remaining byte budget of the currently open read window.
    window: usize,
}

impl FrameStream {
    pub fn new() -> Self {
        Self {
            fragments: VecDeque::new(),
            available: 0,
            window: 0,
        }
    }

    /// Appends a fragment to the back of the queue. O(1).
    pub fn add_fragment(&mut self, fragment: Fragment) {
        self.available += fragment.remaining();
        self.fragments.push_back(fragment);
    }

    /// Whether at least `n` bytes are buffered.
    pub fn ensure_data(&self, n: usize) -> bool {
        self.available >= n
    }

    /// Whether any unread bytes are buffered.
    pub fn has_any_data(&self) -> bool {
        self.available > 0
    }

    /// Total unread bytes across all fragments.
    pub fn available(&self) -> usize {
        self.available
    }

    /// Declares the byte budget for the next sequence of reads. Subsequent
    /// [`Self::read`] calls yield at most `n` bytes in total, even if more are
    /// buffered.
    pub fn open_window(&mut self, n: usize) {
        self.window = n;
    }

    /// Remaining budget of the open window.
    pub fn window_remaining(&self) -> usize {
        self.window
    }

    /// Copies up to `min(dst.len(), window, available)` bytes from the front
    /// of the queue into `dst`, removing fragments as they drain. Returns the
    /// number of bytes copied; a short read means the window or the buffered
    /// data ran out. Never blocks.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let budget = dst.len().min(self.window).min(self.available);
        let mut copied = 0;
        while copied < budget {
            let Some(fragment) = self.fragments.front_mut() else {
                break;
            };
            copied += fragment.read_into(&mut dst[copied..budget]);
            if fragment.is_drained() {
                // Dropping the fragment releases its reference on the owning
                // buffer, which may return the buffer to the pool.
                self.fragments.pop_front();
            }
        }
        self.available -= copied;
        self.window -= copied;
        copied
    }

    /// Drops all queued fragments. Each drop releases its buffer reference,
    /// so teardown drains fragment counts back to the owning buffers.
    pub fn clear(&mut self) {
        self.fragments.clear();
        self.available = 0;
        self.window = 0;
    }
}

impl Default for FrameStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStream")
            .field("fragments", &self.fragments.len())
            .field("available", &self.available)
            .field("window", &self.window)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{detached, Fragment, PooledBuffer};
    use rand::Rng;
    use std::sync::Arc;

    fn fragment_from(buffer: &Arc<PooledBuffer>, data: &[u8]) -> Fragment {
        let (start, written) = buffer.write_with(|free| {
            free[..data.len()].copy_from_slice(data);
            data.len()
        });
        Fragment::new(Arc::clone(buffer), start, written)
    }

    #[test]
    fn test_read_across_fragment_boundaries() {
        let buffer = detached(64);
        let mut stream = FrameStream::new();
        stream.add_fragment(fragment_from(&buffer, b"hel"));
        stream.add_fragment(fragment_from(&buffer, b"lo "));
        stream.add_fragment(fragment_from(&buffer, b"world"));
        assert_eq!(stream.available(), 11);

        let mut out = [0u8; 11];
        stream.open_window(11);
        assert_eq!(stream.read(&mut out), 11);
        assert_eq!(&out, b"hello world");
        assert!(!stream.has_any_data());
    }

    #[test]
    fn test_no_loss_no_duplication_under_arbitrary_splits() {
        // P1: any chunking of the input reads back byte-identical.
        let mut rng = rand::thread_rng();
        let original: Vec<u8> = (0..2048).map(|_| rng.gen()).collect();

        for _ in 0..20 {
            let buffer = detached(4096);
            let mut stream = FrameStream::new();
            let mut offset = 0;
            while offset < original.len() {
                let chunk = rng.gen_range(1..=97.min(original.len() - offset));
                stream.add_fragment(fragment_from(&buffer, &original[offset..offset + chunk]));
                offset += chunk;
            }

            let mut out = vec![0u8; original.len()];
            let mut read = 0;
            // Read in odd-sized windows to exercise window reopening too.
            while read < out.len() {
                let window = 61.min(out.len() - read);
                stream.open_window(window);
                let n = stream.read(&mut out[read..read + window]);
                assert_eq!(n, window);
                read += n;
            }
            assert_eq!(out, original);
            assert!(!stream.has_any_data());
        }
    }

    #[test]
    fn test_window_caps_read() {
        // P2: a read never exceeds the open window, even with more buffered.
        let buffer = detached(64);
        let mut stream = FrameStream::new();
        stream.add_fragment(fragment_from(&buffer, b"0123456789"));

        let mut out = [0u8; 10];
        stream.open_window(4);
        assert_eq!(stream.read(&mut out), 4);
        assert_eq!(&out[..4], b"0123");
        // Window exhausted: nothing more until reopened.
        assert_eq!(stream.read(&mut out), 0);
        assert_eq!(stream.available(), 6);

        stream.open_window(6);
        assert_eq!(stream.read(&mut out[..6]), 6);
        assert_eq!(&out[..6], b"456789");
    }

    #[test]
    fn test_short_read_when_data_insufficient() {
        let buffer = detached(64);
        let mut stream = FrameStream::new();
        stream.add_fragment(fragment_from(&buffer, b"abc"));

        let mut out = [0u8; 8];
        stream.open_window(8);
        assert_eq!(stream.read(&mut out), 3);
        assert!(!stream.ensure_data(1));
        assert_eq!(stream.window_remaining(), 5);
    }

    #[test]
    fn test_drained_fragments_release_buffer() {
        // P3: consuming every fragment returns the buffer's accounting.
        let buffer = detached(64);
        buffer.mark_receiving();
        let mut stream = FrameStream::new();
        stream.add_fragment(fragment_from(&buffer, &[1u8; 16]));
        stream.add_fragment(fragment_from(&buffer, &[2u8; 16]));
        buffer.finish_receiving();
        assert_eq!(buffer.fragment_count(), 2);

        let mut out = [0u8; 32];
        stream.open_window(32);
        assert_eq!(stream.read(&mut out), 32);
        assert_eq!(buffer.fragment_count(), 0);
        // Cursors reset: the buffer was reclaimed.
        assert_eq!(buffer.remaining_capacity(), 64);
    }

    #[test]
    fn test_clear_drains_fragment_counts() {
        // Teardown with unread fragments must not strand the buffer.
        let buffer = detached(64);
        buffer.mark_receiving();
        let mut stream = FrameStream::new();
        stream.add_fragment(fragment_from(&buffer, &[3u8; 20]));
        buffer.finish_receiving();

        stream.clear();
        assert_eq!(buffer.fragment_count(), 0);
        assert_eq!(buffer.remaining_capacity(), 64);
        assert!(!stream.has_any_data());
    }

    #[test]
    fn test_ensure_data() {
        let buffer = detached(64);
        let mut stream = FrameStream::new();
        assert!(!stream.ensure_data(1));
        assert!(stream.ensure_data(0));
        stream.add_fragment(fragment_from(&buffer, b"xyz"));
        assert!(stream.ensure_data(3));
        assert!(!stream.ensure_data(4));
    }
}
