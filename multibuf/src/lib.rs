//! Pooled receive buffers and pipelined frame decoding for socket servers.
//!
//! Client connections deliver commands as length-prefixed frames, and the
//! network hands them over with no respect for those boundaries: one receive
//! may carry half a frame, or three frames and the first bytes of a fourth.
//! This crate implements the ingestion path that copes with that, without
//! per-receive allocation:
//!
//! - [`BufferPool`] — a bounded pool of fixed-size receive buffers. Sockets
//!   write into pooled storage; a saturated pool blocks acquisition, which
//!   backpressures receive posting instead of growing memory without bound.
//! - [`PooledBuffer`] / [`Fragment`] — recycled buffer storage and the
//!   refcounted byte ranges that individual receives carve out of it. A
//!   buffer returns to the pool exactly when no receive targets it and every
//!   fragment referencing it has been consumed or dropped.
//! - [`FrameStream`] — a contiguous, windowed read view over a FIFO of
//!   fragments, so the decoder never sees the buffer seams.
//! - [`FrameDecoder`] — an incremental state machine that assembles
//!   length-prefixed frames from the stream and hands completed payloads to a
//!   caller-supplied [`CommandDecoder`]. Partial input parks the state
//!   machine; it never blocks and never loses progress.
//! - [`ReceiveState`] — the per-connection composition of all of the above,
//!   including transparent buffer swap when the current buffer fills.
//!
//! # Example
//!
//! ```
//! use multibuf::{
//!     mocks::{EchoDecoder, FrameBuilder},
//!     BufferPool, DecodeOutcome, DecoderConfig, FrameDecoder, PoolConfig, ReceiveState,
//! };
//! use prometheus_client::registry::Registry;
//!
//! let mut registry = Registry::default();
//! let pool = BufferPool::new(PoolConfig::default(), &mut registry);
//! let decoder = FrameDecoder::new(EchoDecoder, DecoderConfig::default());
//! let mut connection = ReceiveState::new(pool, decoder)?;
//!
//! // A socket completion lands bytes in the connection's pooled buffer.
//! let frame = FrameBuilder::typed().frame(7, b"hello");
//! connection.receive_with(|free| {
//!     free[..frame.len()].copy_from_slice(&frame);
//!     frame.len()
//! })?;
//!
//! // Drive the decoder until it runs out of complete frames.
//! while let DecodeOutcome::FrameReady { command, type_tag } = connection.try_decode_next()? {
//!     assert_eq!(type_tag, 7);
//!     assert_eq!(command.payload.as_ref(), b"hello");
//! }
//! # Ok::<(), multibuf::Error>(())
//! ```

pub mod buffer;
pub mod connection;
pub mod decoder;
mod error;
pub mod mocks;
pub mod pool;
pub mod stream;

pub use buffer::{Fragment, PooledBuffer};
pub use connection::ReceiveState;
pub use decoder::{
    CommandDecoder, DecodeOutcome, DecoderConfig, FrameDecoder, LENGTH_HEADER_SIZE, TYPE_TAG_SIZE,
    TYPED_PROTOCOL_MIN_VERSION,
};
pub use error::Error;
pub use pool::{BufferPool, PoolConfig};
pub use stream::FrameStream;
