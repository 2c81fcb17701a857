//! Error types for the receive pipeline.

use thiserror::Error;

/// Errors surfaced by the buffer pool and the framing layer.
///
/// Framing errors are fatal for the connection they occur on: once a length
/// header fails to parse, byte alignment with the peer is unrecoverable and
/// the connection must be torn down rather than retried. Partial data is never
/// an error (it is the steady-state case under real network conditions) and is
/// signaled by [`crate::DecodeOutcome::NeedMoreData`] instead.
#[derive(Error, Debug)]
pub enum Error {
    /// A length header was not parseable as ASCII decimal, or the two length
    /// headers of a frame disagree. The connection is desynchronized.
    #[error("framing desync: {0}")]
    FramingDesync(String),
    /// The declared frame length exceeds the configured maximum.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    /// The command decoder rejected a fully assembled payload.
    #[error("payload decode failed: {0}")]
    PayloadDecode(String),
    /// The buffer pool was disposed while (or before) a caller tried to
    /// acquire a buffer. Terminal: callers must not retry.
    #[error("buffer pool closed")]
    PoolClosed,
}
