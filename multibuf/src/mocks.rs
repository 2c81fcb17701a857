//! Test doubles for the receive pipeline.
//!
//! [`FrameBuilder`] produces wire-format frames for driving the decoder, and
//! the mock [`CommandDecoder`] implementations stand in for a real command
//! dispatch table. Exported so downstream crates can test their own handling
//! without a live socket.

use crate::{
    decoder::{CommandDecoder, LENGTH_HEADER_SIZE, TYPED_PROTOCOL_MIN_VERSION},
    Error,
};
use bytes::Bytes;

/// Builds wire-format frames for a given negotiated protocol version.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    client_version: u32,
}

impl FrameBuilder {
    pub fn new(client_version: u32) -> Self {
        Self { client_version }
    }

    /// A builder for the current (typed) protocol.
    pub fn typed() -> Self {
        Self::new(TYPED_PROTOCOL_MIN_VERSION)
    }

    /// A builder for the legacy protocol without type tags.
    pub fn untyped() -> Self {
        Self::new(TYPED_PROTOCOL_MIN_VERSION - 1)
    }

    /// Encodes one frame. `type_tag` is ignored for untyped builders (the
    /// legacy protocol has no place for it on the wire).
    pub fn frame(&self, type_tag: i16, payload: &[u8]) -> Vec<u8> {
        let typed = self.client_version >= TYPED_PROTOCOL_MIN_VERSION;
        let header_span = if typed {
            std::mem::size_of::<i16>() + LENGTH_HEADER_SIZE
        } else {
            LENGTH_HEADER_SIZE
        };
        let total = header_span + payload.len();

        let mut out = Vec::with_capacity(LENGTH_HEADER_SIZE + total);
        out.extend_from_slice(&ascii_length(total));
        if typed {
            out.extend_from_slice(&type_tag.to_le_bytes());
        }
        out.extend_from_slice(&ascii_length(payload.len()));
        out.extend_from_slice(payload);
        out
    }
}

/// Renders `n` as ASCII decimal, NUL-padded to the fixed header width.
fn ascii_length(n: usize) -> [u8; LENGTH_HEADER_SIZE] {
    let digits = n.to_string();
    assert!(digits.len() <= LENGTH_HEADER_SIZE, "length does not fit header");
    let mut out = [0u8; LENGTH_HEADER_SIZE];
    out[..digits.len()].copy_from_slice(digits.as_bytes());
    out
}

/// The command produced by [`EchoDecoder`]: the frame's tag and payload,
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoCommand {
    pub type_tag: i16,
    pub payload: Bytes,
}

/// A [`CommandDecoder`] that accepts every payload and echoes it back.
#[derive(Debug, Clone, Default)]
pub struct EchoDecoder;

impl CommandDecoder for EchoDecoder {
    type Command = EchoCommand;

    fn decode(&self, type_tag: i16, payload: &[u8]) -> Result<EchoCommand, Error> {
        Ok(EchoCommand {
            type_tag,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// A [`CommandDecoder`] that rejects every payload.
#[derive(Debug, Clone, Default)]
pub struct RejectDecoder;

impl CommandDecoder for RejectDecoder {
    type Command = ();

    fn decode(&self, type_tag: i16, _payload: &[u8]) -> Result<(), Error> {
        Err(Error::PayloadDecode(format!(
            "rejected command of type {type_tag}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_frame_layout() {
        let frame = FrameBuilder::typed().frame(5, b"abc");
        // total = 2 (tag) + 10 (payload len) + 3 (payload) = 15
        assert_eq!(&frame[..2], b"15");
        assert_eq!(&frame[2..LENGTH_HEADER_SIZE], &[0u8; 8]);
        assert_eq!(&frame[10..12], &5i16.to_le_bytes());
        assert_eq!(&frame[12..13], b"3");
        assert_eq!(&frame[22..], b"abc");
    }

    #[test]
    fn test_untyped_frame_layout() {
        let frame = FrameBuilder::untyped().frame(5, b"abc");
        // total = 10 (payload len) + 3 (payload) = 13; no tag on the wire.
        assert_eq!(&frame[..2], b"13");
        assert_eq!(&frame[10..11], b"3");
        assert_eq!(&frame[20..], b"abc");
    }
}
