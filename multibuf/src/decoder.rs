//! Incremental frame decoding over a [`FrameStream`].
//!
//! Each connection owns one [`FrameDecoder`]: a state machine that pulls a
//! fixed-width ASCII-decimal length header, an optional command-type tag, a
//! payload-length sub-header, and finally exactly that many payload bytes,
//! then invokes an opaque [`CommandDecoder`] keyed by the tag. Partial frames
//! are the expected steady state: the decoder parks its progress and reports
//! [`DecodeOutcome::NeedMoreData`] until the caller feeds more fragments.
//!
//! # Wire Format
//!
//! For connections negotiated at or above [`TYPED_PROTOCOL_MIN_VERSION`]:
//!
//! ```text
//! +------------+-----------+----------------+------------------+
//! | total len  | type tag  | payload len    | payload          |
//! | 10B ASCII  | 2B LE i16 | 10B ASCII      | payload-len bytes|
//! +------------+-----------+----------------+------------------+
//! ```
//!
//! with `total = 2 + 10 + payload_len`. Older connections omit the type tag
//! (`total = 10 + payload_len`) and every frame decodes as tag `0`, the
//! generic command shape. ASCII length fields hold decimal digits padded with
//! NUL or space to the fixed width.
//!
//! Malformed or inconsistent headers are fatal: byte alignment with the peer
//! cannot be recovered, so the connection must be closed rather than retried.

use crate::{buffer::Fragment, stream::FrameStream, Error};
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

/// Width in bytes of the ASCII-decimal length headers.
pub const LENGTH_HEADER_SIZE: usize = 10;

/// Width in bytes of the command-type tag.
pub const TYPE_TAG_SIZE: usize = std::mem::size_of::<i16>();

/// Minimum negotiated client protocol version that puts a type tag on the
/// wire.
pub const TYPED_PROTOCOL_MIN_VERSION: u32 = 5000;

/// Decodes a fully assembled payload into a command object, keyed by the
/// frame's type tag. Tag `0` is the generic/default command shape.
///
/// Implementations are supplied by the dispatch layer (e.g. a lookup table of
/// per-type deserializers); the framing layer only guarantees that `payload`
/// holds exactly the declared number of contiguous bytes.
pub trait CommandDecoder {
    type Command;

    /// Decodes `payload` as a command of type `type_tag`.
    ///
    /// # Errors
    ///
    /// [`Error::PayloadDecode`] if the bytes do not form a valid command of
    /// that type.
    fn decode(&self, type_tag: i16, payload: &[u8]) -> Result<Self::Command, Error>;
}

/// Result of one decode attempt.
#[derive(Debug)]
pub enum DecodeOutcome<C> {
    /// A full frame was assembled and decoded. The caller should keep calling
    /// [`FrameDecoder::try_decode_next`] — more complete frames may already be
    /// buffered from the same receive.
    FrameReady { command: C, type_tag: i16 },
    /// Not enough bytes buffered to make progress. Not an error: re-drive the
    /// decoder on the next socket-completion event.
    NeedMoreData,
}

/// Configuration for a [`FrameDecoder`].
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Negotiated protocol version of the client; determines whether frames
    /// carry a type tag.
    pub client_version: u32,
    /// Maximum accepted declared frame length (in bytes). Guards against
    /// memory exhaustion from hostile or desynchronized length headers.
    pub max_frame_len: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            client_version: TYPED_PROTOCOL_MIN_VERSION,
            max_frame_len: 16 * 1024 * 1024,
        }
    }
}

impl DecoderConfig {
    fn validate(&self) {
        assert!(self.max_frame_len > 0, "max_frame_len must be non-zero");
    }

    fn typed(&self) -> bool {
        self.client_version >= TYPED_PROTOCOL_MIN_VERSION
    }

    /// Bytes of header following the total-length field: the optional type
    /// tag plus the payload-length sub-header.
    fn header_span(&self) -> usize {
        if self.typed() {
            TYPE_TAG_SIZE + LENGTH_HEADER_SIZE
        } else {
            LENGTH_HEADER_SIZE
        }
    }
}

enum State {
    /// Waiting for the fixed-width total-length header of the next frame.
    ReadLength,
    /// Waiting for the frame's inner headers and payload.
    ReadCommand,
}

/// Per-connection incremental frame decoder.
///
/// Owns the connection's [`FrameStream`]; the connection feeds fragments in
/// with [`Self::add_fragment`] and drives decoding with
/// [`Self::try_decode_next`] — once per socket-completion event, then in a
/// loop while it returns [`DecodeOutcome::FrameReady`].
///
/// Decoding for one connection is externally serialized (completions for a
/// connection are dispatched one at a time), so the decoder itself needs no
/// internal locking.
pub struct FrameDecoder<D> {
    decoder: D,
    config: DecoderConfig,
    stream: FrameStream,
    state: State,
    /// Declared total length of the frame in progress.
    frame_length: usize,
    /// Payload bytes still owed for the frame in progress.
    expected_remaining: usize,
    /// Type tag of the frame in progress.
    type_tag: i16,
    /// Accumulates the payload of the frame in progress. Exists iff a partial
    /// payload has been seen.
    payload: Option<BytesMut>,
    /// Bytes of `payload` filled so far.
    payload_filled: usize,
    /// Scratch for reading length headers.
    length_buf: [u8; LENGTH_HEADER_SIZE],
}

impl<D: CommandDecoder> FrameDecoder<D> {
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn new(decoder: D, config: DecoderConfig) -> Self {
        config.validate();
        Self {
            decoder,
            config,
            stream: FrameStream::new(),
            state: State::ReadLength,
            frame_length: 0,
            expected_remaining: 0,
            type_tag: 0,
            payload: None,
            payload_filled: 0,
            length_buf: [0u8; LENGTH_HEADER_SIZE],
        }
    }

    /// Appends newly received bytes to the connection's stream.
    pub fn add_fragment(&mut self, fragment: Fragment) {
        self.stream.add_fragment(fragment);
    }

    /// Whether any unconsumed bytes are buffered.
    pub fn has_any_data(&self) -> bool {
        self.stream.has_any_data()
    }

    /// Drops all buffered fragments, returning their references to the owning
    /// buffers. Called on connection teardown.
    pub fn reset(&mut self) {
        self.stream.clear();
        self.state = State::ReadLength;
        self.frame_length = 0;
        self.expected_remaining = 0;
        self.type_tag = 0;
        self.payload = None;
        self.payload_filled = 0;
    }

    /// Attempts to decode the next frame from the buffered bytes.
    ///
    /// Returns at most one decoded command per call; callers loop while
    /// frames keep completing. All partial progress (headers read, payload
    /// bytes accumulated) survives across calls.
    ///
    /// # Errors
    ///
    /// - [`Error::FramingDesync`] / [`Error::FrameTooLarge`]: fatal; the
    ///   caller must close the connection.
    /// - [`Error::PayloadDecode`]: the frame was well-framed but its payload
    ///   was rejected. The decoder has already realigned on the next frame,
    ///   but unless the protocol guarantees payload errors cannot accompany
    ///   desync, callers should treat this as connection-ending too.
    pub fn try_decode_next(&mut self) -> Result<DecodeOutcome<D::Command>, Error> {
        loop {
            match self.state {
                State::ReadLength => {
                    if !self.stream.ensure_data(LENGTH_HEADER_SIZE) {
                        return Ok(DecodeOutcome::NeedMoreData);
                    }
                    self.read_exact_header()?;
                    let total = parse_ascii_length(&self.length_buf)?;
                    if total > self.config.max_frame_len {
                        warn!(declared = total, "frame exceeds maximum length");
                        return Err(Error::FrameTooLarge(total));
                    }
                    if total < self.config.header_span() {
                        warn!(declared = total, "frame shorter than its headers");
                        return Err(Error::FramingDesync(format!(
                            "declared frame length {} shorter than header span {}",
                            total,
                            self.config.header_span()
                        )));
                    }
                    self.frame_length = total;
                    self.state = State::ReadCommand;
                }
                State::ReadCommand => return self.read_command(),
            }
        }
    }

    fn read_command(&mut self) -> Result<DecodeOutcome<D::Command>, Error> {
        // No partial payload yet: the frame's inner headers are still on the
        // wire. They are read in one step, so all of them must be buffered.
        if self.payload.is_none() {
            let span = self.config.header_span();
            if !self.stream.ensure_data(span) {
                return Ok(DecodeOutcome::NeedMoreData);
            }

            if self.config.typed() {
                let mut tag = [0u8; TYPE_TAG_SIZE];
                self.stream.open_window(TYPE_TAG_SIZE);
                let n = self.stream.read(&mut tag);
                debug_assert_eq!(n, TYPE_TAG_SIZE);
                self.type_tag = i16::from_le_bytes(tag);
            } else {
                self.type_tag = 0;
            }

            self.read_exact_header()?;
            let payload_len = parse_ascii_length(&self.length_buf)?;
            if payload_len != self.frame_length - span {
                warn!(
                    declared = self.frame_length,
                    payload = payload_len,
                    "length headers disagree"
                );
                return Err(Error::FramingDesync(format!(
                    "payload length {} does not match declared frame length {}",
                    payload_len, self.frame_length
                )));
            }

            self.expected_remaining = payload_len;
            self.payload = Some(BytesMut::zeroed(payload_len));
            self.payload_filled = 0;
        }

        // Pull whatever portion of the payload is buffered.
        if self.expected_remaining > 0 && self.stream.has_any_data() {
            let take = self.expected_remaining.min(self.stream.available());
            self.stream.open_window(take);
            let payload = self
                .payload
                .as_mut()
                .ok_or_else(|| Error::FramingDesync("payload buffer missing".into()))?;
            let n = self
                .stream
                .read(&mut payload[self.payload_filled..self.payload_filled + take]);
            self.payload_filled += n;
            self.expected_remaining -= n;
        }

        if self.expected_remaining > 0 {
            return Ok(DecodeOutcome::NeedMoreData);
        }

        // Full payload assembled: reset framing state before decoding so a
        // payload-level failure leaves the decoder aligned on the next frame.
        let payload: Bytes = self
            .payload
            .take()
            .ok_or_else(|| Error::FramingDesync("payload buffer missing".into()))?
            .freeze();
        let type_tag = self.type_tag;
        self.type_tag = 0;
        self.payload_filled = 0;
        self.frame_length = 0;
        self.state = State::ReadLength;

        let command = self.decoder.decode(type_tag, &payload)?;
        debug!(type_tag, len = payload.len(), "frame decoded");
        Ok(DecodeOutcome::FrameReady { command, type_tag })
    }

    /// Reads exactly one fixed-width length header into the scratch buffer.
    /// Callers have already verified availability via `ensure_data`.
    fn read_exact_header(&mut self) -> Result<(), Error> {
        self.stream.open_window(LENGTH_HEADER_SIZE);
        let n = self.stream.read(&mut self.length_buf);
        if n != LENGTH_HEADER_SIZE {
            return Err(Error::FramingDesync(format!(
                "length header truncated: {} of {} bytes",
                n, LENGTH_HEADER_SIZE
            )));
        }
        Ok(())
    }
}

impl<D> std::fmt::Debug for FrameDecoder<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecoder")
            .field(
                "state",
                match self.state {
                    State::ReadLength => &"ReadLength",
                    State::ReadCommand => &"ReadCommand",
                },
            )
            .field("frame_length", &self.frame_length)
            .field("expected_remaining", &self.expected_remaining)
            .field("buffered", &self.stream.available())
            .finish()
    }
}

/// Parses a fixed-width ASCII-decimal length field. Digits may be padded with
/// NUL or space to the field width (the sender writes digits into a zeroed
/// fixed-size region).
fn parse_ascii_length(buf: &[u8]) -> Result<usize, Error> {
    let text = std::str::from_utf8(buf)
        .map_err(|_| Error::FramingDesync("length header is not UTF-8".into()))?;
    let digits = text.trim_matches(|c| c == '\0' || c == ' ');
    if digits.is_empty() {
        return Err(Error::FramingDesync("empty length header".into()));
    }
    digits
        .parse::<usize>()
        .map_err(|_| Error::FramingDesync(format!("invalid length header {digits:?}")))
}
