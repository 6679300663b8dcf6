//! Byte stream ⇄ discrete frames.
//!
//! Two wire formats, one envelope per frame:
//!
//! - **Length-prefixed**: `u32` big-endian payload length, then the
//!   payload. Used on data channels where payloads may be large.
//! - **Line-delimited**: UTF-8 payload terminated by `\n`. Used on the
//!   stdio control channel. Embedded newlines are rejected at encode
//!   time rather than escaped, so a decoded frame is always exactly what
//!   was encoded.
//!
//! A framer instance owns its buffer across `push` calls; partial frames
//! are retained until completed. Any framing error means the stream can
//! no longer be trusted and the owning channel closes.

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;

use crate::buffer::ChunkBuffer;
use crate::error::{Error, Result};

/// Default maximum frame payload, 16 MiB.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Absolute ceiling on a length prefix (2³¹ − 1).
pub const FRAME_LENGTH_CEILING: usize = i32::MAX as usize;

const LENGTH_PREFIX: usize = 4;

/// Frames produced by a single `push`; inline for the common small case.
pub type FrameBatch = SmallVec<[Bytes; 4]>;

/// A stateful framer for one direction of one stream.
#[derive(Debug)]
pub enum Framing {
    LengthPrefixed(LengthPrefixed),
    LineDelimited(LineDelimited),
}

impl Framing {
    /// Length-prefixed framing with the default 16 MiB payload cap.
    #[must_use]
    pub fn length_prefixed() -> Self {
        Self::length_prefixed_with_max(DEFAULT_MAX_FRAME)
    }

    /// Length-prefixed framing with a custom payload cap.
    ///
    /// The cap is clamped to the protocol ceiling of 2³¹ − 1 bytes.
    #[must_use]
    pub fn length_prefixed_with_max(max_frame: usize) -> Self {
        Self::LengthPrefixed(LengthPrefixed {
            max_frame: max_frame.min(FRAME_LENGTH_CEILING),
            buffer: ChunkBuffer::new(),
            expected: None,
        })
    }

    /// Line-delimited framing with the default payload cap.
    #[must_use]
    pub fn line_delimited() -> Self {
        Self::line_delimited_with_max(DEFAULT_MAX_FRAME)
    }

    /// Line-delimited framing with a custom payload cap.
    #[must_use]
    pub fn line_delimited_with_max(max_frame: usize) -> Self {
        Self::LineDelimited(LineDelimited {
            max_frame,
            buffer: ChunkBuffer::new(),
            scanned: 0,
        })
    }

    /// Encode one payload into `out`.
    pub fn encode(&self, payload: &[u8], out: &mut BytesMut) -> Result<()> {
        match self {
            Self::LengthPrefixed(f) => f.encode(payload, out),
            Self::LineDelimited(f) => f.encode(payload, out),
        }
    }

    /// Feed raw bytes; returns every frame completed by this chunk.
    pub fn push(&mut self, chunk: Bytes) -> Result<FrameBatch> {
        match self {
            Self::LengthPrefixed(f) => f.push(chunk),
            Self::LineDelimited(f) => f.push(chunk),
        }
    }

    /// Bytes buffered awaiting frame completion.
    #[must_use]
    pub fn buffered(&self) -> usize {
        match self {
            Self::LengthPrefixed(f) => f.buffer.len(),
            Self::LineDelimited(f) => f.buffer.len(),
        }
    }
}

/// `u32` big-endian length prefix framing.
#[derive(Debug)]
pub struct LengthPrefixed {
    max_frame: usize,
    buffer: ChunkBuffer,
    /// Payload length parsed from the current header, if any.
    expected: Option<usize>,
}

impl LengthPrefixed {
    fn encode(&self, payload: &[u8], out: &mut BytesMut) -> Result<()> {
        if payload.len() > self.max_frame {
            return Err(Error::framing(format!(
                "payload of {} bytes exceeds maximum frame size {}",
                payload.len(),
                self.max_frame
            )));
        }
        out.reserve(LENGTH_PREFIX + payload.len());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        Ok(())
    }

    fn push(&mut self, chunk: Bytes) -> Result<FrameBatch> {
        self.buffer.push(chunk);
        let mut frames = FrameBatch::new();

        loop {
            let expected = match self.expected {
                Some(n) => n,
                None => {
                    let mut header = [0u8; LENGTH_PREFIX];
                    if !self.buffer.peek(LENGTH_PREFIX, &mut header) {
                        break;
                    }
                    let n = u32::from_be_bytes(header) as usize;
                    if n > self.max_frame {
                        return Err(Error::framing(format!(
                            "incoming frame of {n} bytes exceeds maximum frame size {}",
                            self.max_frame
                        )));
                    }
                    self.buffer.discard(LENGTH_PREFIX);
                    self.expected = Some(n);
                    n
                }
            };

            match self.buffer.take(expected) {
                Some(payload) => {
                    self.expected = None;
                    frames.push(payload);
                }
                None => break,
            }
        }

        Ok(frames)
    }
}

/// Newline-terminated framing for UTF-8 payloads.
#[derive(Debug)]
pub struct LineDelimited {
    max_frame: usize,
    buffer: ChunkBuffer,
    /// Bytes already scanned for a terminator, to keep `push` linear.
    scanned: usize,
}

impl LineDelimited {
    fn encode(&self, payload: &[u8], out: &mut BytesMut) -> Result<()> {
        if payload.len() > self.max_frame {
            return Err(Error::framing(format!(
                "payload of {} bytes exceeds maximum frame size {}",
                payload.len(),
                self.max_frame
            )));
        }
        if payload.contains(&b'\n') {
            return Err(Error::framing(
                "line-delimited payload must not contain embedded newlines",
            ));
        }
        out.reserve(payload.len() + 1);
        out.extend_from_slice(payload);
        out.extend_from_slice(b"\n");
        Ok(())
    }

    fn push(&mut self, chunk: Bytes) -> Result<FrameBatch> {
        self.buffer.push(chunk);
        let mut frames = FrameBatch::new();

        while let Some(pos) = self.buffer.find_byte_from(self.scanned, b'\n') {
            if pos > self.max_frame {
                return Err(Error::framing(format!(
                    "incoming line of {pos} bytes exceeds maximum frame size {}",
                    self.max_frame
                )));
            }
            let payload = self
                .buffer
                .take(pos)
                .expect("terminator position is within the buffer");
            self.buffer.discard(1);
            self.scanned = 0;
            frames.push(payload);
        }

        self.scanned = self.buffer.len();
        if self.scanned > self.max_frame {
            return Err(Error::framing(format!(
                "unterminated line of {} bytes exceeds maximum frame size {}",
                self.scanned, self.max_frame
            )));
        }

        Ok(frames)
    }
}
