//! Incremental read buffer for the framing layer.
//!
//! Transport chunks are queued untouched and consumed through a logical
//! cursor: `head` counts how far into the front chunk the reader has
//! advanced. Chunks are never spliced or rewritten on push, so feeding
//! a large frame in many small pieces stays linear, and extracting a
//! range that lies inside one chunk is a shared slice of it rather than
//! a copy.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// A queue of immutable byte chunks behind a consumption cursor.
///
/// Invariant: `head` is always inside the front chunk (`head == 0` when
/// the queue is empty); `len` is the unconsumed total.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    chunks: VecDeque<Bytes>,
    head: usize,
    len: usize,
}

impl ChunkBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            head: 0,
            len: 0,
        }
    }

    /// Total unconsumed bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a chunk. Empty chunks are dropped.
    #[inline]
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Walk the unconsumed bytes as a sequence of slices, starting at
    /// the cursor.
    fn unread(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let mut skip = self.head;
        self.chunks.iter().map(move |chunk| {
            let start = skip.min(chunk.len());
            skip -= start;
            &chunk[start..]
        })
    }

    /// Copy the first `n` unconsumed bytes into `dst` without moving
    /// the cursor.
    ///
    /// Returns `false` when fewer than `n` bytes are buffered or `dst`
    /// is too small.
    pub fn peek(&self, n: usize, dst: &mut [u8]) -> bool {
        if n > self.len || dst.len() < n {
            return false;
        }
        let mut filled = 0;
        for slice in self.unread() {
            if filled == n {
                break;
            }
            let take = (n - filled).min(slice.len());
            dst[filled..filled + take].copy_from_slice(&slice[..take]);
            filled += take;
        }
        true
    }

    /// Position of the first `byte` at or after cursor offset `from`.
    #[must_use]
    pub fn find_byte_from(&self, from: usize, byte: u8) -> Option<usize> {
        let mut base = 0;
        for slice in self.unread() {
            let end = base + slice.len();
            if end > from {
                let start = from.saturating_sub(base);
                if let Some(pos) = slice[start..].iter().position(|b| *b == byte) {
                    return Some(base + start + pos);
                }
            }
            base = end;
        }
        None
    }

    /// Advance the cursor by `n` bytes, releasing chunks it has fully
    /// passed.
    ///
    /// # Panics
    ///
    /// Panics if `n > self.len()`.
    pub fn discard(&mut self, n: usize) {
        assert!(n <= self.len);
        self.len -= n;
        self.head += n;
        while let Some(front) = self.chunks.front() {
            if self.head < front.len() {
                break;
            }
            self.head -= front.len();
            self.chunks.pop_front();
        }
    }

    /// Remove and return exactly `n` bytes from the cursor.
    ///
    /// A range inside the front chunk comes back as a shared slice of
    /// it (refcount bump, no copy); a range spanning chunks is gathered
    /// into one buffer sized up front.
    ///
    /// Returns `None` when fewer than `n` bytes are buffered.
    pub fn take(&mut self, n: usize) -> Option<Bytes> {
        if n > self.len {
            return None;
        }
        if n == 0 {
            return Some(Bytes::new());
        }

        let out = {
            let front = self.chunks.front().expect("len > 0 implies chunks");
            if n <= front.len() - self.head {
                front.slice(self.head..self.head + n)
            } else {
                let mut gathered = BytesMut::with_capacity(n);
                for slice in self.unread() {
                    let want = n - gathered.len();
                    if want == 0 {
                        break;
                    }
                    gathered.extend_from_slice(&slice[..want.min(slice.len())]);
                }
                gathered.freeze()
            }
        };
        self.discard(n);
        Some(out)
    }
}
