//! The accumulation buffer every decoder is built on.
//!
//! Inbound chunks are appended at the back; parsed bytes are dropped
//! (or split off, without copying) from the front.
//! `BytesMut` reclaims the consumed front when it next needs to grow,
//! so a long-running decoder only ever holds what it hasn't parsed yet.

use bytes::{Buf, Bytes, BytesMut};

#[derive(Debug, Default)]
pub struct ByteRingBuffer {
    buf: BytesMut,
    /// Total bytes consumed from the front, for log messages.
    consumed: u64,
}

impl ByteRingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an inbound chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of buffered, unconsumed bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The buffered bytes, front first.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Returns the first `n` bytes if that many are buffered.
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        self.buf.get(..n)
    }

    /// Discards up to `n` bytes from the front, returning how many were dropped.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
        self.consumed += n as u64;
        n
    }

    /// Splits the first `n` bytes off into an immutable chunk.
    ///
    /// Panics if fewer than `n` bytes are buffered;
    /// callers check `len()` first.
    pub fn take(&mut self, n: usize) -> Bytes {
        self.consumed += n as u64;
        self.buf.split_to(n).freeze()
    }

    /// Drops everything buffered.
    pub fn clear(&mut self) {
        self.consumed += self.buf.len() as u64;
        self.buf.clear();
    }

    /// Offset of the buffer's front from the start of the stream.
    pub fn position(&self) -> u64 {
        self.consumed
    }
}
