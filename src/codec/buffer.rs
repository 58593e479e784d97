//! Growable in-memory buffer implementing both codec traits.
//!
//! Capacity growth follows the pool's documented rule: double from 64 bytes
//! up to the 4 MiB threshold, then round up to the next 4 MiB multiple,
//! copying existing content into the enlarged buffer.

use crate::codec::{DataReader, DataWriter};
use crate::error::{Error, Result};

/// Capacity at which growth switches from geometric to linear.
pub const GROWTH_THRESHOLD: usize = 4 * 1024 * 1024;

/// Smallest capacity the geometric phase starts from.
pub const MIN_CAPACITY: usize = 64;

/// Next capacity able to hold `needed` bytes.
pub fn grown_capacity(needed: usize) -> usize {
    if needed <= GROWTH_THRESHOLD {
        let mut cap = MIN_CAPACITY;
        while cap < needed {
            cap *= 2;
        }
        cap
    } else {
        ((needed + GROWTH_THRESHOLD - 1) / GROWTH_THRESHOLD) * GROWTH_THRESHOLD
    }
}

/// In-memory byte buffer with independent read and write positions.
pub struct ByteBuffer {
    buf: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    /// Allocates exactly `capacity` bytes; later growth follows the rule.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes written and not yet consumed.
    pub fn remaining(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The written, unconsumed region.
    pub fn filled(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Reset both positions, keeping the allocation.
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Drop `n` already-decoded bytes from the front of the filled region.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.read_pos += n;
        if self.read_pos == self.write_pos {
            self.clear();
        }
    }

    /// Move the unconsumed region to the front so appended reads fit.
    pub fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        self.buf.copy_within(self.read_pos..self.write_pos, 0);
        self.write_pos -= self.read_pos;
        self.read_pos = 0;
    }

    /// Grow (never shrink) so at least `additional` more bytes fit.
    pub fn ensure_capacity(&mut self, additional: usize) {
        let needed = self.write_pos + additional;
        if needed <= self.buf.len() {
            return;
        }
        let new_cap = grown_capacity(needed);
        let mut new_buf = vec![0u8; new_cap].into_boxed_slice();
        new_buf[..self.write_pos].copy_from_slice(&self.buf[..self.write_pos]);
        self.buf = new_buf;
    }

    /// Append bytes produced by `fill`, which reports how many it wrote.
    ///
    /// Used to read from a socket straight into the buffer tail.
    pub fn fill_from<F>(&mut self, min_space: usize, fill: F) -> std::io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> std::io::Result<usize>,
    {
        self.compact();
        self.ensure_capacity(min_space);
        let n = fill(&mut self.buf[self.write_pos..])?;
        self.write_pos += n;
        Ok(n)
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl DataWriter for ByteBuffer {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_capacity(bytes.len());
        self.buf[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
        Ok(())
    }
}

impl DataReader for ByteBuffer {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.remaining() < buf.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "buffer exhausted",
            )));
        }
        buf.copy_from_slice(&self.buf[self.read_pos..self.read_pos + buf.len()]);
        self.read_pos += buf.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_rule_geometric() {
        assert_eq!(grown_capacity(1), 64);
        assert_eq!(grown_capacity(64), 64);
        assert_eq!(grown_capacity(65), 128);
        assert_eq!(grown_capacity(100), 128);
        assert_eq!(grown_capacity(4 * 1024 * 1024), 4 * 1024 * 1024);
    }

    #[test]
    fn test_growth_rule_linear_past_threshold() {
        assert_eq!(grown_capacity(4 * 1024 * 1024 + 1), 8 * 1024 * 1024);
        assert_eq!(grown_capacity(5 * 1024 * 1024), 8 * 1024 * 1024);
        assert_eq!(grown_capacity(9 * 1024 * 1024), 12 * 1024 * 1024);
    }

    #[test]
    fn test_grow_preserves_content() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.write_bytes(&[1, 2, 3, 4]).unwrap();
        buf.write_bytes(&[5, 6]).unwrap();
        assert_eq!(buf.filled(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(buf.capacity(), 64);
    }

    #[test]
    fn test_consume_and_compact() {
        let mut buf = ByteBuffer::new();
        buf.write_bytes(b"abcdef").unwrap();
        buf.consume(2);
        assert_eq!(buf.filled(), b"cdef");
        buf.compact();
        assert_eq!(buf.filled(), b"cdef");
        buf.consume(4);
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 64);
    }

    #[test]
    fn test_fill_from() {
        let mut buf = ByteBuffer::with_capacity(8);
        let n = buf
            .fill_from(16, |space| {
                space[..3].copy_from_slice(b"xyz");
                Ok(3)
            })
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf.filled(), b"xyz");
        assert!(buf.capacity() >= 16);
    }
}
