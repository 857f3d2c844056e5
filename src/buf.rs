//! Growable byte buffer with a read cursor.
//!
//! This is the "sliding buffer" of the GLOSSARY: bytes before `offset` are
//! consumed, bytes in `[offset, len)` are unread. It backs both the TCP
//! multiplexor's per-connection output queue (as plain owned segments) and
//! the regex-framed session layer's accumulated input.

use bytes::BytesMut;

/// A growable byte buffer with a read cursor into it.
///
/// Invariant: `offset <= len()` always holds.
#[derive(Debug, Default)]
pub struct SlidingBuffer {
    data: BytesMut,
    offset: usize,
}

impl SlidingBuffer {
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
            offset: 0,
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(cap),
            offset: 0,
        }
    }

    /// Ensure at least `additional` bytes of spare capacity at the tail.
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    /// Append bytes to the tail.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Grow the tail by writing through a closure that fills spare capacity
    /// and returns the number of bytes actually written. Used by the event
    /// loop so a single `read(2)` can land directly after the live suffix.
    pub fn fill_tail<F>(&mut self, min_spare: usize, f: F) -> std::io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> std::io::Result<usize>,
    {
        self.reserve(min_spare);
        let len = self.data.len();
        let cap = self.data.capacity();
        // Safety-free: BytesMut tracks capacity but not initialization past
        // `len`; spare_capacity_mut gives us a place to read into, then we
        // advance len by exactly what was read.
        let spare = self.data.spare_capacity_mut();
        debug_assert!(spare.len() >= cap - len);
        let dst: &mut [u8] = unsafe {
            std::slice::from_raw_parts_mut(spare.as_mut_ptr() as *mut u8, spare.len())
        };
        let n = f(dst)?;
        unsafe {
            self.data.set_len(len + n);
        }
        Ok(n)
    }

    /// Bytes before the cursor are consumed, `[offset, len)` is unread.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Base pointer of the whole buffer, valid for reading `len()` bytes.
    /// Used to expose `(base + offset, match_end - offset)` request ranges
    /// without copying (spec §4.B).
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..]
    }

    /// Advance the read cursor. Panics if it would exceed `len()`.
    pub fn advance(&mut self, by: usize) {
        assert!(self.offset + by <= self.data.len(), "advance past tail");
        self.offset += by;
    }

    /// Shift the unread suffix to the front and reset the cursor, reclaiming
    /// the space occupied by already-consumed bytes.
    pub fn reclaim(&mut self) {
        if self.offset == 0 {
            return;
        }
        let remaining = self.data.len() - self.offset;
        self.data.copy_within(self.offset.., 0);
        self.data.truncate(remaining);
        self.offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_and_reclaim() {
        let mut buf = SlidingBuffer::new();
        buf.append(b"hello world");
        buf.advance(6);
        assert_eq!(buf.unread(), b"world");
        buf.reclaim();
        assert_eq!(buf.offset(), 0);
        assert_eq!(buf.unread(), b"world");
        assert_eq!(buf.as_slice(), b"world");
    }

    #[test]
    fn fill_tail_reads_into_spare_capacity() {
        let mut buf = SlidingBuffer::new();
        buf.append(b"he");
        let n = buf
            .fill_tail(2048, |dst| {
                dst[..3].copy_from_slice(b"llo");
                Ok(3)
            })
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf.as_slice(), b"hello");
    }

    #[test]
    #[should_panic]
    fn advance_past_tail_panics() {
        let mut buf = SlidingBuffer::new();
        buf.append(b"hi");
        buf.advance(3);
    }
}
