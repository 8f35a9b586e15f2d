//! Segmented byte buffer for accumulating and consuming stream data.
//!
//! The write side is an ordered sequence of chunks. Small appends are
//! coalesced into the last chunk while it stays at or under
//! [`COALESCE_THRESHOLD`] bytes, so a packet made of many small fields does
//! not turn into many tiny chunks, while large payloads keep their own chunk.
//!
//! The read side consumes from the front chunk:
//! - a read covered by the front chunk is zero-copy (the chunk is handed out
//!   whole or split off with `BytesMut::split_to`)
//! - a read spanning chunks is assembled in a reusable scratch buffer
//!
//! Reads never partially consume. When not enough bytes are buffered they
//! return `None` and the same read can be retried after more data arrives.
//!
//! # Example
//!
//! ```
//! use queuewire::buffer::{LengthPrefix, SegmentedBuffer};
//!
//! let mut buffer = SegmentedBuffer::new();
//! buffer.append_u64(42);
//! buffer.append_bytes(b"payload", LengthPrefix::Four).unwrap();
//!
//! assert_eq!(buffer.read_u64(), Some(42));
//! assert_eq!(&buffer.read_bytes(LengthPrefix::Four).unwrap()[..], b"payload");
//! assert!(buffer.is_empty());
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};

/// Appends coalesce into the last chunk while it stays at or under this size.
pub const COALESCE_THRESHOLD: usize = 32;

/// Default capacity hint for the scratch buffer (16 KiB).
pub const DEFAULT_SCRATCH_CAPACITY: usize = 16 * 1024;

/// Encoded size of a duration: 8-byte seconds + 4-byte nanoseconds.
pub const DURATION_SIZE: usize = 12;

/// Width of the length prefix in front of a byte string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthPrefix {
    One,
    Two,
    Four,
    Eight,
}

impl LengthPrefix {
    /// Number of bytes the prefix occupies on the wire.
    #[inline]
    pub const fn width(self) -> usize {
        match self {
            LengthPrefix::One => 1,
            LengthPrefix::Two => 2,
            LengthPrefix::Four => 4,
            LengthPrefix::Eight => 8,
        }
    }

    /// Largest length this prefix can express.
    #[inline]
    pub const fn max_len(self) -> u64 {
        match self {
            LengthPrefix::One => u8::MAX as u64,
            LengthPrefix::Two => u16::MAX as u64,
            LengthPrefix::Four => u32::MAX as u64,
            LengthPrefix::Eight => u64::MAX,
        }
    }
}

/// A single-byte enum code that can travel in the optional-tagged encoding.
pub trait WireCode: Copy + Sized {
    /// The byte written on the wire.
    fn code(self) -> u8;

    /// Map a wire byte back to the enum, `None` for unknown codes.
    fn from_code(code: u8) -> Option<Self>;
}

macro_rules! int_accessors {
    ($($read:ident, $append:ident, $ty:ty;)*) => {
        $(
            #[doc = concat!("Read a little-endian `", stringify!($ty), "`.")]
            #[inline]
            pub fn $read(&mut self) -> Option<$ty> {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                if !self.peek(&mut raw) {
                    return None;
                }
                self.discard(raw.len());
                Some(<$ty>::from_le_bytes(raw))
            }

            #[doc = concat!("Append a little-endian `", stringify!($ty), "`.")]
            #[inline]
            pub fn $append(&mut self, value: $ty) -> usize {
                self.append(&value.to_le_bytes())
            }
        )*
    };
}

/// Chunked byte buffer with an append-only write side and a consuming read side.
#[derive(Debug)]
pub struct SegmentedBuffer {
    /// Unread chunks, oldest first.
    chunks: VecDeque<BytesMut>,
    /// Total unread bytes across all chunks.
    len: usize,
    /// Reused to assemble reads that span chunks.
    scratch: BytesMut,
    /// Scratch capacity kept between reads.
    scratch_capacity: usize,
}

impl SegmentedBuffer {
    /// Create an empty buffer with the default scratch capacity.
    pub fn new() -> Self {
        Self::with_scratch_capacity(DEFAULT_SCRATCH_CAPACITY)
    }

    /// Create an empty buffer whose scratch buffer is kept up to `capacity` bytes.
    pub fn with_scratch_capacity(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
            scratch: BytesMut::new(),
            scratch_capacity: capacity,
        }
    }

    /// Number of unread bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if there is nothing left to read.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of chunks currently held.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// Append raw bytes, returning the number of bytes written.
    pub fn append(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        self.len += data.len();

        let coalesce = self
            .chunks
            .back()
            .map_or(false, |last| last.len() + data.len() <= COALESCE_THRESHOLD);

        if coalesce {
            if let Some(last) = self.chunks.back_mut() {
                last.extend_from_slice(data);
            }
        } else {
            self.chunks.push_back(BytesMut::from(data));
        }
        data.len()
    }

    /// Read exactly `n` bytes.
    ///
    /// Returns `None` without consuming anything if fewer than `n` bytes are
    /// buffered.
    pub fn read(&mut self, n: usize) -> Option<Bytes> {
        if n > self.len {
            return None;
        }
        if n == 0 {
            return Some(Bytes::new());
        }
        self.len -= n;

        let front_len = self.chunks.front().map_or(0, BytesMut::len);
        if front_len == n {
            return self.chunks.pop_front().map(BytesMut::freeze);
        }
        if front_len > n {
            return self.chunks.front_mut().map(|chunk| chunk.split_to(n).freeze());
        }

        self.prepare_scratch(n);
        let mut remaining = n;
        while remaining > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.scratch.extend_from_slice(front);
                self.chunks.pop_front();
            } else {
                self.scratch.extend_from_slice(&front[..remaining]);
                front.advance(remaining);
                remaining = 0;
            }
        }
        debug_assert_eq!(self.scratch.len(), n);
        Some(self.scratch.split().freeze())
    }

    /// Copy the next `dst.len()` bytes into `dst` without consuming them.
    ///
    /// Returns `false` if not enough bytes are buffered.
    pub fn peek(&self, dst: &mut [u8]) -> bool {
        if dst.len() > self.len {
            return false;
        }
        let mut filled = 0;
        for chunk in &self.chunks {
            if filled == dst.len() {
                break;
            }
            let take = chunk.len().min(dst.len() - filled);
            dst[filled..filled + take].copy_from_slice(&chunk[..take]);
            filled += take;
        }
        filled == dst.len()
    }

    /// Drain the buffer as a list of chunks, oldest first.
    pub fn take_chunks(&mut self) -> Vec<Bytes> {
        self.len = 0;
        self.chunks.drain(..).map(BytesMut::freeze).collect()
    }

    /// Consume `n` bytes that are known to be buffered.
    pub(crate) fn discard(&mut self, mut n: usize) {
        debug_assert!(n <= self.len);
        self.len -= n;
        while n > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.len() <= n {
                n -= front.len();
                self.chunks.pop_front();
            } else {
                front.advance(n);
                n = 0;
            }
        }
    }

    fn prepare_scratch(&mut self, n: usize) {
        if self.scratch.capacity() > self.scratch_capacity {
            self.scratch = BytesMut::with_capacity(self.scratch_capacity.max(n));
        }
        self.scratch.clear();
        self.scratch.reserve(n);
    }

    int_accessors! {
        read_u8, append_u8, u8;
        read_u16, append_u16, u16;
        read_u32, append_u32, u32;
        read_u64, append_u64, u64;
        read_i64, append_i64, i64;
    }

    /// Append a byte string preceded by its length.
    ///
    /// Returns `None` (and writes nothing) if the length does not fit in the
    /// prefix.
    pub fn append_bytes(&mut self, data: &[u8], prefix: LengthPrefix) -> Option<usize> {
        let len = u64::try_from(data.len()).ok()?;
        if len > prefix.max_len() {
            return None;
        }
        let raw = len.to_le_bytes();
        let written = self.append(&raw[..prefix.width()]);
        Some(written + self.append(data))
    }

    /// Read a byte string preceded by its length.
    ///
    /// Consumes nothing unless both the prefix and the whole body are buffered.
    pub fn read_bytes(&mut self, prefix: LengthPrefix) -> Option<Bytes> {
        let width = prefix.width();
        let mut raw = [0u8; 8];
        if !self.peek(&mut raw[..width]) {
            return None;
        }
        let body_len = usize::try_from(u64::from_le_bytes(raw)).ok()?;
        if self.len < width.checked_add(body_len)? {
            return None;
        }
        self.discard(width);
        self.read(body_len)
    }

    /// Append a UTF-8 string with a 4-byte length prefix.
    pub fn append_string(&mut self, value: &str) -> Option<usize> {
        self.append_bytes(value.as_bytes(), LengthPrefix::Four)
    }

    /// Read a UTF-8 string with a 4-byte length prefix.
    ///
    /// Invalid UTF-8 sequences are replaced with `U+FFFD`.
    pub fn read_string(&mut self) -> Option<String> {
        let raw = self.read_bytes(LengthPrefix::Four)?;
        Some(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Append an optional code as `[present][code]`, always 2 bytes.
    pub fn append_optional<T: WireCode>(&mut self, value: Option<T>) -> usize {
        match value {
            Some(value) => self.append(&[1, value.code()]),
            None => self.append(&[0, 0]),
        }
    }

    /// Read an optional code written by [`append_optional`](Self::append_optional).
    ///
    /// Returns `Some(None)` for an absent value and `None` (consuming nothing)
    /// when the two bytes are not buffered or the code is unknown.
    pub fn read_optional<T: WireCode>(&mut self) -> Option<Option<T>> {
        let mut raw = [0u8; 2];
        if !self.peek(&mut raw) {
            return None;
        }
        let value = if raw[0] == 0 {
            None
        } else {
            Some(T::from_code(raw[1])?)
        };
        self.discard(2);
        Some(value)
    }

    /// Append a duration as 8-byte seconds + 4-byte nanoseconds.
    pub fn append_duration(&mut self, value: Duration) -> usize {
        let mut raw = [0u8; DURATION_SIZE];
        raw[..8].copy_from_slice(&value.as_secs().to_le_bytes());
        raw[8..].copy_from_slice(&value.subsec_nanos().to_le_bytes());
        self.append(&raw)
    }

    /// Read a duration written by [`append_duration`](Self::append_duration).
    pub fn read_duration(&mut self) -> Option<Duration> {
        let mut raw = [0u8; DURATION_SIZE];
        if !self.peek(&mut raw) {
            return None;
        }
        let mut secs = [0u8; 8];
        secs.copy_from_slice(&raw[..8]);
        let mut nanos = [0u8; 4];
        nanos.copy_from_slice(&raw[8..]);
        let nanos = u32::from_le_bytes(nanos);
        if nanos >= 1_000_000_000 {
            return None;
        }
        self.discard(DURATION_SIZE);
        Some(Duration::new(u64::from_le_bytes(secs), nanos))
    }
}

impl Default for SegmentedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Color {
        Red,
        Blue,
    }

    impl WireCode for Color {
        fn code(self) -> u8 {
            match self {
                Color::Red => 0,
                Color::Blue => 1,
            }
        }

        fn from_code(code: u8) -> Option<Self> {
            match code {
                0 => Some(Color::Red),
                1 => Some(Color::Blue),
                _ => None,
            }
        }
    }

    #[test]
    fn test_small_appends_coalesce() {
        let mut buffer = SegmentedBuffer::new();
        buffer.append(&[1; 10]);
        buffer.append(&[2; 10]);
        buffer.append(&[3; 12]);

        assert_eq!(buffer.len(), 32);
        assert_eq!(buffer.chunk_count(), 1);

        buffer.append(&[4]);
        assert_eq!(buffer.chunk_count(), 2);
    }

    #[test]
    fn test_large_append_gets_own_chunk() {
        let mut buffer = SegmentedBuffer::new();
        buffer.append(b"hdr");
        buffer.append(&[0xAB; 100]);
        buffer.append(b"tail");

        assert_eq!(buffer.chunk_count(), 3);
        assert_eq!(buffer.len(), 107);
    }

    #[test]
    fn test_empty_append_is_noop() {
        let mut buffer = SegmentedBuffer::new();
        assert_eq!(buffer.append(&[]), 0);
        assert_eq!(buffer.chunk_count(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_read_exact_chunk_fast_path() {
        let mut buffer = SegmentedBuffer::new();
        let payload = vec![7u8; 64];
        buffer.append(&payload);

        let read = buffer.read(64).unwrap();
        assert_eq!(&read[..], &payload[..]);
        assert_eq!(buffer.chunk_count(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_read_within_front_chunk() {
        let mut buffer = SegmentedBuffer::new();
        buffer.append(b"hello world");

        assert_eq!(&buffer.read(5).unwrap()[..], b"hello");
        assert_eq!(buffer.len(), 6);
        assert_eq!(&buffer.read(6).unwrap()[..], b" world");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_read_spanning_chunks() {
        let mut buffer = SegmentedBuffer::new();
        let first = vec![1u8; 40];
        let second = vec![2u8; 40];
        buffer.append(&first);
        buffer.append(&second);

        let read = buffer.read(60).unwrap();
        assert_eq!(&read[..40], &first[..]);
        assert_eq!(&read[40..], &second[..20]);
        assert_eq!(buffer.len(), 20);
        assert_eq!(&buffer.read(20).unwrap()[..], &second[20..]);
    }

    #[test]
    fn test_insufficient_read_consumes_nothing() {
        let mut buffer = SegmentedBuffer::new();
        buffer.append(b"abc");

        assert!(buffer.read(4).is_none());
        assert_eq!(buffer.len(), 3);

        buffer.append(b"d");
        assert_eq!(&buffer.read(4).unwrap()[..], b"abcd");
    }

    #[test]
    fn test_len_tracks_unread_bytes() {
        let mut buffer = SegmentedBuffer::new();
        buffer.append(&[0; 50]);
        buffer.append(&[0; 5]);
        buffer.append(&[0; 70]);

        buffer.read(3).unwrap();
        buffer.read(60).unwrap();
        assert_eq!(buffer.len(), 62);

        let rest = buffer.take_chunks();
        assert_eq!(rest.iter().map(Bytes::len).sum::<usize>(), 62);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut buffer = SegmentedBuffer::new();
        buffer.append(&[1; 40]);
        buffer.append(&[2; 40]);

        let mut dst = [0u8; 42];
        assert!(buffer.peek(&mut dst));
        assert_eq!(dst[39], 1);
        assert_eq!(dst[40], 2);
        assert_eq!(buffer.len(), 80);

        let mut too_big = [0u8; 81];
        assert!(!buffer.peek(&mut too_big));
    }

    #[test]
    fn test_discard_after_peek() {
        let mut buffer = SegmentedBuffer::new();
        buffer.append(&[1; 40]);
        buffer.append(&[2; 40]);

        let mut header = [0u8; 45];
        assert!(buffer.peek(&mut header));
        buffer.discard(header.len());

        assert_eq!(buffer.len(), 35);
        assert_eq!(buffer.chunk_count(), 1);
        assert_eq!(buffer.read(35).unwrap(), Bytes::from(vec![2u8; 35]));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_integers_little_endian() {
        let mut buffer = SegmentedBuffer::new();
        buffer.append_u32(0x0403_0201);
        let raw = buffer.read(4).unwrap();
        assert_eq!(&raw[..], &[1, 2, 3, 4]);

        buffer.append_u8(9);
        buffer.append_u16(0xBEEF);
        buffer.append_u64(u64::MAX - 1);
        buffer.append_i64(-42);

        assert_eq!(buffer.read_u8(), Some(9));
        assert_eq!(buffer.read_u16(), Some(0xBEEF));
        assert_eq!(buffer.read_u64(), Some(u64::MAX - 1));
        assert_eq!(buffer.read_i64(), Some(-42));
        assert_eq!(buffer.read_u8(), None);
    }

    #[test]
    fn test_integer_split_across_chunks() {
        let mut buffer = SegmentedBuffer::new();
        let value = 0x1122_3344_5566_7788u64.to_le_bytes();
        buffer.append(&[0xFF; 30]);
        buffer.append(&value[..2]);
        buffer.append(&value[2..]);
        assert!(buffer.chunk_count() >= 2);

        buffer.read(30).unwrap();
        assert_eq!(buffer.read_u64(), Some(0x1122_3344_5566_7788));
    }

    #[test]
    fn test_length_prefixed_bytes_all_widths() {
        for prefix in [
            LengthPrefix::One,
            LengthPrefix::Two,
            LengthPrefix::Four,
            LengthPrefix::Eight,
        ] {
            let mut buffer = SegmentedBuffer::new();
            let written = buffer.append_bytes(b"queue", prefix).unwrap();
            assert_eq!(written, prefix.width() + 5);
            assert_eq!(&buffer.read_bytes(prefix).unwrap()[..], b"queue");
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_length_prefix_overflow_writes_nothing() {
        let mut buffer = SegmentedBuffer::new();
        let data = vec![0u8; 256];
        assert!(buffer.append_bytes(&data, LengthPrefix::One).is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_length_prefixed_read_is_retriable() {
        let mut buffer = SegmentedBuffer::new();
        let mut source = SegmentedBuffer::new();
        source.append_bytes(b"payload", LengthPrefix::Four).unwrap();
        let encoded: Vec<u8> = source.take_chunks().concat();

        buffer.append(&encoded[..6]);
        assert!(buffer.read_bytes(LengthPrefix::Four).is_none());
        assert_eq!(buffer.len(), 6);

        buffer.append(&encoded[6..]);
        assert_eq!(&buffer.read_bytes(LengthPrefix::Four).unwrap()[..], b"payload");
    }

    #[test]
    fn test_empty_bytes_and_string() {
        let mut buffer = SegmentedBuffer::new();
        buffer.append_bytes(b"", LengthPrefix::Two).unwrap();
        buffer.append_string("").unwrap();

        assert!(buffer.read_bytes(LengthPrefix::Two).unwrap().is_empty());
        assert_eq!(buffer.read_string().unwrap(), "");
    }

    #[test]
    fn test_string_roundtrip_utf8() {
        let mut buffer = SegmentedBuffer::new();
        buffer.append_string("jobs/ünïcödé").unwrap();
        assert_eq!(buffer.read_string().unwrap(), "jobs/ünïcödé");
    }

    #[test]
    fn test_optional_codes() {
        let mut buffer = SegmentedBuffer::new();
        assert_eq!(buffer.append_optional(Some(Color::Blue)), 2);
        assert_eq!(buffer.append_optional::<Color>(None), 2);

        assert_eq!(buffer.read_optional::<Color>(), Some(Some(Color::Blue)));
        assert_eq!(buffer.read_optional::<Color>(), Some(None));
        assert_eq!(buffer.read_optional::<Color>(), None);
    }

    #[test]
    fn test_optional_unknown_code_consumes_nothing() {
        let mut buffer = SegmentedBuffer::new();
        buffer.append(&[1, 99]);

        assert_eq!(buffer.read_optional::<Color>(), None);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_duration_roundtrip() {
        let mut buffer = SegmentedBuffer::new();
        let value = Duration::new(3, 250_000_000);
        assert_eq!(buffer.append_duration(value), DURATION_SIZE);
        assert_eq!(buffer.read_duration(), Some(value));
    }

    #[test]
    fn test_duration_rejects_invalid_nanos() {
        let mut buffer = SegmentedBuffer::new();
        buffer.append_u64(1);
        buffer.append_u32(1_000_000_000);

        assert_eq!(buffer.read_duration(), None);
        assert_eq!(buffer.len(), DURATION_SIZE);
    }

    #[test]
    fn test_scratch_released_after_large_read() {
        let mut buffer = SegmentedBuffer::with_scratch_capacity(64);
        buffer.append(&[1; 100]);
        buffer.append(&[2; 100]);
        let big = buffer.read(150).unwrap();
        assert_eq!(big.len(), 150);
        drop(big);

        buffer.append(&[3; 40]);
        buffer.read(40).unwrap();
        buffer.append(&[4; 40]);
        buffer.append(&[5; 40]);
        let small = buffer.read(70).unwrap();
        assert_eq!(small.len(), 70);
        assert!(buffer.scratch.capacity() <= 150);
    }

    #[test]
    fn test_take_chunks_preserves_order() {
        let mut buffer = SegmentedBuffer::new();
        buffer.append(b"ab");
        buffer.append(&[b'c'; 40]);
        buffer.append(b"d");

        let flat: Vec<u8> = buffer.take_chunks().concat();
        assert_eq!(flat.len(), 43);
        assert_eq!(flat[0], b'a');
        assert_eq!(flat[42], b'd');
    }
}
