//! Byte-capacity accounting for a single queue.
//!
//! A push is accepted only when the payload fits in the remaining budget;
//! the budget is released when the payload leaves the buffer (popped or
//! expired). Payloads handed straight to a waiting popper never reserve.

/// Default per-queue byte limit (4 MiB).
pub const DEFAULT_MAX_QUEUE_BYTES: usize = 1 << 22;

/// Tracks buffered bytes against a fixed limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteCapacity {
    current: usize,
    max: usize,
}

impl ByteCapacity {
    /// Create an empty budget of `max` bytes.
    pub fn new(max: usize) -> Self {
        Self { current: 0, max }
    }

    /// Check if `len` more bytes fit.
    #[inline]
    pub fn can_fit(&self, len: usize) -> bool {
        self.current
            .checked_add(len)
            .map_or(false, |total| total <= self.max)
    }

    /// Reserve `len` bytes.
    ///
    /// Returns `false` (reserving nothing) if they do not fit.
    #[inline]
    pub fn reserve(&mut self, len: usize) -> bool {
        if !self.can_fit(len) {
            return false;
        }
        self.current += len;
        true
    }

    /// Release `len` previously reserved bytes.
    #[inline]
    pub fn release(&mut self, len: usize) {
        debug_assert!(len <= self.current);
        self.current = self.current.saturating_sub(len);
    }

    /// Bytes currently reserved.
    #[inline]
    pub fn current(&self) -> usize {
        self.current
    }

    /// Maximum bytes.
    #[inline]
    pub fn max(&self) -> usize {
        self.max
    }

    /// Bytes still available.
    #[inline]
    pub fn available(&self) -> usize {
        self.max.saturating_sub(self.current)
    }
}

impl Default for ByteCapacity {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_BYTES)
    }
}
