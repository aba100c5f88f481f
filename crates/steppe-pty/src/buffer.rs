//! Bounded buffer for PTY output waiting to be polled

use bytes::Bytes;
use std::collections::VecDeque;

/// Overflow accounting for one session's output buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputStats {
    /// Bytes waiting for the next read
    pub buffered: usize,
    /// Configured cap
    pub capacity: usize,
    /// Bytes discarded because the reader fell behind
    pub dropped_bytes: u64,
    /// Number of overflow episodes (first drop after a read starts one)
    pub overflows: u64,
}

/// Byte buffer that keeps at most `capacity` unread bytes.
///
/// When a push would exceed the cap the oldest unread bytes are discarded, so
/// a slow consumer always sees the most recent output.
#[derive(Debug)]
pub struct OutputBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    dropped_total: u64,
    dropped_since_take: u64,
    overflows: u64,
    overflowing: bool,
    eof: bool,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            dropped_total: 0,
            dropped_since_take: 0,
            overflows: 0,
            overflowing: false,
            eof: false,
        }
    }

    /// Append output, returning how many bytes had to be dropped
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        let dropped = if chunk.len() >= self.capacity {
            let dropped = self.data.len() + (chunk.len() - self.capacity);
            self.data.clear();
            self.data.extend(&chunk[chunk.len() - self.capacity..]);
            dropped
        } else {
            let excess = (self.data.len() + chunk.len()).saturating_sub(self.capacity);
            self.data.drain(..excess);
            self.data.extend(chunk);
            excess
        };

        if dropped > 0 {
            self.dropped_total += dropped as u64;
            self.dropped_since_take += dropped as u64;
            if !self.overflowing {
                self.overflowing = true;
                self.overflows += 1;
            }
        }
        dropped
    }

    /// Drain everything buffered, along with the bytes dropped since the
    /// previous take
    pub fn take(&mut self) -> (Bytes, u64) {
        let data: Vec<u8> = self.data.drain(..).collect();
        let dropped = std::mem::take(&mut self.dropped_since_take);
        self.overflowing = false;
        (Bytes::from(data), dropped)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record that the PTY reached end of file
    pub fn mark_eof(&mut self) {
        self.eof = true;
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn stats(&self) -> OutputStats {
        OutputStats {
            buffered: self.data.len(),
            capacity: self.capacity,
            dropped_bytes: self.dropped_total,
            overflows: self.overflows,
        }
    }
}
