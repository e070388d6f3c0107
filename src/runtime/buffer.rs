//! Fixed-capacity operation buffers.
//!
//! Every receive and send stages its bytes in an [`OpBuffer`] whose capacity
//! is the configured buffer size. The capacity never grows: reads are capped
//! at the remaining space and payload copies are truncated, so one operation
//! never moves more than one buffer's worth of bytes.

use bytes::BytesMut;
use std::io::{self, Read};

/// A byte buffer with a hard capacity limit.
#[derive(Debug)]
pub struct OpBuffer {
    /// Filled bytes. `data.len()` never exceeds `capacity`.
    data: BytesMut,
    capacity: usize,
}

impl OpBuffer {
    /// Create an empty buffer that holds at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Create a buffer holding `payload`, truncated to `capacity`.
    pub fn from_payload(payload: &[u8], capacity: usize) -> Self {
        let mut buf = Self::with_capacity(capacity);
        buf.fill_from(payload);
        buf
    }

    /// Maximum number of bytes this buffer holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of filled bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining room before the buffer is full.
    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// The filled bytes.
    pub fn filled(&self) -> &[u8] {
        &self.data
    }

    /// Append as much of `payload` as fits. Returns the number of bytes copied.
    pub fn fill_from(&mut self, payload: &[u8]) -> usize {
        let n = payload.len().min(self.remaining());
        self.data.extend_from_slice(&payload[..n]);
        n
    }

    /// Perform one read into the unfilled part of the buffer.
    ///
    /// Returns whatever the reader returned; on success the filled length
    /// grows by that many bytes.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let start = self.data.len();
        self.data.resize(self.capacity, 0);
        match reader.read(&mut self.data[start..]) {
            Ok(n) => {
                self.data.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.data.truncate(start);
                Err(e)
            }
        }
    }

    /// Drop the filled bytes, keeping the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}
