//! Bounded ring buffer of recent PTY output.
//!
//! Output is kept as the chunks the PTY produced rather than per byte, so
//! eviction is cheap and a snapshot is a single concatenation. Eviction is
//! FIFO and stops while only one chunk remains: a single chunk larger than
//! the cap is retained whole.

use std::collections::VecDeque;

/// Default capacity in bytes (200 KiB).
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 200 * 1024;

/// Chunked FIFO byte store with a soft byte cap.
///
/// Invariant: `total_bytes() <= capacity()` or `chunk_count() == 1`.
#[derive(Debug)]
pub struct OutputRing {
    chunks: VecDeque<Vec<u8>>,
    total_bytes: usize,
    capacity: usize,
}

impl OutputRing {
    /// Creates an empty ring with the given byte capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            capacity,
        }
    }

    /// Appends one output chunk, evicting from the head while over capacity.
    pub fn push(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk);

        while self.total_bytes > self.capacity && self.chunks.len() > 1 {
            if let Some(evicted) = self.chunks.pop_front() {
                self.total_bytes -= evicted.len();
            }
        }
    }

    /// Concatenation of everything currently buffered.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Total buffered bytes.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Number of buffered chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// The configured byte cap.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
