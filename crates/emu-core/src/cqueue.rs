//! Ordered byte FIFO shared by the USB/IP wire parser, the per-endpoint USB
//! buffers, and the USDHC PIO path.
//!
//! Unlike a fixed ring, the queue grows on demand; callers that need a cap
//! (endpoint FIFOs) enforce it by discarding the oldest bytes.

use std::collections::VecDeque;

/// Growable FIFO of bytes with peek/pop by length.
#[derive(Debug, Default)]
pub struct ByteQueue {
    q: VecDeque<u8>,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes currently queued.
    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    /// Append `bytes` at the tail.
    pub fn push(&mut self, bytes: &[u8]) {
        self.q.extend(bytes.iter().copied());
    }

    /// Copy up to `out.len()` bytes from the head without consuming them.
    ///
    /// Returns the number of bytes copied (less than `out.len()` only when
    /// the queue holds fewer bytes).
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.q.len());
        for (slot, byte) in out.iter_mut().zip(self.q.iter()).take(n) {
            *slot = *byte;
        }
        n
    }

    /// Pop up to `out.len()` bytes from the head into `out`.
    ///
    /// Returns the number of bytes popped.
    pub fn pop_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.q.len());
        for slot in out.iter_mut().take(n) {
            // The length was just checked; the queue cannot run dry here.
            *slot = self.q.pop_front().unwrap_or(0);
        }
        n
    }

    /// Pop exactly `n` bytes into a fresh vector (fewer if the queue runs dry).
    pub fn pop_vec(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.q.len());
        self.q.drain(..n).collect()
    }

    /// Drop `n` bytes from the head.
    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.q.len());
        self.q.drain(..n);
    }
}
