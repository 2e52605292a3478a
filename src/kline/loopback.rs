//! Echo suppression buffer.
//!
//! The K-line is a shared wire, so every byte the host transmits is read
//! back a moment later. Instead of time-based filtering, the writer appends
//! each transmitted frame to this FIFO and the reader pops the same number
//! of bytes when it completes a frame: a genuine echo always matches next
//! in order because the transport is FIFO.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Bounded FIFO of the most recently transmitted frame bytes.
///
/// The writer task is the only producer and the reader task the only
/// consumer; reads never block. When an append would exceed the bound the
/// oldest bytes are discarded, which only ever forgets echoes that were
/// missed anyway.
pub(crate) struct EchoRing {
    buf: Mutex<VecDeque<u8>>,
    capacity: usize,
}

impl EchoRing {
    /// Create a ring bounded at `capacity` bytes.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append transmitted bytes, discarding the oldest on overflow.
    pub(crate) fn push(&self, bytes: &[u8]) {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        while buf.len() + bytes.len() > self.capacity {
            buf.pop_front();
        }
        buf.extend(bytes);
    }

    /// Pop up to `len` bytes. Returns fewer (possibly zero) when the ring
    /// holds fewer; an empty ring is an ordinary outcome, not an error.
    pub(crate) fn take(&self, len: usize) -> Vec<u8> {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        let n = len.min(buf.len());
        buf.drain(..n).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buf.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_returns_bytes_in_fifo_order() {
        let ring = EchoRing::new(16);
        ring.push(&[1, 2, 3]);
        ring.push(&[4, 5]);
        assert_eq!(ring.take(4), vec![1, 2, 3, 4]);
        assert_eq!(ring.take(4), vec![5]);
    }

    #[test]
    fn take_from_empty_ring_is_empty() {
        let ring = EchoRing::new(16);
        assert!(ring.take(8).is_empty());
    }

    #[test]
    fn overflow_discards_oldest_bytes() {
        let ring = EchoRing::new(4);
        ring.push(&[1, 2, 3]);
        ring.push(&[4, 5, 6]);
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.take(4), vec![3, 4, 5, 6]);
    }

    #[test]
    fn take_consumes_even_on_partial_request() {
        let ring = EchoRing::new(16);
        ring.push(&[9, 8]);
        assert_eq!(ring.take(5), vec![9, 8]);
        assert_eq!(ring.len(), 0);
    }
}
