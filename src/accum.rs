// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A bounded byte buffer that remembers when it was first touched.
//!
//! Used by the sender as the scratch area for the multicast packet
//! currently being assembled: bytes accumulate until either the buffer is
//! full or it has been open too long, at which point it is flushed and
//! [`Accumulator::clear`] resets both the buffer and the staleness clock.

use crate::clock::{self, Microsec};
use crate::error::Result;

pub struct Accumulator {
    buf: Vec<u8>,
    capacity: usize,
    max_age_usec: Microsec,
    insert_time: Option<Microsec>,
}

impl Accumulator {
    pub fn new(capacity: usize, max_age_usec: Microsec) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            max_age_usec,
            insert_time: None,
        }
    }

    /// Append `bytes`. Returns `false` (not an error) if there is not
    /// enough remaining space; the caller is expected to flush and retry
    /// against a cleared accumulator. The staleness clock is latched on
    /// the first successful store since the last [`clear`](Self::clear),
    /// not on every store.
    pub fn store(&mut self, bytes: &[u8]) -> Result<bool> {
        if self.buf.len() + bytes.len() > self.capacity {
            return Ok(false);
        }
        if self.insert_time.is_none() {
            self.insert_time = Some(clock::time()?);
        }
        self.buf.extend_from_slice(bytes);
        Ok(true)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable access to the bytes stored so far, for patching a
    /// already-stored field (the sender uses this to fill in a
    /// datagram's send-timestamp once the packet is ready to go out).
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Takes ownership of the accumulated bytes, leaving the buffer
    /// empty but the staleness clock untouched (callers that are about
    /// to start a new packet should follow up with [`Self::clear`]).
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `true` once `max_age_usec` has elapsed since the first store after
    /// the last clear. An accumulator that has never been stored into, or
    /// whose `max_age_usec` is non-positive, is never stale.
    pub fn is_stale(&self, now: Microsec) -> bool {
        if self.max_age_usec <= 0 {
            return false;
        }
        match self.insert_time {
            Some(t) => now - t >= self.max_age_usec,
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.insert_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_fails_without_error_when_full() {
        let mut a = Accumulator::new(4, 1_000);
        assert!(a.store(&[1, 2, 3]).unwrap());
        assert!(!a.store(&[4, 5]).unwrap());
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn insert_time_latches_on_first_store_only() {
        let mut a = Accumulator::new(16, 1_000_000);
        assert!(!a.is_stale(clock::time().unwrap()));
        a.store(&[1]).unwrap();
        let now = clock::time().unwrap();
        assert!(!a.is_stale(now));
        assert!(a.is_stale(now + 2_000_000));
    }

    #[test]
    fn clear_resets_buffer_and_timer() {
        let mut a = Accumulator::new(4, 1);
        a.store(&[1, 2]).unwrap();
        a.clear();
        assert!(a.is_empty());
        assert!(!a.is_stale(clock::time().unwrap() + 100));
    }

    #[test]
    fn non_positive_max_age_never_stale() {
        let mut a = Accumulator::new(4, 0);
        a.store(&[1]).unwrap();
        assert!(!a.is_stale(clock::time().unwrap() + 1_000_000_000));
    }
}
