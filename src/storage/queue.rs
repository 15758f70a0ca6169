// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The change queue: a power-of-two ring of identifiers threaded through
//! the header region, with a monotonically increasing `head`.
//!
//! A slot is written *before* `head` is advanced past it, with a memory
//! barrier between the two stores, so a consumer that observes a new
//! `head` value is guaranteed to see the identifier already in place
//! (`SPEC_FULL.md` §5, ordering guarantee 2).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

pub struct ChangeQueue {
    ids_ptr: *mut i64,
    capacity: u64,
}

impl ChangeQueue {
    /// # Safety
    /// `ids_ptr` must point to `max(1, capacity)` contiguous, live `i64`
    /// slots for as long as this `ChangeQueue` is used. `head_ptr` must
    /// point to a live `AtomicU64`. `capacity` must be 0 or a power of
    /// two.
    pub unsafe fn new(ids_ptr: *mut i64, capacity: u64) -> Self {
        Self { ids_ptr, capacity }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn has_queue(&self) -> bool {
        self.capacity > 0
    }

    fn slot(&self, index: u64) -> *mut i64 {
        let slot_index = index & (self.capacity - 1);
        // SAFETY: `slot_index < capacity` by the mask above, and
        // `ids_ptr` is valid for `capacity` slots per the constructor's
        // contract.
        unsafe { self.ids_ptr.add(slot_index as usize) }
    }

    /// Push `id` at `head` (obtained from `head_atomic`'s current value)
    /// and advance it by one, with a full barrier between the payload
    /// store and the `head` publish.
    pub fn push(&self, head_atomic: &AtomicU64, id: i64) -> Result<()> {
        if !self.has_queue() {
            return Err(Error::NoChangeQueue);
        }
        let head = head_atomic.load(Ordering::Relaxed);
        // SAFETY: `slot()` returns a pointer within the ring established
        // by `new`'s contract; nothing else writes this slot concurrently
        // because the queue has exactly one writer by construction.
        unsafe { self.slot(head).write(id) };
        std::sync::atomic::fence(Ordering::SeqCst);
        head_atomic.store(head + 1, Ordering::Release);
        Ok(())
    }

    /// Read the identifier at absolute queue position `pos`. The caller
    /// is responsible for ensuring `pos` is still within the live window
    /// `[head - capacity, head)`; reading further back returns stale data
    /// that has been overwritten.
    pub fn read(&self, pos: u64) -> Result<i64> {
        if !self.has_queue() {
            return Err(Error::NoChangeQueue);
        }
        // SAFETY: see `push`; reading is always in-bounds for any `pos`.
        Ok(unsafe { self.slot(pos).read() })
    }
}
