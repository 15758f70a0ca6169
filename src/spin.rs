// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The revision lock: a signed 64-bit word that is simultaneously a
//! version counter and a single-writer/many-reader mutex.
//!
//! The high bit marks "write in progress". A reader never stores; it spins
//! until the word is non-negative, reads it, and the caller re-checks it
//! after copying the payload. A writer atomically sets the high bit, spins
//! if someone else got there first, and on unlock issues a full barrier
//! before storing the new (strictly greater, even) revision.
//!
//! Spinning escalates: [`MAX_SPINS`] tight CPU-relax iterations, then
//! 1&nbsp;ms sleeps, up to a cumulative second before giving up with
//! [`Error::DeadlockDetected`].

use std::sync::atomic::{AtomicI64, Ordering};

use crate::clock;
use crate::error::{Error, Result};

const SIGN_MASK: i64 = i64::MIN;
const MAX_SPINS: u32 = 10_000;
const SLEEP_USEC: i64 = 1_000;
const MAX_WAIT_USEC: i64 = 1_000_000;
const MAX_SLEEPS: u32 = (MAX_WAIT_USEC / SLEEP_USEC) as u32;

/// A revision word. `repr(transparent)` so it can sit inline in a mapped
/// record without indirection.
#[repr(transparent)]
pub struct SpinLock(AtomicI64);

impl SpinLock {
    /// A freshly created, unlocked lock at revision 0.
    pub const fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    /// Construct a lock pre-set to `revision` (used when mapping an
    /// existing segment rather than initializing a fresh one).
    pub const fn with_revision(revision: i64) -> Self {
        Self(AtomicI64::new(revision))
    }

    /// Current raw word, including the sign bit if a write is in
    /// progress. Not itself synchronizing; callers that need a consistent
    /// snapshot should use [`read_lock`](Self::read_lock).
    pub fn raw(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Clear the write-in-progress bit unconditionally. Used only when
    /// reopening a segment after an unclean shutdown, where a crashed
    /// writer may have left the high bit set with no writer left to clear
    /// it (see [`crate::storage`]'s reopen recovery).
    pub fn force_clear_write_bit(&self) {
        self.0.fetch_and(!SIGN_MASK, Ordering::SeqCst);
    }

    /// Spin (and eventually sleep) until the word is non-negative, then
    /// return it. The caller must re-read the payload and compare its
    /// revision against this value in a loop, since the word may have
    /// been written again by the time the payload copy finishes.
    pub fn read_lock(&self) -> Result<i64> {
        let mut spins = 0u32;
        let mut sleeps = 0u32;
        loop {
            let rev = self.0.load(Ordering::Acquire);
            if rev >= 0 {
                return Ok(rev);
            }
            if spins < MAX_SPINS {
                spins += 1;
                std::hint::spin_loop();
            } else {
                sleeps += 1;
                if sleeps > MAX_SLEEPS {
                    return Err(Error::DeadlockDetected);
                }
                clock::sleep(SLEEP_USEC)?;
            }
        }
    }

    /// Read the current revision without blocking or locking. For
    /// optimistic consumers (the storage change queue, diagnostics) that
    /// only need an approximate value.
    pub fn read_revision(&self) -> i64 {
        self.0.load(Ordering::Acquire) & !SIGN_MASK
    }

    /// Atomically set the write-in-progress bit and return the prior
    /// value. If another writer already held it, spin (then sleep) until
    /// it clears, retrying the fetch-or each time.
    pub fn write_lock(&self) -> Result<i64> {
        let mut spins = 0u32;
        let mut sleeps = 0u32;
        loop {
            let prior = self.0.fetch_or(SIGN_MASK, Ordering::AcqRel);
            if prior >= 0 {
                return Ok(prior);
            }
            if spins < MAX_SPINS {
                spins += 1;
                std::hint::spin_loop();
            } else {
                sleeps += 1;
                if sleeps > MAX_SLEEPS {
                    return Err(Error::DeadlockDetected);
                }
                clock::sleep(SLEEP_USEC)?;
            }
        }
    }

    /// Release the lock, publishing `new_revision`. Issues a full fence so
    /// every store made while holding the lock is visible to a reader that
    /// subsequently observes `new_revision`.
    pub fn unlock(&self, new_revision: i64) {
        std::sync::atomic::fence(Ordering::SeqCst);
        self.0.store(new_revision, Ordering::Release);
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// The next even revision following a successful write, with the sign bit
/// (if any, e.g. from a stale fetch-or) stripped.
pub const fn next_even(prior: i64) -> i64 {
    (prior.wrapping_add(2)) & !SIGN_MASK
}
