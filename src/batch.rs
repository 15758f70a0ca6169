// SPDX-License-Identifier: Apache-2.0 OR MIT

//! High-level bulk operations over a [`Storage`]: read/write many records
//! at once, and block for the change queue to advance.
//!
//! Grounded in `original_source/src/batch.c`. The blocking variant is
//! paced by repeated polling with a short sleep between checks — the
//! original uses `batch_is_done` spinning with a one-tick sleep against
//! `storage_get_queue_head`, not a condition variable, and this crate
//! preserves that (the storage segment is shared across processes, so a
//! condvar isn't available across that boundary anyway).

use crate::clock::{self, Microsec};
use crate::error::{Error, Result};
use crate::storage::Storage;

/// One polling tick while waiting for the change queue to advance.
const POLL_TICK_USEC: Microsec = 200;

/// How often [`BatchContext`] re-checks storage liveness between reads.
const STORAGE_CHECK_PERIOD_USEC: Microsec = 1_000_000;

/// The result of one [`read_changed_records`] call.
#[derive(Clone, Debug, Default)]
pub struct ChangedBatch {
    pub ids: Vec<i64>,
    pub values: Vec<Vec<u8>>,
    pub revisions: Vec<i64>,
    pub timestamps: Vec<Microsec>,
}

impl ChangedBatch {
    fn clear(&mut self) {
        self.ids.clear();
        self.values.clear();
        self.revisions.clear();
        self.timestamps.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Read `ids` into `out`'s parallel arrays, one independent
/// read-lock-copy-until-stable loop per identifier. No ordering
/// guarantee across identifiers.
pub fn read_records(
    storage: &Storage,
    ids: &[i64],
    out_values: &mut Vec<Vec<u8>>,
    out_revisions: &mut Vec<i64>,
    out_timestamps: &mut Vec<Microsec>,
) -> Result<()> {
    out_values.clear();
    out_revisions.clear();
    out_timestamps.clear();
    for &id in ids {
        let rec = storage.get_record(id)?;
        loop {
            let before = rec.read_lock()?;
            let value = rec.value().to_vec();
            let ts = rec.timestamp();
            if before == rec.revision() {
                out_values.push(value);
                out_revisions.push(before);
                out_timestamps.push(ts);
                break;
            }
        }
    }
    Ok(())
}

/// Write `values[i]` into `ids[i]` for each `i`, in order. Each write
/// goes through [`Storage::write_record`], so it stamps a fresh
/// timestamp, advances the revision, and pushes to the change queue (if
/// one exists) exactly as a single `write_record` call would.
pub fn write_records(storage: &Storage, ids: &[i64], values: &[&[u8]]) -> Result<()> {
    if ids.len() != values.len() {
        return Err(Error::InvalidArg("write_records: ids/values length mismatch"));
    }
    for (&id, &value) in ids.iter().zip(values.iter()) {
        storage.write_record(id, value, None)?;
    }
    Ok(())
}

/// Block (by polling) until the change queue's `head` advances past
/// `*cursor`, or `read_timeout_usec` elapses, then drain up to
/// `max_count` entries in change-queue order, advancing `*cursor`.
///
/// `read_timeout_usec == 0` means non-blocking: return immediately with
/// whatever is available, even zero. A negative value means block
/// forever.
pub fn read_changed_records(
    storage: &Storage,
    cursor: &mut u64,
    read_timeout_usec: Microsec,
    max_count: usize,
    out: &mut ChangedBatch,
) -> Result<usize> {
    out.clear();
    if !storage.has_change_queue() {
        return Err(Error::NoChangeQueue);
    }

    let deadline = if read_timeout_usec < 0 {
        None
    } else {
        Some(clock::time()? + read_timeout_usec)
    };

    loop {
        let head = storage.queue_head();
        if head != *cursor {
            break;
        }
        if read_timeout_usec == 0 {
            return Ok(0);
        }
        if let Some(deadline) = deadline {
            if clock::time()? >= deadline {
                return Ok(0);
            }
        }
        clock::sleep(POLL_TICK_USEC)?;
    }

    let head = storage.queue_head();
    let delta = head.wrapping_sub(*cursor);
    if delta > storage.queue_capacity() {
        return Err(Error::ChangeQueueOverrun);
    }

    let n = delta.min(max_count as u64);
    for i in 0..n {
        let pos = *cursor + i;
        let id = storage.read_queue(pos)?;
        let rec = storage.get_record(id)?;
        loop {
            let before = rec.read_lock()?;
            let value = rec.value().to_vec();
            let ts = rec.timestamp();
            if before == rec.revision() {
                out.ids.push(id);
                out.values.push(value);
                out.revisions.push(before);
                out.timestamps.push(ts);
                break;
            }
        }
    }
    *cursor += n;
    Ok(n as usize)
}

/// A stateful wrapper around [`read_changed_records`] that owns its own
/// cursor and periodically checks storage liveness, for long-lived batch
/// readers that are not a [`crate::sender::Sender`] (which performs its
/// own liveness check on every main-loop iteration).
pub struct BatchContext {
    cursor: u64,
    created_at_open: Microsec,
    last_check: Microsec,
    orphan_timeout_usec: Option<Microsec>,
}

impl BatchContext {
    pub fn new(storage: &Storage, orphan_timeout_usec: Option<Microsec>) -> Result<Self> {
        Ok(Self {
            cursor: storage.queue_head(),
            created_at_open: storage.created_time(),
            last_check: clock::time()?,
            orphan_timeout_usec,
        })
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn read_changed_records(
        &mut self,
        storage: &Storage,
        read_timeout_usec: Microsec,
        max_count: usize,
        out: &mut ChangedBatch,
    ) -> Result<usize> {
        self.maybe_check_liveness(storage)?;
        read_changed_records(storage, &mut self.cursor, read_timeout_usec, max_count, out)
    }

    fn maybe_check_liveness(&mut self, storage: &Storage) -> Result<()> {
        let now = clock::time()?;
        if now - self.last_check < STORAGE_CHECK_PERIOD_USEC {
            return Ok(());
        }
        self.last_check = now;

        if storage.created_time() != self.created_at_open {
            return Err(Error::StorageRecreated);
        }
        if let Some(timeout) = self.orphan_timeout_usec {
            if now - storage.touched_time()? >= timeout {
                return Err(Error::StorageOrphaned);
            }
        }
        Ok(())
    }
}
