// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A single record slot: revision lock, timestamp, value, optional
//! property, all packed contiguously per [`super::header::Layout`].

use std::sync::atomic::{AtomicI64, Ordering};

use crate::clock::Microsec;
use crate::spin::SpinLock;

/// A borrowed view onto one record slot inside the mapped segment.
///
/// `RecordRef` does not own the memory it points at; its lifetime is tied
/// to the [`super::Storage`] that produced it via the `'seg` parameter.
pub struct RecordRef<'seg> {
    ptr: *mut u8,
    value_offset: usize,
    value_size: usize,
    property_offset: usize,
    property_size: usize,
    _marker: std::marker::PhantomData<&'seg ()>,
}

impl<'seg> RecordRef<'seg> {
    /// # Safety
    /// `ptr` must point to a valid, live record slot of at least
    /// `value_offset + value_size` (or `property_offset + property_size`
    /// if larger) bytes, for the lifetime `'seg`.
    pub unsafe fn new(
        ptr: *mut u8,
        value_offset: usize,
        value_size: usize,
        property_offset: usize,
        property_size: usize,
    ) -> Self {
        Self {
            ptr,
            value_offset,
            value_size,
            property_offset,
            property_size,
            _marker: std::marker::PhantomData,
        }
    }

    fn lock(&self) -> &SpinLock {
        // SAFETY: the revision lock occupies the first 8 bytes of every
        // record slot, and `ptr` is valid for the slot's full length for
        // `'seg` per the constructor's contract.
        unsafe { &*(self.ptr as *const SpinLock) }
    }

    fn timestamp_atomic(&self) -> &AtomicI64 {
        // SAFETY: the timestamp occupies the 8 bytes immediately following
        // the revision lock, within the same bounds as `lock()`.
        unsafe { &*(self.ptr.add(8) as *const AtomicI64) }
    }

    pub fn read_lock(&self) -> crate::error::Result<i64> {
        self.lock().read_lock()
    }

    pub fn write_lock(&self) -> crate::error::Result<i64> {
        self.lock().write_lock()
    }

    pub fn unlock(&self, new_revision: i64) {
        self.lock().unlock(new_revision);
    }

    pub fn revision(&self) -> i64 {
        self.lock().read_revision()
    }

    /// Unconditionally clear the write-in-progress bit, used only while
    /// recovering a segment after an unclean shutdown.
    pub fn force_clear_write_bit(&self) {
        self.lock().force_clear_write_bit();
    }

    pub fn timestamp(&self) -> Microsec {
        self.timestamp_atomic().load(Ordering::Acquire)
    }

    pub fn set_timestamp(&self, usec: Microsec) {
        self.timestamp_atomic().store(usec, Ordering::Release);
    }

    pub fn value(&self) -> &[u8] {
        // SAFETY: `value_offset + value_size` is within the slot's bounds
        // by construction (see `Layout::compute`).
        unsafe { std::slice::from_raw_parts(self.ptr.add(self.value_offset), self.value_size) }
    }

    pub fn value_mut(&self) -> &mut [u8] {
        // SAFETY: see `value()`; `&mut` is sound because callers only
        // obtain it while holding the write lock (enforced by the caller,
        // not the type system, matching the single-writer contract).
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.add(self.value_offset), self.value_size)
        }
    }

    pub fn property(&self) -> Option<&[u8]> {
        if self.property_size == 0 {
            return None;
        }
        // SAFETY: bounds established identically to `value()`.
        Some(unsafe {
            std::slice::from_raw_parts(self.ptr.add(self.property_offset), self.property_size)
        })
    }

    pub fn property_mut(&self) -> Option<&mut [u8]> {
        if self.property_size == 0 {
            return None;
        }
        // SAFETY: see `property()`; same writer-exclusivity contract as
        // `value_mut()`.
        Some(unsafe {
            std::slice::from_raw_parts_mut(self.ptr.add(self.property_offset), self.property_size)
        })
    }

    /// Zero the slot and reset its revision to 0 ("never written").
    /// Callers must hold exclusive access; this does not itself take the
    /// write lock (mirrors `storage_clear_record` in the original).
    pub fn clear(&self) {
        self.value_mut().fill(0);
        if let Some(p) = self.property_mut() {
            p.fill(0);
        }
        self.set_timestamp(0);
        self.lock().unlock(0);
    }
}
