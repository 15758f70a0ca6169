// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The memory-mapped record store: the single-writer/many-reader segment
//! that underlies everything else in this crate.
//!
//! A [`Storage`] is a fixed-dimension array of records plus an optional
//! change queue, backed either by a regular file or (for paths prefixed
//! `shm:`) POSIX shared memory. One process creates it; any number of
//! others may open it read-only.

pub mod header;
pub mod queue;
pub mod record;

use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::clock::{self, Microsec};
use crate::error::{Error, Result};
use crate::spin::next_even;

pub use header::Layout;
pub use queue::ChangeQueue;
pub use record::RecordRef;

/// Distinguishes a POSIX shared-memory path (`shm:name`) from a regular
/// file path, per `SPEC_FULL.md` §9 ("`shm:` vs file paths").
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoragePath {
    File(PathBuf),
    Shm(String),
}

impl StoragePath {
    pub fn parse(path: &str) -> Self {
        match path.strip_prefix("shm:") {
            Some(name) => Self::Shm(format!("/{}", name.trim_start_matches('/'))),
            None => Self::File(PathBuf::from(path)),
        }
    }
}

/// Dimensions used to create a new storage.
#[derive(Clone, Debug)]
pub struct CreateSpec {
    pub base_id: i64,
    pub max_id: i64,
    pub value_size: usize,
    pub property_size: usize,
    pub queue_capacity: u64,
    pub description: String,
    pub data_version: u16,
    /// If `false`, the backing file/segment is unlinked when the last
    /// handle with `persist: false` is dropped.
    pub persist: bool,
}

/// A mapped record segment.
pub struct Storage {
    ptr: *mut u8,
    size: usize,
    path: StoragePath,
    persist: bool,
    read_only: bool,
    layout: Layout,
    base_id: i64,
    max_id: i64,
}

// SAFETY: `Storage` wraps a raw pointer into memory shared across
// processes/threads by design; all mutation goes through the spin locks
// embedded in the mapping itself (one per record, one for `touched`), so
// sharing the handle across threads is exactly the intended usage.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    fn header(&self) -> &header::RawHeader {
        // SAFETY: the header occupies the first `RAW_HEADER_SIZE` bytes
        // of a mapping of at least `self.layout.header_size` bytes, valid
        // for the lifetime of `self`.
        unsafe { &*(self.ptr as *const header::RawHeader) }
    }

    fn queue_ids_ptr(&self) -> *mut i64 {
        // SAFETY: the change queue's id ring begins immediately after the
        // fixed header fields and is sized for `queue_capacity` entries by
        // `Layout::compute`.
        unsafe { self.ptr.add(header::RAW_HEADER_SIZE) as *mut i64 }
    }

    fn change_queue(&self) -> ChangeQueue {
        // SAFETY: see `queue_ids_ptr`; capacity matches what the ring was
        // sized for at create time.
        unsafe { ChangeQueue::new(self.queue_ids_ptr(), self.layout.queue_capacity) }
    }

    /// Create a new storage, or attach to an existing one at the same
    /// path whose dimensions match exactly.
    pub fn create(path: &str, spec: CreateSpec) -> Result<Self> {
        if !(spec.queue_capacity == 0 || spec.queue_capacity.is_power_of_two()) {
            return Err(Error::InvalidCapacity(spec.queue_capacity as usize));
        }
        if spec.max_id < spec.base_id {
            return Err(Error::InvalidArg("create: max_id < base_id"));
        }

        let storage_path = StoragePath::parse(path);
        let layout = Layout::compute(spec.value_size, spec.property_size, spec.queue_capacity);
        let segment_size = layout.segment_size(spec.base_id, spec.max_id);

        let (fd, pre_existing) = open_backing_for_create(&storage_path)?;
        let file_len = fstat_size(fd)?;

        if file_len == 0 {
            ftruncate(fd, segment_size as u64)?;
        } else if pre_existing && file_len as usize != segment_size {
            // Existing file with a plausible header but different overall
            // size can't be the same layout; bail before mmap'ing it.
            // SAFETY: fd is a just-opened, owned descriptor.
            unsafe { libc::close(fd) };
            return Err(Error::StorageUnequal);
        }

        let ptr = mmap_rw(fd, segment_size)?;
        // SAFETY: fd is no longer needed once mapped; mmap holds its own
        // reference to the backing object.
        unsafe { libc::close(fd) };

        let mut storage = Self {
            ptr,
            size: segment_size,
            path: storage_path,
            persist: spec.persist,
            read_only: false,
            layout,
            base_id: spec.base_id,
            max_id: spec.max_id,
        };

        if pre_existing && file_len as usize == segment_size {
            storage.validate_existing(&spec)?;
            storage.recover_crashed_writer();
        } else {
            storage.init_fresh(&spec)?;
        }

        Ok(storage)
    }

    fn validate_existing(&self, spec: &CreateSpec) -> Result<()> {
        let hdr = self.header();
        if hdr.magic != header::MAGIC {
            return Err(Error::StorageCorrupted);
        }
        if hdr.header_size as usize != self.layout.header_size
            || hdr.record_size as usize != self.layout.record_size
            || hdr.value_size as usize != spec.value_size
            || hdr.base_id != spec.base_id
            || hdr.max_id != spec.max_id
            || hdr.queue_capacity != spec.queue_capacity
        {
            return Err(Error::StorageUnequal);
        }
        Ok(())
    }

    fn init_fresh(&mut self, spec: &CreateSpec) -> Result<()> {
        let now = clock::time()?;
        let hdr = unsafe { &mut *(self.ptr as *mut header::RawHeader) };
        hdr.file_version = header::FILE_VERSION;
        hdr.data_version = spec.data_version;
        hdr.segment_size = self.size as u64;
        hdr.header_size = self.layout.header_size as u64;
        hdr.record_size = self.layout.record_size as u64;
        hdr.value_size = spec.value_size as u64;
        hdr.property_size = spec.property_size as u64;
        hdr.value_offset = self.layout.value_offset as u64;
        hdr.property_offset = self.layout.property_offset as u64;
        hdr.base_id = spec.base_id;
        hdr.max_id = spec.max_id;
        hdr.created_time = std::sync::atomic::AtomicI64::new(now);
        hdr.touched_lock = crate::spin::SpinLock::new();
        hdr.touched_time = std::sync::atomic::AtomicI64::new(now);
        hdr.queue_capacity = spec.queue_capacity;
        hdr.queue_head = AtomicU64::new(0);

        let desc_bytes = spec.description.as_bytes();
        let n = desc_bytes.len().min(hdr.description.len() - 1);
        hdr.description[..n].copy_from_slice(&desc_bytes[..n]);
        hdr.description[n..].fill(0);

        // Magic last, with a release fence, so a concurrent opener never
        // observes a fully-zeroed-except-magic header.
        std::sync::atomic::fence(Ordering::SeqCst);
        hdr.magic = header::MAGIC;

        self.sync()
    }

    /// Clear the write-in-progress bit left by a producer that crashed
    /// mid-write, so a reader can never spin forever on a record no
    /// writer will ever unlock again.
    fn recover_crashed_writer(&mut self) {
        for id in self.base_id..self.max_id {
            if let Ok(rec) = self.get_record(id) {
                rec.force_clear_write_bit();
            }
        }
    }

    /// Open an existing storage. Read-only opens reject every mutating
    /// operation with [`Error::StorageReadOnly`].
    pub fn open(path: &str, read_only: bool) -> Result<Self> {
        let storage_path = StoragePath::parse(path);
        let fd = open_backing_for_open(&storage_path, read_only)?;
        let file_len = fstat_size(fd)? as usize;

        let ptr = if read_only {
            mmap_ro(fd, file_len)?
        } else {
            mmap_rw(fd, file_len)?
        };
        // SAFETY: fd is no longer needed once mapped.
        unsafe { libc::close(fd) };

        // SAFETY: the mapping is at least `size_of::<RawHeader>()` bytes
        // because any valid segment's header_size exceeds that; a
        // corrupt/truncated file is caught by the magic check below
        // before any other header field is trusted.
        let probe = unsafe { &*(ptr as *const header::RawHeader) };
        if probe.magic != header::MAGIC {
            // SAFETY: ptr came from a successful mmap of `file_len` bytes.
            unsafe { libc::munmap(ptr as *mut _, file_len) };
            return Err(Error::StorageCorrupted);
        }
        if probe.file_version != header::FILE_VERSION {
            let found = probe.file_version;
            unsafe { libc::munmap(ptr as *mut _, file_len) };
            return Err(Error::WrongFileVersion {
                found,
                expected: header::FILE_VERSION,
            });
        }

        let layout = Layout {
            header_size: probe.header_size as usize,
            record_size: probe.record_size as usize,
            value_offset: probe.value_offset as usize,
            property_offset: probe.property_offset as usize,
            queue_capacity: probe.queue_capacity,
        };
        let base_id = probe.base_id;
        let max_id = probe.max_id;

        let mut storage = Self {
            ptr,
            size: file_len,
            path: storage_path,
            persist: true,
            read_only,
            layout,
            base_id,
            max_id,
        };
        if !read_only {
            storage.recover_crashed_writer();
        }
        Ok(storage)
    }

    pub fn base_id(&self) -> i64 {
        self.base_id
    }

    pub fn max_id(&self) -> i64 {
        self.max_id
    }

    pub fn value_size(&self) -> usize {
        self.header().value_size as usize
    }

    pub fn property_size(&self) -> usize {
        self.header().property_size as usize
    }

    pub fn description(&self) -> String {
        let bytes = &self.header().description;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    pub fn data_version(&self) -> u16 {
        self.header().data_version
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn created_time(&self) -> Microsec {
        self.header().created_time.load(Ordering::Acquire)
    }

    pub fn queue_capacity(&self) -> u64 {
        self.layout.queue_capacity
    }

    pub fn queue_head(&self) -> u64 {
        self.header().queue_head.load(Ordering::Acquire)
    }

    fn record_ptr(&self, id: i64) -> Result<*mut u8> {
        if id < self.base_id || id >= self.max_id {
            return Err(Error::OutOfRange(id));
        }
        let index = (id - self.base_id) as usize;
        // SAFETY: `index < max_id - base_id`, so the offset stays within
        // the mapping, which was sized for exactly that many records.
        Ok(unsafe {
            self.ptr
                .add(self.layout.header_size + index * self.layout.record_size)
        })
    }

    pub fn get_record(&self, id: i64) -> Result<RecordRef<'_>> {
        let ptr = self.record_ptr(id)?;
        // SAFETY: `record_ptr` validated bounds; the slot is at least
        // `layout.record_size` bytes, which covers value/property offsets
        // by construction.
        Ok(unsafe {
            RecordRef::new(
                ptr,
                self.layout.value_offset,
                self.value_size(),
                self.layout.property_offset,
                self.property_size(),
            )
        })
    }

    fn require_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::StorageReadOnly);
        }
        Ok(())
    }

    /// Write `value` (and optional `property`) into `id`'s slot, stamping
    /// the current time and advancing its revision, then append `id` to
    /// the change queue if one exists.
    pub fn write_record(&self, id: i64, value: &[u8], property: Option<&[u8]>) -> Result<()> {
        self.require_writable()?;
        if value.len() > self.value_size() {
            return Err(Error::ValueTooLarge {
                given: value.len(),
                max: self.value_size(),
            });
        }
        let rec = self.get_record(id)?;
        let now = clock::time()?;
        let prior = rec.write_lock()?;
        rec.value_mut()[..value.len()].copy_from_slice(value);
        if let (Some(src), Some(dst)) = (property, rec.property_mut()) {
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
        rec.set_timestamp(now);
        rec.unlock(next_even(prior));
        self.push_queue(id)
    }

    /// Append `id` to the change queue. A no-op success if the storage
    /// has no change queue configured... actually fails with
    /// [`Error::NoChangeQueue`]; callers that don't care should check
    /// [`Storage::has_change_queue`] first.
    pub fn push_queue(&self, id: i64) -> Result<()> {
        self.require_writable()?;
        if !self.change_queue().has_queue() {
            return Ok(());
        }
        self.change_queue().push(&self.header().queue_head, id)
    }

    pub fn has_change_queue(&self) -> bool {
        self.layout.queue_capacity > 0
    }

    /// Read the identifier stored at absolute queue position `pos`.
    pub fn read_queue(&self, pos: u64) -> Result<i64> {
        self.change_queue().read(pos)
    }

    /// Read the storage's touched timestamp under its dedicated lock.
    pub fn touched_time(&self) -> Result<Microsec> {
        let hdr = self.header();
        hdr.touched_lock.read_lock()?;
        Ok(hdr.touched_time.load(Ordering::Acquire))
    }

    /// Refresh the touched timestamp. Called periodically by
    /// [`crate::toucher::Toucher`].
    pub fn touch(&self, now: Microsec) -> Result<()> {
        self.require_writable()?;
        let hdr = self.header();
        hdr.touched_lock.write_lock()?;
        hdr.touched_time.store(now, Ordering::Release);
        hdr.touched_lock.unlock(0);
        Ok(())
    }

    /// Walk `[first, limit)`, optionally resuming from `prior` (exclusive).
    /// `f` returns `Ok(true)` to continue, `Ok(false)` to stop early.
    pub fn iterate(
        &self,
        first: i64,
        limit: i64,
        prior: Option<i64>,
        mut f: impl FnMut(i64, &RecordRef<'_>) -> Result<bool>,
    ) -> Result<()> {
        let start = prior.map(|p| p + 1).unwrap_or(first).max(first);
        for id in start..limit {
            let rec = self.get_record(id)?;
            if !f(id, &rec)? {
                break;
            }
        }
        Ok(())
    }

    /// The lowest identifier at or after `from` whose record has never
    /// been written (revision 0). Used by the compaction helpers.
    pub fn find_next_unused(&self, from: i64) -> Result<Option<i64>> {
        for id in from.max(self.base_id)..self.max_id {
            if self.get_record(id)?.revision() == 0 {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// The highest identifier at or before `from` whose record has been
    /// written at least once.
    pub fn find_prev_used(&self, from: i64) -> Result<Option<i64>> {
        let mut id = from.min(self.max_id - 1);
        while id >= self.base_id {
            if self.get_record(id)?.revision() != 0 {
                return Ok(Some(id));
            }
            id -= 1;
        }
        Ok(None)
    }

    /// Zero `id`'s slot and reset its revision to 0.
    pub fn clear_record(&self, id: i64) -> Result<()> {
        self.require_writable()?;
        self.get_record(id)?.clear();
        Ok(())
    }

    /// One step of erase-and-compact: find the lowest never-written slot
    /// and the highest written one and, if the former precedes the
    /// latter, move the latter into the former's hole and clear it.
    ///
    /// Returns `Some((src, dst))` naming the slots involved if a move
    /// happened, or `None` if the storage is already compact (no unused
    /// hole precedes any used slot). Driving a full erase-and-compact
    /// pass over several freshly-cleared identifiers is a caller
    /// responsibility — this primitive only ever performs one move, the
    /// same granularity as the `storage_find_next_unused`/
    /// `storage_find_prev_used` pair the CLI-only `eraser -c` driver was
    /// built on.
    pub fn compact_one(&self) -> Result<Option<(i64, i64)>> {
        self.require_writable()?;
        let Some(dst) = self.find_next_unused(self.base_id)? else {
            return Ok(None);
        };
        let Some(src) = self.find_prev_used(self.max_id - 1)? else {
            return Ok(None);
        };
        if dst >= src {
            return Ok(None);
        }
        self.copy_record(src, dst)?;
        Ok(Some((src, dst)))
    }

    /// Move the record at `src` into the (previously unused) slot `dst`,
    /// preserving the source's revision and timestamp so readers still
    /// see monotonic progress, then clear `src`.
    pub fn copy_record(&self, src: i64, dst: i64) -> Result<()> {
        self.require_writable()?;
        let src_rec = self.get_record(src)?;
        let dst_rec = self.get_record(dst)?;
        let rev;
        loop {
            let r = src_rec.read_lock()?;
            dst_rec.value_mut().copy_from_slice(src_rec.value());
            if let (Some(s), Some(d)) = (src_rec.property(), dst_rec.property_mut()) {
                d.copy_from_slice(s);
            }
            dst_rec.set_timestamp(src_rec.timestamp());
            if r == src_rec.revision() {
                rev = r;
                break;
            }
        }
        dst_rec.unlock(rev);
        src_rec.clear();
        Ok(())
    }

    /// Zero every record's value/property and reset its revision to 0,
    /// without taking any per-record write lock.
    ///
    /// # Safety
    /// The caller must guarantee there are no concurrent readers or
    /// writers of this storage for the duration of the call. This
    /// preserves the original implementation's behavior exactly: the
    /// precondition is documented, not enforced.
    pub unsafe fn reset(&self) -> Result<()> {
        self.require_writable()?;
        for id in self.base_id..self.max_id {
            let rec = self.get_record(id)?;
            rec.value_mut().fill(0);
            if let Some(p) = rec.property_mut() {
                p.fill(0);
            }
            rec.set_timestamp(0);
            // Plain store, bypassing the lock protocol entirely, matching
            // `storage_reset`'s documented unsafety.
            rec.unlock(0);
        }
        Ok(())
    }

    /// Flush the mapping to its backing store.
    pub fn sync(&self) -> Result<()> {
        // SAFETY: `self.ptr`/`self.size` describe the live mapping for
        // the lifetime of `self`.
        let rc = unsafe { libc::msync(self.ptr as *mut _, self.size, libc::MS_SYNC) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Create a new storage at `dest_path` with different dimensions and
    /// copy every record across using the stability-loop protocol,
    /// preserving description and data version.
    pub fn grow(&self, dest_path: &str, new_base_id: i64, new_max_id: i64) -> Result<Storage> {
        let dest = Storage::create(
            dest_path,
            CreateSpec {
                base_id: new_base_id,
                max_id: new_max_id,
                value_size: self.value_size(),
                property_size: self.property_size(),
                queue_capacity: self.layout.queue_capacity,
                description: self.description(),
                data_version: self.data_version(),
                persist: self.persist,
            },
        )?;

        self.iterate(self.base_id, self.max_id, None, |id, rec| {
            if id < new_base_id || id >= new_max_id {
                return Ok(true);
            }
            let dst = dest.get_record(id)?;
            let rev;
            loop {
                let r = rec.read_lock()?;
                let n = rec.value().len().min(dst.value().len());
                dst.value_mut()[..n].copy_from_slice(&rec.value()[..n]);
                if n < dst.value().len() {
                    dst.value_mut()[n..].fill(0);
                }
                dst.set_timestamp(rec.timestamp());
                if r == rec.revision() {
                    rev = r;
                    break;
                }
            }
            dst.unlock(rev);
            Ok(true)
        })?;

        Ok(dest)
    }

    /// Delete the backing file/shared-memory object at `path`.
    /// `suppress_not_found` turns a missing backing object into success.
    pub fn delete(path: &str, suppress_not_found: bool) -> Result<()> {
        match StoragePath::parse(path) {
            StoragePath::File(p) => match std::fs::remove_file(&p) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && suppress_not_found => {
                    Ok(())
                }
                Err(e) => Err(Error::Io(e)),
            },
            StoragePath::Shm(name) => {
                let cname = CString::new(name).map_err(|_| {
                    Error::InvalidArg("delete: shm name contains a nul byte")
                })?;
                // SAFETY: `cname` is a valid, nul-terminated C string for
                // the duration of the call.
                let rc = unsafe { libc::shm_unlink(cname.as_ptr()) };
                if rc == 0 {
                    return Ok(());
                }
                let err = std::io::Error::last_os_error();
                if suppress_not_found && err.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(Error::Io(err))
                }
            }
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        // SAFETY: `self.ptr`/`self.size` describe the live mapping owned
        // by this `Storage`; nothing else holds a reference once dropped.
        unsafe { libc::munmap(self.ptr as *mut _, self.size) };
        if !self.persist {
            let path_str = match &self.path {
                StoragePath::File(p) => p.to_string_lossy().into_owned(),
                StoragePath::Shm(name) => format!("shm:{}", name.trim_start_matches('/')),
            };
            let _ = Storage::delete(&path_str, true);
        }
    }
}

fn open_backing_for_create(path: &StoragePath) -> Result<(RawFd, bool)> {
    match path {
        StoragePath::File(p) => {
            let existed = p.exists();
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(p)?;
            let fd = file.as_raw_fd();
            std::mem::forget(file);
            Ok((fd, existed))
        }
        StoragePath::Shm(name) => {
            let cname = CString::new(name.as_str())
                .map_err(|_| Error::InvalidArg("create: shm name contains a nul byte"))?;
            // SAFETY: `cname` is a valid C string; flags/mode are
            // standard POSIX shm_open arguments.
            let existing = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
            if existing >= 0 {
                return Ok((existing, true));
            }
            // SAFETY: see above.
            let fd = unsafe {
                libc::shm_open(cname.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600)
            };
            if fd < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            Ok((fd, false))
        }
    }
}

fn open_backing_for_open(path: &StoragePath, read_only: bool) -> Result<RawFd> {
    let flags = if read_only {
        libc::O_RDONLY
    } else {
        libc::O_RDWR
    };
    match path {
        StoragePath::File(p) => {
            let file = OpenOptions::new()
                .read(true)
                .write(!read_only)
                .open(p)?;
            let fd = file.as_raw_fd();
            std::mem::forget(file);
            Ok(fd)
        }
        StoragePath::Shm(name) => {
            let cname = CString::new(name.as_str())
                .map_err(|_| Error::InvalidArg("open: shm name contains a nul byte"))?;
            // SAFETY: `cname` is a valid C string.
            let fd = unsafe { libc::shm_open(cname.as_ptr(), flags, 0) };
            if fd < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            Ok(fd)
        }
    }
}

fn fstat_size(fd: RawFd) -> Result<i64> {
    // SAFETY: `fd` is a valid, open descriptor for the duration of the
    // call; `stat` is zero-initialized before use.
    unsafe {
        let mut stat: libc::stat = std::mem::zeroed();
        if libc::fstat(fd, &mut stat) != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(stat.st_size)
    }
}

fn ftruncate(fd: RawFd, size: u64) -> Result<()> {
    // SAFETY: `fd` is valid and open.
    let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn mmap_rw(fd: RawFd, size: usize) -> Result<*mut u8> {
    // SAFETY: `fd` refers to a file/shm object of at least `size` bytes
    // (the caller has just created or validated it); `MAP_SHARED` makes
    // writes visible to other mappers, which is the entire point.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(ptr as *mut u8)
}

fn mmap_ro(fd: RawFd, size: usize) -> Result<*mut u8> {
    // SAFETY: see `mmap_rw`; `PROT_READ` only, matching the read-only
    // open contract enforced by `Storage::require_writable`.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(ptr as *mut u8)
}
