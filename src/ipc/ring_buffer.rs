// THEORY:
// The ring buffer is the data plane of the engine. It is a fixed-capacity ring
// of fixed-size byte slots living in a memory-mapped region, so the same ring
// can be shared by threads of one process or, when file-backed (for example
// under /dev/shm), attached from another process.
//
// Layout of the mapped region:
//
// ```text
// Header (128 bytes):
//   [0:8]    Magic "LARVARNG"
//   [8:12]   Version (u32)
//   [12:16]  Capacity in slots (u32)
//   [16:24]  Element size in bytes (u64)
//   [24:32]  Write cursor (atomic u64, total commits)
//   [32:40]  Read cursor (atomic u64, total consumed or dropped)
//   [40:44]  Overflow latch (atomic u32)
//   [44:48]  Data-available signal (atomic u32)
//   [48:56]  Dropped slots (atomic u64)
//   [56:64]  Dequeued slots (atomic u64)
//   [64:72]  Torn reads (atomic u64)
//   [72:128] Padding
//
// Then `capacity` slots, each:
//   [0:8]    Sequence stamp (atomic u64; odd while being written)
//   [8:...]  Element bytes, padded to a multiple of 8
// ```
//
// Cursors are monotonic counters; the slot for cursor `c` is `c % capacity`.
// One slot is always kept free, so the ring is full when
// `write - read == capacity - 1` and empty when `write == read`.
//
// Key behaviors:
// 1.  **The writer never blocks.** Committing into a full ring latches the
//     overflow flag, pushes the read cursor past the oldest slot (counted as a
//     drop) and reports `RingError::Overflow`, which is informational only.
// 2.  **Readers validate, they do not lock.** Each slot carries a sequence
//     stamp. A reader checks the stamp before and after touching the bytes and
//     claims the slot with a compare-and-swap on the read cursor. A reader that
//     loses the race (the writer lapped it or another reader claimed the slot)
//     is told to discard what it saw, so every slot is either consumed once or
//     counted as dropped once.
// 3.  **Copy-on-read is per ring.** With copy-on-read the bytes are copied out
//     and validated inside `read_begin`; without it the reader borrows the
//     shared bytes and validation happens at `read_commit`.

use crate::error::VrError;
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};
use thiserror::Error;

const MAGIC: &[u8; 8] = b"LARVARNG";
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 128;
const SLOT_HEADER_SIZE: usize = 8;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_CAPACITY: usize = 12;
const OFF_ELEMENT_SIZE: usize = 16;
const OFF_WRITE: usize = 24;
const OFF_READ: usize = 32;
const OFF_OVERFLOW: usize = 40;
const OFF_AVAILABLE: usize = 44;
const OFF_DROPPED: usize = 48;
const OFF_DEQUEUED: usize = 56;
const OFF_TORN: usize = 64;

/// Bounded retries for a reader that keeps losing races to the writer.
const MAX_READ_RETRIES: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    /// The write passed the read cursor; the oldest slot was overwritten.
    #[error("ring '{0}' overflowed; oldest slot overwritten")]
    Overflow(String),
    /// The slot read in this transaction was dropped by the writer or claimed
    /// by another reader before commit. The view must be discarded.
    #[error("read slot was lapped before commit")]
    Lapped,
    #[error("commit without a matching begin")]
    NoTransaction,
}

impl From<RingError> for VrError {
    fn from(err: RingError) -> Self {
        match err {
            RingError::Overflow(name) => VrError::Overflow(name),
            other => VrError::SharedMemory(other.to_string()),
        }
    }
}

/// Snapshot of the counters kept in the ring header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingCounters {
    pub written: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub torn: u64,
    pub size: u64,
    pub capacity: u64,
    pub overflow: bool,
}

/// Shared mapped region backing one ring.
pub struct RingBuffer {
    name: String,
    _map: MmapMut,
    base: NonNull<u8>,
    capacity: u64,
    element_size: usize,
    stride: usize,
    copy_on_read: bool,
}

// The mapped region is only accessed through atomics and through slot bytes
// guarded by the sequence stamps.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("element_size", &self.element_size)
            .field("copy_on_read", &self.copy_on_read)
            .finish()
    }
}

fn stride_for(element_size: usize) -> usize {
    SLOT_HEADER_SIZE + element_size.div_ceil(8) * 8
}

fn region_size(capacity: usize, element_size: usize) -> usize {
    HEADER_SIZE + capacity * stride_for(element_size)
}

impl RingBuffer {
    /// Anonymous mapping shared between threads of this process.
    pub fn anonymous(
        name: &str,
        capacity: usize,
        element_size: usize,
        copy_on_read: bool,
    ) -> Result<Self, VrError> {
        validate_geometry(name, capacity, element_size)?;
        let map = MmapOptions::new()
            .len(region_size(capacity, element_size))
            .map_anon()
            .map_err(|e| VrError::SharedMemory(format!("cannot map ring '{name}': {e}")))?;
        Self::initialize(name, map, capacity, element_size, copy_on_read)
    }

    /// File-backed mapping that other processes can attach with [`RingBuffer::open`].
    pub fn create(
        name: &str,
        path: &Path,
        capacity: usize,
        element_size: usize,
        copy_on_read: bool,
    ) -> Result<Self, VrError> {
        validate_geometry(name, capacity, element_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(region_size(capacity, element_size) as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Self::initialize(name, map, capacity, element_size, copy_on_read)
    }

    /// Attaches to a ring created by [`RingBuffer::create`].
    pub fn open(name: &str, path: &Path, copy_on_read: bool) -> Result<Self, VrError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        if map.len() < HEADER_SIZE || &map[OFF_MAGIC..OFF_MAGIC + 8] != MAGIC {
            return Err(VrError::SharedMemory(format!(
                "{} is not a ring buffer",
                path.display()
            )));
        }
        let version = u32::from_le_bytes(read_array(&map, OFF_VERSION));
        if version != VERSION {
            return Err(VrError::SharedMemory(format!(
                "ring version {version} unsupported (expected {VERSION})"
            )));
        }
        let capacity = u32::from_le_bytes(read_array(&map, OFF_CAPACITY)) as usize;
        let element_size = u64::from_le_bytes(read_array(&map, OFF_ELEMENT_SIZE)) as usize;
        if map.len() < region_size(capacity, element_size) {
            return Err(VrError::SharedMemory(format!(
                "{} is truncated",
                path.display()
            )));
        }
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| VrError::SharedMemory("null mapping".into()))?;
        Ok(Self {
            name: name.to_string(),
            _map: map,
            base,
            capacity: capacity as u64,
            element_size,
            stride: stride_for(element_size),
            copy_on_read,
        })
    }

    fn initialize(
        name: &str,
        mut map: MmapMut,
        capacity: usize,
        element_size: usize,
        copy_on_read: bool,
    ) -> Result<Self, VrError> {
        map[..HEADER_SIZE].fill(0);
        map[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(MAGIC);
        map[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&VERSION.to_le_bytes());
        map[OFF_CAPACITY..OFF_CAPACITY + 4].copy_from_slice(&(capacity as u32).to_le_bytes());
        map[OFF_ELEMENT_SIZE..OFF_ELEMENT_SIZE + 8]
            .copy_from_slice(&(element_size as u64).to_le_bytes());
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| VrError::SharedMemory("null mapping".into()))?;
        let ring = Self {
            name: name.to_string(),
            _map: map,
            base,
            capacity: capacity as u64,
            element_size,
            stride: stride_for(element_size),
            copy_on_read,
        };
        for cursor in 0..ring.capacity {
            ring.slot_seq(cursor).store(0, Ordering::Relaxed);
        }
        tracing::debug!(
            ring = %ring.name,
            capacity,
            element_size,
            copy_on_read,
            "ring buffer mapped"
        );
        Ok(ring)
    }

    /// Splits the ring into its single writer and a cloneable reader.
    pub fn split(self) -> (RingWriter, RingReader) {
        let ring = Arc::new(self);
        (
            RingWriter {
                ring: ring.clone(),
                in_progress: false,
            },
            RingReader {
                ring,
                pending: None,
                scratch: Vec::new(),
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn copy_on_read(&self) -> bool {
        self.copy_on_read
    }

    pub fn size(&self) -> usize {
        let w = self.write_cursor().load(Ordering::Acquire);
        let r = self.read_cursor().load(Ordering::Acquire);
        w.saturating_sub(r).min(self.capacity) as usize
    }

    pub fn full(&self) -> bool {
        self.size() as u64 >= self.capacity - 1
    }

    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    /// Data-available signal, confirmed against the cursors.
    pub fn data_available(&self) -> bool {
        self.available().load(Ordering::Acquire) != 0 || !self.empty()
    }

    pub fn overflowed(&self) -> bool {
        self.overflow().load(Ordering::Acquire) != 0
    }

    pub fn clear_overflow(&self) {
        self.overflow().store(0, Ordering::Release);
    }

    pub fn counters(&self) -> RingCounters {
        RingCounters {
            written: self.write_cursor().load(Ordering::Acquire),
            dequeued: self.counter(OFF_DEQUEUED).load(Ordering::Acquire),
            dropped: self.counter(OFF_DROPPED).load(Ordering::Acquire),
            torn: self.counter(OFF_TORN).load(Ordering::Acquire),
            size: self.size() as u64,
            capacity: self.capacity,
            overflow: self.overflowed(),
        }
    }

    fn counter(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: offsets are 8-aligned within the header of a live mapping.
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU64) }
    }

    fn flag(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: offsets are 4-aligned within the header of a live mapping.
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU32) }
    }

    fn write_cursor(&self) -> &AtomicU64 {
        self.counter(OFF_WRITE)
    }

    fn read_cursor(&self) -> &AtomicU64 {
        self.counter(OFF_READ)
    }

    fn overflow(&self) -> &AtomicU32 {
        self.flag(OFF_OVERFLOW)
    }

    fn available(&self) -> &AtomicU32 {
        self.flag(OFF_AVAILABLE)
    }

    fn slot_ptr(&self, cursor: u64) -> *mut u8 {
        let index = (cursor % self.capacity) as usize;
        // SAFETY: index < capacity, so the slot lies inside the mapping.
        unsafe { self.base.as_ptr().add(HEADER_SIZE + index * self.stride) }
    }

    fn slot_seq(&self, cursor: u64) -> &AtomicU64 {
        // SAFETY: slot starts are 8-aligned (header and stride are multiples of 8).
        unsafe { &*(self.slot_ptr(cursor) as *const AtomicU64) }
    }

    fn slot_data(&self, cursor: u64) -> *mut u8 {
        // SAFETY: the element bytes follow the stamp inside the same slot.
        unsafe { self.slot_ptr(cursor).add(SLOT_HEADER_SIZE) }
    }

    fn committed_stamp(cursor: u64) -> u64 {
        2 * cursor + 2
    }
}

fn validate_geometry(name: &str, capacity: usize, element_size: usize) -> Result<(), VrError> {
    if capacity < 2 {
        return Err(VrError::config(format!(
            "ring '{name}' needs at least 2 slots, got {capacity}"
        )));
    }
    if capacity > u32::MAX as usize {
        return Err(VrError::config(format!("ring '{name}' capacity too large")));
    }
    if element_size == 0 {
        return Err(VrError::config(format!("ring '{name}' element size must be positive")));
    }
    Ok(())
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

/// The single producer side of a ring.
pub struct RingWriter {
    ring: Arc<RingBuffer>,
    in_progress: bool,
}

impl RingWriter {
    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// Returns whether the ring is currently full and a mutable view of the
    /// write slot. The slot bytes are stable until `write_commit`.
    pub fn write_begin(&mut self) -> (bool, &mut [u8]) {
        let ring = &self.ring;
        let w = ring.write_cursor().load(Ordering::Relaxed);
        if !self.in_progress {
            ring.slot_seq(w)
                .store(RingBuffer::committed_stamp(w) - 1, Ordering::Relaxed);
            fence(Ordering::Release);
            self.in_progress = true;
        }
        let full = ring.full();
        // SAFETY: the write slot is never handed to readers until the write
        // cursor advances past it, and this writer is the only one.
        let slot = unsafe { std::slice::from_raw_parts_mut(ring.slot_data(w), ring.element_size) };
        (full, slot)
    }

    /// Publishes the write slot. Returns `RingError::Overflow` when the commit
    /// overwrote the oldest unread slot; the commit itself always succeeds.
    pub fn write_commit(&mut self) -> Result<(), RingError> {
        if !self.in_progress {
            return Err(RingError::NoTransaction);
        }
        self.in_progress = false;
        let ring = &self.ring;
        let w = ring.write_cursor().load(Ordering::Relaxed);
        ring.slot_seq(w)
            .store(RingBuffer::committed_stamp(w), Ordering::Release);

        let r = ring.read_cursor().load(Ordering::Acquire);
        let overflowed = w.saturating_sub(r) >= ring.capacity - 1;
        if overflowed {
            ring.overflow().store(1, Ordering::Release);
            if ring
                .read_cursor()
                .compare_exchange(r, r + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                ring.counter(OFF_DROPPED).fetch_add(1, Ordering::AcqRel);
            }
        }
        ring.write_cursor().store(w + 1, Ordering::Release);
        ring.available().store(1, Ordering::Release);

        if overflowed {
            Err(RingError::Overflow(ring.name.clone()))
        } else {
            Ok(())
        }
    }

    pub fn size(&self) -> usize {
        self.ring.size()
    }

    pub fn full(&self) -> bool {
        self.ring.full()
    }

    pub fn empty(&self) -> bool {
        self.ring.empty()
    }
}

/// A consumer of a ring. Clones compete for slots; each slot goes to one reader.
pub struct RingReader {
    ring: Arc<RingBuffer>,
    pending: Option<u64>,
    scratch: Vec<u8>,
}

impl Clone for RingReader {
    fn clone(&self) -> Self {
        Self {
            ring: self.ring.clone(),
            pending: None,
            scratch: Vec::new(),
        }
    }
}

impl RingReader {
    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// Returns whether the ring is empty and a view of the oldest slot. With
    /// copy-on-read the view is a validated private copy.
    pub fn read_begin(&mut self) -> (bool, &[u8]) {
        self.pending = None;
        let ring = self.ring.clone();
        for _ in 0..MAX_READ_RETRIES {
            let r = ring.read_cursor().load(Ordering::Acquire);
            let w = ring.write_cursor().load(Ordering::Acquire);
            if r >= w {
                return (true, &[]);
            }
            let expected = RingBuffer::committed_stamp(r);
            let before = ring.slot_seq(r).load(Ordering::Acquire);
            if before != expected {
                // The writer has already lapped this cursor; reload.
                std::hint::spin_loop();
                continue;
            }

            if ring.copy_on_read {
                self.scratch.resize(ring.element_size, 0);
                // SAFETY: the slot lies inside the mapping; a concurrent
                // overwrite is detected by the stamp check below.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        ring.slot_data(r),
                        self.scratch.as_mut_ptr(),
                        ring.element_size,
                    );
                }
                fence(Ordering::Acquire);
                let after = ring.slot_seq(r).load(Ordering::Relaxed);
                if after != before {
                    ring.counter(OFF_TORN).fetch_add(1, Ordering::AcqRel);
                    continue;
                }
                self.pending = Some(r);
                return (false, &self.scratch);
            }

            self.pending = Some(r);
            // SAFETY: borrowed view of a committed slot; validated at commit.
            let view = unsafe { std::slice::from_raw_parts(ring.slot_data(r), ring.element_size) };
            return (false, view);
        }
        (true, &[])
    }

    /// Releases the slot returned by the last `read_begin`.
    pub fn read_commit(&mut self) -> Result<(), RingError> {
        let r = self.pending.take().ok_or(RingError::NoTransaction)?;
        let ring = &self.ring;
        if !ring.copy_on_read {
            fence(Ordering::Acquire);
            if ring.slot_seq(r).load(Ordering::Relaxed) != RingBuffer::committed_stamp(r) {
                ring.counter(OFF_TORN).fetch_add(1, Ordering::AcqRel);
                return Err(RingError::Lapped);
            }
        }
        match ring
            .read_cursor()
            .compare_exchange(r, r + 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                ring.counter(OFF_DEQUEUED).fetch_add(1, Ordering::AcqRel);
                if r + 1 >= ring.write_cursor().load(Ordering::Acquire) {
                    ring.available().store(0, Ordering::Release);
                    // A commit may have landed between the check and the clear.
                    if ring.write_cursor().load(Ordering::Acquire) > r + 1 {
                        ring.available().store(1, Ordering::Release);
                    }
                }
                Ok(())
            }
            Err(_) => Err(RingError::Lapped),
        }
    }

    pub fn size(&self) -> usize {
        self.ring.size()
    }

    pub fn full(&self) -> bool {
        self.ring.full()
    }

    pub fn empty(&self) -> bool {
        self.ring.empty()
    }

    pub fn data_available(&self) -> bool {
        self.ring.data_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(writer: &mut RingWriter, value: u32) -> Result<(), RingError> {
        let (_, slot) = writer.write_begin();
        slot[..4].copy_from_slice(&value.to_le_bytes());
        writer.write_commit()
    }

    fn read(reader: &mut RingReader) -> Option<u32> {
        let (empty, view) = reader.read_begin();
        if empty {
            return None;
        }
        let value = u32::from_le_bytes(view[..4].try_into().unwrap());
        reader.read_commit().ok().map(|_| value)
    }

    #[test]
    fn fifo_order_within_one_ring() {
        let (mut w, mut r) = RingBuffer::anonymous("fifo", 8, 4, false).unwrap().split();
        for v in 0..5 {
            write(&mut w, v).unwrap();
        }
        assert_eq!(r.size(), 5);
        let got: Vec<u32> = std::iter::from_fn(|| read(&mut r)).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert!(r.empty());
        assert!(!r.data_available());
    }

    #[test]
    fn full_and_empty_follow_the_one_free_slot_rule() {
        let (mut w, mut r) = RingBuffer::anonymous("full", 4, 4, true).unwrap().split();
        assert!(w.empty());
        for v in 0..3 {
            let (full, _) = w.write_begin();
            assert!(!full);
            w.write_commit().unwrap();
            let _ = v;
        }
        assert!(w.full());
        assert_eq!(w.size(), 3);
        assert!(read(&mut r).is_some());
        assert!(!w.full());
    }

    #[test]
    fn overflow_latches_only_when_writing_into_a_full_ring() {
        let (mut w, mut r) = RingBuffer::anonymous("lossy", 4, 4, true).unwrap().split();
        for v in 0..3 {
            write(&mut w, v).unwrap();
        }
        assert!(!w.ring().overflowed());

        let (full, _) = w.write_begin();
        assert!(full);
        assert_eq!(w.write_commit(), Err(RingError::Overflow("lossy".into())));
        assert!(w.ring().overflowed());

        // Oldest value was dropped, newest kept; size never exceeds capacity.
        assert!(w.size() <= w.ring().capacity());
        let got: Vec<u32> = std::iter::from_fn(|| read(&mut r)).collect();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], 1);

        let counters = w.ring().counters();
        assert_eq!(counters.written, 4);
        assert_eq!(counters.dropped, 1);
        assert_eq!(counters.dequeued, 3);
        assert!(counters.overflow);
    }

    #[test]
    fn every_write_is_consumed_or_dropped_exactly_once() {
        let (mut w, mut r) = RingBuffer::anonymous("accounting", 6, 4, false).unwrap().split();
        let mut seen = Vec::new();
        for v in 0..200u32 {
            let _ = write(&mut w, v);
            if v % 3 == 0 {
                if let Some(x) = read(&mut r) {
                    seen.push(x);
                }
            }
        }
        while let Some(x) = read(&mut r) {
            seen.push(x);
        }
        let counters = w.ring().counters();
        assert_eq!(counters.dequeued + counters.dropped, 200);
        assert_eq!(seen.len() as u64, counters.dequeued);
        let mut sorted = seen.clone();
        sorted.dedup();
        assert_eq!(sorted, seen, "no duplicates, strictly increasing");
    }

    #[test]
    fn commit_without_begin_is_rejected() {
        let (mut w, mut r) = RingBuffer::anonymous("txn", 2, 1, false).unwrap().split();
        assert_eq!(w.write_commit(), Err(RingError::NoTransaction));
        assert_eq!(r.read_commit(), Err(RingError::NoTransaction));
    }

    #[test]
    fn competing_readers_never_share_a_slot() {
        let (mut w, r) = RingBuffer::anonymous("spmc", 64, 4, true).unwrap().split();
        let mut a = r.clone();
        let mut b = r;
        for v in 0..40 {
            write(&mut w, v).unwrap();
        }
        let (_, _) = a.read_begin();
        let (_, _) = b.read_begin();
        let first = a.read_commit();
        let second = b.read_commit();
        assert!(first.is_ok());
        assert_eq!(second, Err(RingError::Lapped));
    }

    #[test]
    fn file_backed_ring_can_be_attached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.ring");
        let (mut w, _) = RingBuffer::create("shared", &path, 4, 8, true).unwrap().split();
        write(&mut w, 42).unwrap();

        let (_, mut other) = RingBuffer::open("shared", &path, true).unwrap().split();
        assert_eq!(read(&mut other), Some(42));
    }

    #[test]
    fn rejects_degenerate_geometry() {
        assert!(RingBuffer::anonymous("tiny", 1, 4, false).is_err());
        assert!(RingBuffer::anonymous("empty", 4, 0, false).is_err());
    }
}
