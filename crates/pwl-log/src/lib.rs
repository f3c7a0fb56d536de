#![forbid(unsafe_code)]
//! Log entry model for the PWL write log.
//!
//! Two entry kinds exist in the ring: write entries (a payload at an
//! image offset) and sync-point entries (barriers grouping writes that
//! may flush concurrently). Both have an on-pool slot record and an
//! in-memory representation; the [`WriteLogMap`] maps block extents to
//! the write entries currently covering them.

pub mod map;

pub use map::{MapEntry, WriteLogMap};

use parking_lot::Mutex;
use pwl_pmem::PmemBuffer;
use pwl_types::{
    read_le_u32, read_le_u64, write_le_u32, write_le_u64, BlockExtent, CodecError, SyncGen,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Encoded size of a slot record; must match the pool's slot pitch.
pub const SLOT_RECORD_SIZE: usize = 64;
const _: () = assert!(SLOT_RECORD_SIZE as u64 == pwl_pmem::SLOT_SIZE);

const FLAG_ENTRY_VALID: u32 = 1 << 0;
const FLAG_SYNC_POINT: u32 = 1 << 1;
const FLAG_SEQUENCED: u32 = 1 << 2;
const FLAG_HAS_DATA: u32 = 1 << 3;
const FLAG_UNMAP: u32 = 1 << 4;

/// Sentinel for "no ring slot assigned yet".
const INDEX_UNASSIGNED: u64 = u64::MAX;

// ── Slot record ─────────────────────────────────────────────────────────────

/// On-pool representation of one ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotRecord {
    pub entry_index: u32,
    pub entry_valid: bool,
    pub sync_point: bool,
    pub sequenced: bool,
    pub has_data: bool,
    pub unmap: bool,
    pub sync_gen: u64,
    /// 0 in persist-on-flush mode; never used as a real sequence.
    pub write_sequence: u64,
    pub image_offset: u64,
    pub write_bytes: u64,
    pub buffer_offset: u64,
    pub buffer_len: u64,
}

impl SlotRecord {
    #[must_use]
    pub fn is_write(&self) -> bool {
        !self.sync_point
    }

    #[must_use]
    pub fn block_extent(&self) -> BlockExtent {
        BlockExtent {
            start: self.image_offset,
            end: self.image_offset + self.write_bytes.max(1) - 1,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; SLOT_RECORD_SIZE] {
        let mut out = [0_u8; SLOT_RECORD_SIZE];
        let mut flags = 0_u32;
        if self.entry_valid {
            flags |= FLAG_ENTRY_VALID;
        }
        if self.sync_point {
            flags |= FLAG_SYNC_POINT;
        }
        if self.sequenced {
            flags |= FLAG_SEQUENCED;
        }
        if self.has_data {
            flags |= FLAG_HAS_DATA;
        }
        if self.unmap {
            flags |= FLAG_UNMAP;
        }
        write_le_u32(&mut out, 0, self.entry_index);
        write_le_u32(&mut out, 4, flags);
        write_le_u64(&mut out, 8, self.sync_gen);
        write_le_u64(&mut out, 16, self.write_sequence);
        write_le_u64(&mut out, 24, self.image_offset);
        write_le_u64(&mut out, 32, self.write_bytes);
        write_le_u64(&mut out, 40, self.buffer_offset);
        write_le_u64(&mut out, 48, self.buffer_len);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let entry_index = read_le_u32(bytes, 0)?;
        let flags = read_le_u32(bytes, 4)?;
        Ok(Self {
            entry_index,
            entry_valid: flags & FLAG_ENTRY_VALID != 0,
            sync_point: flags & FLAG_SYNC_POINT != 0,
            sequenced: flags & FLAG_SEQUENCED != 0,
            has_data: flags & FLAG_HAS_DATA != 0,
            unmap: flags & FLAG_UNMAP != 0,
            sync_gen: read_le_u64(bytes, 8)?,
            write_sequence: read_le_u64(bytes, 16)?,
            image_offset: read_le_u64(bytes, 24)?,
            write_bytes: read_le_u64(bytes, 32)?,
            buffer_offset: read_le_u64(bytes, 40)?,
            buffer_len: read_le_u64(bytes, 48)?,
        })
    }
}

// ── Sync point entries ──────────────────────────────────────────────────────

/// In-memory state of a sync-point log entry.
///
/// Counters are updated under the cache lock; atomics let shared
/// `Arc` references read them without it.
#[derive(Debug)]
pub struct SyncPointLogEntry {
    pub sync_gen: SyncGen,
    writes: AtomicU64,
    bytes: AtomicU64,
    writes_completed: AtomicU64,
    completed: AtomicBool,
    entry_index: AtomicU64,
}

impl SyncPointLogEntry {
    #[must_use]
    pub fn new(sync_gen: SyncGen) -> Arc<Self> {
        Arc::new(Self {
            sync_gen,
            writes: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            writes_completed: AtomicU64::new(0),
            completed: AtomicBool::new(false),
            entry_index: AtomicU64::new(INDEX_UNASSIGNED),
        })
    }

    pub fn note_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::AcqRel);
        self.bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn note_write_completed(&self) {
        self.writes_completed.fetch_add(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn writes_completed(&self) -> u64 {
        self.writes_completed.load(Ordering::Acquire)
    }

    pub fn set_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn slot_record(&self) -> SlotRecord {
        SlotRecord {
            entry_index: self.entry_index().unwrap_or(0),
            entry_valid: true,
            sync_point: true,
            sequenced: true,
            has_data: false,
            unmap: false,
            sync_gen: self.sync_gen.0,
            write_sequence: 0,
            image_offset: 0,
            write_bytes: 0,
            buffer_offset: 0,
            buffer_len: 0,
        }
    }

    pub fn set_entry_index(&self, index: u32) {
        self.entry_index.store(u64::from(index), Ordering::Release);
    }

    #[must_use]
    pub fn entry_index(&self) -> Option<u32> {
        let raw = self.entry_index.load(Ordering::Acquire);
        (raw != INDEX_UNASSIGNED).then(|| raw as u32)
    }
}

// ── Write entries ───────────────────────────────────────────────────────────

/// In-memory state of a write log entry.
///
/// Lifecycle: created at dispatch; `completed` once its slot append
/// commits; `flushing` while draining to the lower tier; `flushed` on
/// success; retired once flushed with no readers and no referring map
/// entries, at the ring tail.
#[derive(Debug)]
pub struct WriteLogEntry {
    pub image_offset: u64,
    pub write_bytes: u64,
    sync_gen: AtomicU64,
    write_sequence: AtomicU64,
    sequenced: AtomicBool,
    sync_point_entry: Mutex<Option<Arc<SyncPointLogEntry>>>,
    buffer: Mutex<Option<Arc<PmemBuffer>>>,
    entry_index: AtomicU64,
    readers: AtomicU32,
    referring_map_entries: AtomicU32,
    completed: AtomicBool,
    flushing: AtomicBool,
    flushed: AtomicBool,
}

impl WriteLogEntry {
    #[must_use]
    pub fn new(
        sync_point_entry: Option<Arc<SyncPointLogEntry>>,
        image_offset: u64,
        write_bytes: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            image_offset,
            write_bytes,
            sync_gen: AtomicU64::new(0),
            write_sequence: AtomicU64::new(0),
            sequenced: AtomicBool::new(false),
            sync_point_entry: Mutex::new(sync_point_entry),
            buffer: Mutex::new(None),
            entry_index: AtomicU64::new(INDEX_UNASSIGNED),
            readers: AtomicU32::new(0),
            referring_map_entries: AtomicU32::new(0),
            completed: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            flushed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn block_extent(&self) -> BlockExtent {
        BlockExtent {
            start: self.image_offset,
            end: self.image_offset + self.write_bytes - 1,
        }
    }

    pub fn set_sync_gen(&self, sync_gen: SyncGen) {
        self.sync_gen.store(sync_gen.0, Ordering::Release);
    }

    #[must_use]
    pub fn sync_gen(&self) -> SyncGen {
        SyncGen(self.sync_gen.load(Ordering::Acquire))
    }

    /// Persist-on-write sequencing; sequence 0 is never used.
    pub fn set_write_sequence(&self, sequence: u64) {
        self.write_sequence.store(sequence, Ordering::Release);
        self.sequenced.store(sequence != 0, Ordering::Release);
    }

    #[must_use]
    pub fn write_sequence(&self) -> u64 {
        self.write_sequence.load(Ordering::Acquire)
    }

    pub fn set_sync_point_entry(&self, entry: Arc<SyncPointLogEntry>) {
        *self.sync_point_entry.lock() = Some(entry);
    }

    #[must_use]
    pub fn sync_point_entry(&self) -> Option<Arc<SyncPointLogEntry>> {
        self.sync_point_entry.lock().clone()
    }

    pub fn set_buffer(&self, buffer: Arc<PmemBuffer>) {
        *self.buffer.lock() = Some(buffer);
    }

    #[must_use]
    pub fn buffer(&self) -> Option<Arc<PmemBuffer>> {
        self.buffer.lock().clone()
    }

    pub fn set_entry_index(&self, index: u32) {
        self.entry_index.store(u64::from(index), Ordering::Release);
    }

    #[must_use]
    pub fn entry_index(&self) -> Option<u32> {
        let raw = self.entry_index.load(Ordering::Acquire);
        (raw != INDEX_UNASSIGNED).then(|| raw as u32)
    }

    pub fn add_reader(&self) {
        self.readers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove_reader(&self) {
        let prev = self.readers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "reader count underflow");
    }

    #[must_use]
    pub fn reader_count(&self) -> u32 {
        self.readers.load(Ordering::Acquire)
    }

    pub(crate) fn add_map_reference(&self) {
        self.referring_map_entries.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_map_reference(&self) {
        let prev = self.referring_map_entries.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "map reference underflow");
    }

    #[must_use]
    pub fn referring_map_entries(&self) -> u32 {
        self.referring_map_entries.load(Ordering::Acquire)
    }

    pub fn set_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn set_flushing(&self, flushing: bool) {
        self.flushing.store(flushing, Ordering::Release);
    }

    #[must_use]
    pub fn flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    pub fn set_flushed(&self) {
        self.flushed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn flushed(&self) -> bool {
        self.flushed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn slot_record(&self) -> SlotRecord {
        let (buffer_offset, buffer_len) = self
            .buffer()
            .map(|buffer| (buffer.offset(), buffer.alloc_len()))
            .unwrap_or((0, 0));
        SlotRecord {
            entry_index: self.entry_index().unwrap_or(0),
            entry_valid: true,
            sync_point: false,
            sequenced: self.sequenced.load(Ordering::Acquire),
            has_data: true,
            unmap: false,
            sync_gen: self.sync_gen.load(Ordering::Acquire),
            write_sequence: self.write_sequence(),
            image_offset: self.image_offset,
            write_bytes: self.write_bytes,
            buffer_offset,
            buffer_len,
        }
    }
}

// ── Entry enum ──────────────────────────────────────────────────────────────

/// Either kind of in-memory log entry; clones share the underlying entry.
#[derive(Debug, Clone)]
pub enum LogEntry {
    Write(Arc<WriteLogEntry>),
    SyncPoint(Arc<SyncPointLogEntry>),
}

impl LogEntry {
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write(_))
    }

    #[must_use]
    pub fn as_write(&self) -> Option<&Arc<WriteLogEntry>> {
        match self {
            Self::Write(entry) => Some(entry),
            Self::SyncPoint(_) => None,
        }
    }

    #[must_use]
    pub fn sync_gen(&self) -> SyncGen {
        match self {
            Self::Write(entry) => entry.sync_gen(),
            Self::SyncPoint(entry) => entry.sync_gen,
        }
    }

    #[must_use]
    pub fn completed(&self) -> bool {
        match self {
            Self::Write(entry) => entry.completed(),
            Self::SyncPoint(entry) => entry.completed(),
        }
    }

    pub fn set_completed(&self) {
        match self {
            Self::Write(entry) => entry.set_completed(),
            Self::SyncPoint(entry) => entry.set_completed(),
        }
    }

    #[must_use]
    pub fn entry_index(&self) -> Option<u32> {
        match self {
            Self::Write(entry) => entry.entry_index(),
            Self::SyncPoint(entry) => entry.entry_index(),
        }
    }

    pub fn set_entry_index(&self, index: u32) {
        match self {
            Self::Write(entry) => entry.set_entry_index(index),
            Self::SyncPoint(entry) => entry.set_entry_index(index),
        }
    }

    #[must_use]
    pub fn slot_record(&self) -> SlotRecord {
        match self {
            Self::Write(entry) => entry.slot_record(),
            Self::SyncPoint(entry) => entry.slot_record(),
        }
    }

    #[must_use]
    pub fn write_bytes(&self) -> u64 {
        match self {
            Self::Write(entry) => entry.write_bytes,
            Self::SyncPoint(_) => 0,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_record_round_trip() {
        let record = SlotRecord {
            entry_index: 7,
            entry_valid: true,
            sync_point: false,
            sequenced: true,
            has_data: true,
            unmap: false,
            sync_gen: 3,
            write_sequence: 41,
            image_offset: 8192,
            write_bytes: 4096,
            buffer_offset: 65536,
            buffer_len: 4096,
        };
        let decoded = SlotRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
        assert!(decoded.is_write());
        assert_eq!(decoded.block_extent(), BlockExtent::new(8192, 12287).unwrap());
    }

    #[test]
    fn slot_record_decode_rejects_short_input() {
        assert!(SlotRecord::decode(&[0_u8; 10]).is_err());
    }

    #[test]
    fn zeroed_slot_is_invalid() {
        let decoded = SlotRecord::decode(&[0_u8; SLOT_RECORD_SIZE]).unwrap();
        assert!(!decoded.entry_valid);
    }

    #[test]
    fn sync_point_entry_counters() {
        let entry = SyncPointLogEntry::new(SyncGen(5));
        entry.note_write(4096);
        entry.note_write(8192);
        entry.note_write_completed();
        assert_eq!(entry.writes(), 2);
        assert_eq!(entry.bytes(), 12288);
        assert_eq!(entry.writes_completed(), 1);

        let record = entry.slot_record();
        assert!(record.sync_point);
        assert!(!record.is_write());
        assert_eq!(record.sync_gen, 5);
    }

    #[test]
    fn write_entry_lifecycle_flags() {
        let sync_point = SyncPointLogEntry::new(SyncGen(1));
        let entry = WriteLogEntry::new(Some(sync_point), 0, 4096);
        assert!(!entry.completed());
        entry.set_completed();
        entry.set_flushing(true);
        assert!(entry.flushing());
        entry.set_flushing(false);
        entry.set_flushed();
        assert!(entry.completed() && entry.flushed() && !entry.flushing());
    }

    #[test]
    fn write_entry_reader_counts() {
        let entry = WriteLogEntry::new(None, 0, 4096);
        entry.add_reader();
        entry.add_reader();
        assert_eq!(entry.reader_count(), 2);
        entry.remove_reader();
        entry.remove_reader();
        assert_eq!(entry.reader_count(), 0);
    }

    #[test]
    fn entry_index_starts_unassigned() {
        let entry = WriteLogEntry::new(None, 0, 4096);
        assert_eq!(entry.entry_index(), None);
        entry.set_entry_index(9);
        assert_eq!(entry.entry_index(), Some(9));
    }

    #[test]
    fn write_sequence_zero_is_unsequenced() {
        let entry = WriteLogEntry::new(None, 0, 4096);
        entry.set_write_sequence(0);
        assert!(!entry.slot_record().sequenced);
        entry.set_write_sequence(17);
        assert!(entry.slot_record().sequenced);
    }
}
