#![forbid(unsafe_code)]
//! File-backed persistent log pool for the PWL write log.
//!
//! The pool file holds a one-block root, a ring of fixed-size log slot
//! records, and a data area for write payloads. Writes are staged in
//! memory and reach the file in two steps that mirror persistent-memory
//! semantics: `flush` issues the positional write, `drain` makes all
//! flushed writes durable. Root updates happen through a transaction
//! that rewrites the root block in a single write, so a torn multi-field
//! update cannot be observed.
//!
//! Data-area reservations are volatile until a transaction publishes
//! them: occupancy is rebuilt from the buffer references of valid slots
//! when an existing pool is opened, so reservations that never published
//! simply vanish on crash.

use asupersync::Cx;
use parking_lot::Mutex;
use pwl_error::{PwlError, Result};
use pwl_types::{align_up, read_le_u32, read_le_u64, u64_to_usize, write_le_u32, write_le_u64};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, trace};

/// Fixed data block size; also the minimum payload allocation.
pub const MIN_ALLOC: u64 = 4096;
/// Encoded size of one log slot record.
pub const SLOT_SIZE: u64 = 64;
/// Allocator bookkeeping overhead charged per slot when sizing the ring.
pub const PER_SLOT_OVERHEAD: u64 = 16;
/// Smallest pool the layout math supports.
pub const MIN_POOL_SIZE: u64 = 4 * 1024 * 1024;

const ROOT_BLOCK_SIZE: u64 = 4096;
const POOL_MAGIC: u64 = u64::from_le_bytes(*b"PWLPOOL1");
pub const LAYOUT_VERSION: u32 = 1;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| PwlError::Cancelled)
}

// ── Root block ──────────────────────────────────────────────────────────────

/// In-memory copy of the pool root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRoot {
    pub layout_version: u32,
    pub pool_size: u64,
    pub block_size: u64,
    pub num_slots: u32,
    pub first_free_entry: u32,
    pub first_valid_entry: u32,
}

impl PoolRoot {
    fn encode(&self) -> Vec<u8> {
        let mut block = vec![0_u8; u64_to_usize(ROOT_BLOCK_SIZE, "root_block").unwrap_or(4096)];
        write_le_u64(&mut block, 0, POOL_MAGIC);
        write_le_u32(&mut block, 8, self.layout_version);
        write_le_u64(&mut block, 12, self.pool_size);
        write_le_u64(&mut block, 20, self.block_size);
        write_le_u32(&mut block, 28, self.num_slots);
        write_le_u32(&mut block, 32, self.first_free_entry);
        write_le_u32(&mut block, 36, self.first_valid_entry);
        block
    }

    fn decode(block: &[u8]) -> Result<Self> {
        let magic = read_le_u64(block, 0).map_err(|e| PwlError::Format(e.to_string()))?;
        if magic != POOL_MAGIC {
            return Err(PwlError::Format(format!(
                "bad pool magic {magic:#018x}, expected {POOL_MAGIC:#018x}"
            )));
        }
        let decode_u32 =
            |off: usize| read_le_u32(block, off).map_err(|e| PwlError::Format(e.to_string()));
        let decode_u64 =
            |off: usize| read_le_u64(block, off).map_err(|e| PwlError::Format(e.to_string()));
        Ok(Self {
            layout_version: decode_u32(8)?,
            pool_size: decode_u64(12)?,
            block_size: decode_u64(20)?,
            num_slots: decode_u32(28)?,
            first_free_entry: decode_u32(32)?,
            first_valid_entry: decode_u32(36)?,
        })
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Derived pool geometry: where the slot ring and the data area live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub pool_size: u64,
    pub num_slots: u32,
    pub slot_region_offset: u64,
    pub data_offset: u64,
    pub data_len: u64,
}

impl PoolGeometry {
    /// Compute the slot count from the pool size: the usable fraction of
    /// the pool divided by the footprint of a smallest write, clamped by
    /// `max_log_entries`. A usable ring needs at least 3 slots (one is
    /// always kept empty).
    pub fn derive(pool_size: u64, usable_fraction: f64, max_log_entries: u32) -> Result<Self> {
        if pool_size < MIN_POOL_SIZE {
            return Err(PwlError::Format(format!(
                "pool size {pool_size} below minimum {MIN_POOL_SIZE}"
            )));
        }
        if !(usable_fraction > 0.0 && usable_fraction <= 1.0) {
            return Err(PwlError::Format(format!(
                "usable fraction {usable_fraction} outside (0, 1]"
            )));
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let effective = (pool_size as f64 * usable_fraction) as u64;
        let small_write_footprint = MIN_ALLOC + PER_SLOT_OVERHEAD + SLOT_SIZE;
        let derived = effective / small_write_footprint;
        let num_slots = u32::try_from(derived.min(u64::from(max_log_entries)))
            .map_err(|_| PwlError::Format("slot count overflows u32".to_owned()))?;
        if num_slots < 3 {
            return Err(PwlError::Format(format!(
                "pool too small for a log ring: {num_slots} slots"
            )));
        }
        Self::with_slots(pool_size, num_slots)
    }

    fn with_slots(pool_size: u64, num_slots: u32) -> Result<Self> {
        let slot_region_offset = ROOT_BLOCK_SIZE;
        let slots_end = slot_region_offset + u64::from(num_slots) * SLOT_SIZE;
        let data_offset = align_up(slots_end, MIN_ALLOC)
            .ok_or_else(|| PwlError::Format("slot region end overflows".to_owned()))?;
        if data_offset >= pool_size {
            return Err(PwlError::Format(
                "pool has no room for a data area".to_owned(),
            ));
        }
        Ok(Self {
            pool_size,
            num_slots,
            slot_region_offset,
            data_offset,
            data_len: pool_size - data_offset,
        })
    }

    fn slot_offset(&self, index: u32) -> u64 {
        self.slot_region_offset + u64::from(index) * SLOT_SIZE
    }
}

// ── Data-area allocator ─────────────────────────────────────────────────────

/// First-fit free-list allocator over the data area.
///
/// Reservations are tracked in memory only. On open, occupancy is rebuilt
/// from the valid slots' buffer references via `mark_allocated`.
#[derive(Debug)]
struct DataAllocator {
    /// Free runs keyed by offset; adjacent runs are coalesced on free.
    free: BTreeMap<u64, u64>,
}

impl DataAllocator {
    fn new(data_offset: u64, data_len: u64) -> Self {
        let mut free = BTreeMap::new();
        if data_len > 0 {
            free.insert(data_offset, data_len);
        }
        Self { free }
    }

    fn reserve(&mut self, len: u64) -> Option<u64> {
        let (offset, run_len) = self
            .free
            .iter()
            .find(|(_, run_len)| **run_len >= len)
            .map(|(off, run_len)| (*off, *run_len))?;
        self.free.remove(&offset);
        if run_len > len {
            self.free.insert(offset + len, run_len - len);
        }
        Some(offset)
    }

    fn mark_allocated(&mut self, offset: u64, len: u64) -> bool {
        let Some((&run_off, &run_len)) = self.free.range(..=offset).next_back() else {
            return false;
        };
        if offset + len > run_off + run_len {
            return false;
        }
        self.free.remove(&run_off);
        if offset > run_off {
            self.free.insert(run_off, offset - run_off);
        }
        let tail = (run_off + run_len) - (offset + len);
        if tail > 0 {
            self.free.insert(offset + len, tail);
        }
        true
    }

    fn release(&mut self, offset: u64, len: u64) {
        let mut offset = offset;
        let mut len = len;
        // Coalesce with the preceding run.
        if let Some((&prev_off, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_off + prev_len == offset {
                self.free.remove(&prev_off);
                offset = prev_off;
                len += prev_len;
            }
        }
        // Coalesce with the following run.
        if let Some(&next_len) = self.free.get(&(offset + len)) {
            self.free.remove(&(offset + len));
            len += next_len;
        }
        self.free.insert(offset, len);
    }

    fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }
}

// ── Buffers ─────────────────────────────────────────────────────────────────

/// A reserved region of the data area with a staged in-memory mirror.
///
/// The payload is written once, after which the buffer is shared
/// read-only (reads and the flusher borrow the same bytes). `flush`
/// issues the positional write of the staged bytes; durability comes
/// from the next `drain`.
#[derive(Debug)]
pub struct PmemBuffer {
    offset: u64,
    alloc_len: u64,
    data: OnceLock<Vec<u8>>,
}

impl PmemBuffer {
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn alloc_len(&self) -> u64 {
        self.alloc_len
    }

    /// Stage the payload. May be called once; later calls are ignored
    /// (the first payload wins, matching write-once discipline).
    pub fn fill(&self, payload: Vec<u8>) {
        let _ = self.data.set(payload);
    }

    /// Staged bytes, or `None` if the buffer was never filled.
    #[must_use]
    pub fn bytes(&self) -> Option<&[u8]> {
        self.data.get().map(Vec::as_slice)
    }
}

// ── Pool ────────────────────────────────────────────────────────────────────

/// The log pool: root, slot ring, data area.
#[derive(Debug)]
pub struct LogPool {
    file: File,
    path: PathBuf,
    geometry: PoolGeometry,
    root: Mutex<PoolRoot>,
    /// In-memory mirror of the slot region; `flush_slot_range` writes
    /// from it to the file.
    slot_shadow: Mutex<Vec<u8>>,
    alloc: Mutex<DataAllocator>,
}

impl LogPool {
    /// Create a new pool file with an empty ring.
    pub fn create(
        cx: &Cx,
        path: impl AsRef<Path>,
        pool_size: u64,
        usable_fraction: f64,
        max_log_entries: u32,
    ) -> Result<Self> {
        cx_checkpoint(cx)?;
        let geometry = PoolGeometry::derive(pool_size, usable_fraction, max_log_entries)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        file.set_len(pool_size)?;

        let root = PoolRoot {
            layout_version: LAYOUT_VERSION,
            pool_size,
            block_size: MIN_ALLOC,
            num_slots: geometry.num_slots,
            first_free_entry: 0,
            first_valid_entry: 0,
        };
        file.write_all_at(&root.encode(), 0)?;
        file.sync_all()?;
        cx_checkpoint(cx)?;

        info!(
            target: "pwl::pool",
            event = "pool_created",
            path = %path.as_ref().display(),
            pool_size,
            num_slots = geometry.num_slots,
            data_offset = geometry.data_offset
        );
        let shadow_len = u64_to_usize(u64::from(geometry.num_slots) * SLOT_SIZE, "slot_region")
            .map_err(|e| PwlError::Format(e.to_string()))?;
        Ok(Self {
            file,
            path: path.as_ref().to_owned(),
            geometry,
            root: Mutex::new(root),
            slot_shadow: Mutex::new(vec![0_u8; shadow_len]),
            alloc: Mutex::new(DataAllocator::new(geometry.data_offset, geometry.data_len)),
        })
    }

    /// Open an existing pool and load the slot region.
    ///
    /// The data-area allocator starts fully free; the caller rebuilds
    /// occupancy from valid slots with [`LogPool::mark_allocated`].
    pub fn open(cx: &Cx, path: impl AsRef<Path>) -> Result<Self> {
        cx_checkpoint(cx)?;
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;

        let mut root_block = vec![0_u8; 4096];
        file.read_exact_at(&mut root_block, 0)?;
        let root = PoolRoot::decode(&root_block)?;
        if root.layout_version != LAYOUT_VERSION {
            return Err(PwlError::Layout {
                field: "layout_version",
                expected: u64::from(LAYOUT_VERSION),
                actual: u64::from(root.layout_version),
            });
        }
        let geometry = PoolGeometry::with_slots(root.pool_size, root.num_slots)?;

        let shadow_len = u64_to_usize(u64::from(geometry.num_slots) * SLOT_SIZE, "slot_region")
            .map_err(|e| PwlError::Format(e.to_string()))?;
        let mut shadow = vec![0_u8; shadow_len];
        file.read_exact_at(&mut shadow, geometry.slot_region_offset)?;
        cx_checkpoint(cx)?;

        info!(
            target: "pwl::pool",
            event = "pool_opened",
            path = %path.as_ref().display(),
            num_slots = geometry.num_slots,
            first_valid = root.first_valid_entry,
            first_free = root.first_free_entry
        );
        Ok(Self {
            file,
            path: path.as_ref().to_owned(),
            geometry,
            root: Mutex::new(root),
            slot_shadow: Mutex::new(shadow),
            alloc: Mutex::new(DataAllocator::new(geometry.data_offset, geometry.data_len)),
        })
    }

    #[must_use]
    pub fn root(&self) -> PoolRoot {
        *self.root.lock()
    }

    #[must_use]
    pub fn geometry(&self) -> PoolGeometry {
        self.geometry
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn num_slots(&self) -> u32 {
        self.geometry.num_slots
    }

    /// Bytes still free in the data area.
    #[must_use]
    pub fn free_data_bytes(&self) -> u64 {
        self.alloc.lock().free_bytes()
    }

    // ── Buffers ─────────────────────────────────────────────────────────

    /// Reserve a data-area region. Volatile until published by a
    /// transaction; cancel or crash releases it.
    pub fn reserve(&self, alloc_len: u64) -> Result<Arc<PmemBuffer>> {
        let offset = self
            .alloc
            .lock()
            .reserve(alloc_len)
            .ok_or(PwlError::NoSpace)?;
        trace!(target: "pwl::pool", event = "buffer_reserved", offset, alloc_len);
        Ok(Arc::new(PmemBuffer {
            offset,
            alloc_len,
            data: OnceLock::new(),
        }))
    }

    /// Release a reservation that will not be published.
    pub fn cancel(&self, buffer: &PmemBuffer) {
        trace!(
            target: "pwl::pool",
            event = "buffer_cancelled",
            offset = buffer.offset,
            alloc_len = buffer.alloc_len
        );
        self.alloc.lock().release(buffer.offset, buffer.alloc_len);
    }

    /// Rebuild occupancy for a buffer referenced by a valid slot
    /// (replay path). Fails if the region is already taken.
    pub fn mark_allocated(&self, offset: u64, alloc_len: u64) -> Result<()> {
        if self.alloc.lock().mark_allocated(offset, alloc_len) {
            Ok(())
        } else {
            Err(PwlError::Format(format!(
                "data region {offset}+{alloc_len} already allocated or out of bounds"
            )))
        }
    }

    /// Issue the positional write of a buffer's staged bytes.
    pub fn flush_buffer(&self, cx: &Cx, buffer: &PmemBuffer) -> Result<()> {
        cx_checkpoint(cx)?;
        let bytes = buffer
            .bytes()
            .ok_or_else(|| PwlError::Format("flush of unfilled buffer".to_owned()))?;
        if buffer.offset + buffer.alloc_len > self.geometry.pool_size {
            return Err(PwlError::Format(format!(
                "buffer {}+{} outside pool",
                buffer.offset, buffer.alloc_len
            )));
        }
        self.file.write_all_at(bytes, buffer.offset)?;
        Ok(())
    }

    /// Read a buffer's bytes back from the file (replay rehydration).
    pub fn rehydrate(&self, cx: &Cx, offset: u64, len: u64) -> Result<Vec<u8>> {
        cx_checkpoint(cx)?;
        let mut bytes = vec![0_u8; u64_to_usize(len, "buffer_len").map_err(|e| PwlError::Format(e.to_string()))?];
        self.file.read_exact_at(&mut bytes, offset)?;
        Ok(bytes)
    }

    /// Re-create a buffer handle for a region owned by a valid slot.
    #[must_use]
    pub fn adopt_buffer(&self, offset: u64, alloc_len: u64, bytes: Vec<u8>) -> Arc<PmemBuffer> {
        let buffer = PmemBuffer {
            offset,
            alloc_len,
            data: OnceLock::new(),
        };
        buffer.fill(bytes);
        Arc::new(buffer)
    }

    // ── Slots ───────────────────────────────────────────────────────────

    /// Copy an encoded slot record into the shadow region.
    pub fn write_slot(&self, index: u32, record: &[u8]) -> Result<()> {
        if index >= self.geometry.num_slots {
            return Err(PwlError::Format(format!("slot index {index} out of range")));
        }
        if record.len() != SLOT_SIZE as usize {
            return Err(PwlError::Format(format!(
                "slot record is {} bytes, expected {SLOT_SIZE}",
                record.len()
            )));
        }
        let mut shadow = self.slot_shadow.lock();
        let start = index as usize * SLOT_SIZE as usize;
        shadow[start..start + SLOT_SIZE as usize].copy_from_slice(record);
        Ok(())
    }

    /// Read a slot record from the shadow region.
    pub fn read_slot(&self, index: u32) -> Result<Vec<u8>> {
        if index >= self.geometry.num_slots {
            return Err(PwlError::Format(format!("slot index {index} out of range")));
        }
        let shadow = self.slot_shadow.lock();
        let start = index as usize * SLOT_SIZE as usize;
        Ok(shadow[start..start + SLOT_SIZE as usize].to_vec())
    }

    /// Flush a contiguous run of slots (`first..first + count`, no wrap)
    /// with one positional write.
    pub fn flush_slot_range(&self, cx: &Cx, first: u32, count: u32) -> Result<()> {
        cx_checkpoint(cx)?;
        if count == 0 {
            return Ok(());
        }
        let last = first
            .checked_add(count - 1)
            .filter(|last| *last < self.geometry.num_slots)
            .ok_or_else(|| PwlError::Format(format!("slot range {first}+{count} out of range")))?;
        let _ = last;
        let bytes = {
            let shadow = self.slot_shadow.lock();
            let start = first as usize * SLOT_SIZE as usize;
            let end = start + count as usize * SLOT_SIZE as usize;
            shadow[start..end].to_vec()
        };
        self.file.write_all_at(&bytes, self.geometry.slot_offset(first))?;
        trace!(target: "pwl::pool", event = "slots_flushed", first, count);
        Ok(())
    }

    /// Make all flushed writes durable.
    pub fn drain(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        self.file.sync_data()?;
        Ok(())
    }

    // ── Transactions ────────────────────────────────────────────────────

    /// Run a root transaction: stage root-pointer updates, buffer
    /// publishes and frees, then commit them with a single root write
    /// plus sync. Nothing is applied if the body or the commit fails.
    pub fn tx<F>(&self, cx: &Cx, body: F) -> Result<()>
    where
        F: FnOnce(&mut PoolTx) -> Result<()>,
    {
        cx_checkpoint(cx)?;
        let mut tx = PoolTx {
            new_first_free: None,
            new_first_valid: None,
            published: 0,
            frees: Vec::new(),
        };
        body(&mut tx)?;

        let staged = {
            let root = self.root.lock();
            let mut staged = *root;
            if let Some(first_free) = tx.new_first_free {
                staged.first_free_entry = first_free;
            }
            if let Some(first_valid) = tx.new_first_valid {
                staged.first_valid_entry = first_valid;
            }
            staged
        };

        if let Err(err) = self
            .file
            .write_all_at(&staged.encode(), 0)
            .and_then(|()| self.file.sync_data())
        {
            return Err(PwlError::TxAborted(err.to_string()));
        }

        *self.root.lock() = staged;
        if !tx.frees.is_empty() {
            let mut alloc = self.alloc.lock();
            for (offset, len) in &tx.frees {
                alloc.release(*offset, *len);
            }
        }
        debug!(
            target: "pwl::pool",
            event = "tx_committed",
            first_free = staged.first_free_entry,
            first_valid = staged.first_valid_entry,
            published = tx.published,
            freed = tx.frees.len()
        );
        Ok(())
    }

    /// Sync and drop the pool handle.
    pub fn close(self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        self.file.sync_all()?;
        info!(target: "pwl::pool", event = "pool_closed", path = %self.path.display());
        Ok(())
    }
}

/// Staged root transaction. See [`LogPool::tx`].
#[derive(Debug)]
pub struct PoolTx {
    new_first_free: Option<u32>,
    new_first_valid: Option<u32>,
    published: usize,
    frees: Vec<(u64, u64)>,
}

impl PoolTx {
    pub fn set_first_free_entry(&mut self, index: u32) {
        self.new_first_free = Some(index);
    }

    pub fn set_first_valid_entry(&mut self, index: u32) {
        self.new_first_valid = Some(index);
    }

    /// Publish a reservation. In this pool model the referencing slot is
    /// what makes the region durable; publish records intent so that the
    /// reservation is no longer cancellable.
    pub fn publish(&mut self, _buffer: &PmemBuffer) {
        self.published += 1;
    }

    /// Free a published buffer's region once the transaction commits.
    pub fn free(&mut self, buffer: &PmemBuffer) {
        self.frees.push((buffer.offset(), buffer.alloc_len()));
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
