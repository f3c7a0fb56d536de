//! Replay: rebuild all in-memory state from the pool on open.
//!
//! Walks the valid slot range in ring order, recreating write and
//! sync-point entries, rehydrating payload buffers and the data-area
//! occupancy. Sync points referenced by writes but missing from the log
//! (the generation current at crash time) are recreated and scheduled
//! for append. A second pass links writes to their sync points, fills
//! the block map, and queues every surviving write dirty so it drains
//! to the lower tier. Consistency violations fail the open.

use crate::util::DeferredWork;
use crate::{CacheInner, CacheState};
use asupersync::Cx;
use pwl_error::{PwlError, Result};
use pwl_log::{LogEntry, SlotRecord, SyncPointLogEntry, WriteLogEntry};
use pwl_pmem::MIN_ALLOC;
use pwl_types::SyncGen;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

impl CacheInner {
    pub(crate) fn load_existing_entries(
        self: &Arc<Self>,
        cx: &Cx,
        state: &mut CacheState,
        later: &mut DeferredWork,
    ) -> Result<()> {
        let root = self.pool.root();
        let mut sync_point_entries: BTreeMap<u64, Arc<SyncPointLogEntry>> = BTreeMap::new();
        let mut missing_sync_points: BTreeSet<u64> = BTreeSet::new();
        let mut highest_existing: Option<Arc<SyncPointLogEntry>> = None;

        // First pass: walk the valid slots in ring order.
        let mut entry_index = root.first_valid_entry;
        while entry_index != root.first_free_entry {
            let record = SlotRecord::decode(&self.pool.read_slot(entry_index)?)
                .map_err(|err| PwlError::Replay(err.to_string()))?;
            if !record.entry_valid {
                return Err(PwlError::Replay(format!(
                    "slot {entry_index} inside the valid range is not marked valid"
                )));
            }
            if record.entry_index != entry_index {
                return Err(PwlError::Replay(format!(
                    "slot {entry_index} carries entry index {}",
                    record.entry_index
                )));
            }

            let entry = if record.sync_point {
                if let Some(highest) = &highest_existing {
                    // Sync points must appear in increasing gen order.
                    if record.sync_gen <= highest.sync_gen.0 {
                        return Err(PwlError::Replay(format!(
                            "sync point gen {} not after gen {}",
                            record.sync_gen, highest.sync_gen.0
                        )));
                    }
                }
                let sync_point_entry = SyncPointLogEntry::new(SyncGen(record.sync_gen));
                sync_point_entry.set_entry_index(entry_index);
                sync_point_entry.set_completed();
                sync_point_entries.insert(record.sync_gen, Arc::clone(&sync_point_entry));
                missing_sync_points.remove(&record.sync_gen);
                highest_existing = Some(Arc::clone(&sync_point_entry));
                state.current_sync_gen = SyncGen(record.sync_gen);
                debug!(
                    target: "pwl::cache::replay",
                    event = "sync_point_slot",
                    entry_index,
                    sync_gen = record.sync_gen
                );
                LogEntry::SyncPoint(sync_point_entry)
            } else {
                if let Some(highest) = &highest_existing {
                    // A write precedes the sync point it belongs to.
                    if record.sync_gen <= highest.sync_gen.0 {
                        return Err(PwlError::Replay(format!(
                            "write at slot {entry_index} carries gen {} at or before \
                             appended sync point gen {}",
                            record.sync_gen, highest.sync_gen.0
                        )));
                    }
                }
                let write_entry =
                    WriteLogEntry::new(None, record.image_offset, record.write_bytes);
                write_entry.set_sync_gen(SyncGen(record.sync_gen));
                write_entry.set_write_sequence(record.write_sequence);
                write_entry.set_entry_index(entry_index);
                write_entry.set_completed();

                let payload =
                    self.pool
                        .rehydrate(cx, record.buffer_offset, record.write_bytes)?;
                let buffer =
                    self.pool
                        .adopt_buffer(record.buffer_offset, record.buffer_len, payload);
                self.pool
                    .mark_allocated(record.buffer_offset, record.buffer_len)?;
                write_entry.set_buffer(buffer);

                if !sync_point_entries.contains_key(&record.sync_gen) {
                    missing_sync_points.insert(record.sync_gen);
                }
                debug!(
                    target: "pwl::cache::replay",
                    event = "write_slot",
                    entry_index,
                    sync_gen = record.sync_gen,
                    image_offset = record.image_offset,
                    write_bytes = record.write_bytes
                );
                LogEntry::Write(write_entry)
            };

            state.log_entries.push_back(entry);
            entry_index = (entry_index + 1) % root.num_slots;
        }

        // Recreate sync points referenced by writes but never appended.
        // They must not be appended before the map is rebuilt; the
        // deferred activations take care of that.
        for missing_gen in missing_sync_points {
            if missing_gen != state.current_sync_gen.0 + 1 {
                return Err(PwlError::Replay(format!(
                    "missing sync point gen {missing_gen} does not follow gen {}",
                    state.current_sync_gen.0
                )));
            }
            warn!(
                target: "pwl::cache::replay",
                event = "missing_sync_point",
                sync_gen = missing_gen
            );
            self.init_flush_new_sync_point(state, later);
            debug_assert_eq!(state.current_sync_gen.0, missing_gen);
            let current = state
                .current_sync_point
                .as_ref()
                .expect("sync point just created");
            sync_point_entries.insert(missing_gen, Arc::clone(&current.log_entry));
        }

        // Second pass: link writes to their sync points, rebuild the
        // block map, and queue everything dirty so it drains again.
        let entries: Vec<LogEntry> = state.log_entries.iter().cloned().collect();
        for entry in entries {
            let LogEntry::Write(write_entry) = entry else {
                continue;
            };
            let sync_gen = write_entry.sync_gen().0;
            let sync_point_entry = sync_point_entries.get(&sync_gen).ok_or_else(|| {
                PwlError::Replay(format!("no sync point for write with gen {sync_gen}"))
            })?;
            write_entry.set_sync_point_entry(Arc::clone(sync_point_entry));
            sync_point_entry.note_write(write_entry.write_bytes);
            sync_point_entry.note_write_completed();

            self.map.add_entry(&write_entry);
            state
                .dirty_log_entries
                .push_back(LogEntry::Write(Arc::clone(&write_entry)));
            state.bytes_dirty += write_entry.write_bytes;
            state.bytes_cached += write_entry.write_bytes;
            let allocation = write_entry
                .buffer()
                .map(|buffer| buffer.alloc_len())
                .unwrap_or_else(|| write_entry.write_bytes.max(MIN_ALLOC));
            state.bytes_allocated += allocation;
        }

        info!(
            target: "pwl::cache::replay",
            event = "replay_complete",
            entries = state.log_entries.len(),
            dirty = state.dirty_log_entries.len(),
            current_sync_gen = state.current_sync_gen.0,
            bytes_allocated = state.bytes_allocated
        );
        Ok(())
    }
}
