//! The retirer: reclaims the oldest log entries.
//!
//! Retirement walks the ring tail while the head entry is retirable,
//! frees up to `frees_per_tx` entries per root transaction, then
//! returns the slots and bytes. Readers are excluded for the duration
//! by the entry-reader write lock; a second retirer is excluded by the
//! retire lock.

use crate::CacheInner;
use pwl_error::{PwlError, Result};
use pwl_log::LogEntry;
use pwl_pmem::MIN_ALLOC;
use std::sync::Arc;
use tracing::{debug, trace};

impl CacheInner {
    /// Whether the ring-tail entry can be reclaimed.
    ///
    /// A flushed entry's remaining map coverage does not block it: its
    /// bytes are durable below, so the retirer strips the coverage
    /// itself and the reference count is zero by the time the entry is
    /// freed. Reads of that range simply miss to the lower tier.
    fn can_retire_entry(&self, entry: &LogEntry) -> bool {
        if !entry.completed() {
            return false;
        }
        match entry {
            LogEntry::Write(write_entry) => {
                write_entry.flushed() && write_entry.reader_count() == 0
            }
            LogEntry::SyncPoint(_) => true,
        }
    }

    /// Retire up to `frees_per_tx` of the oldest eligible entries.
    /// Returns whether anything was retired.
    pub(crate) fn retire_entries(self: &Arc<Self>, frees_per_tx: usize) -> Result<bool> {
        let _retire = self.log_retire_lock.lock();
        let mut retiring: Vec<LogEntry> = Vec::new();
        let initial_first_valid;
        let mut first_valid;

        {
            // No new readers while entries leave the map.
            let _reader = self.entry_reader_lock.write();
            let mut state = self.state.lock();
            initial_first_valid = state.first_valid_entry;
            first_valid = state.first_valid_entry;

            while retiring.len() < frees_per_tx {
                let Some(entry) = state.log_entries.front().cloned() else {
                    break;
                };
                if !self.can_retire_entry(&entry) {
                    break;
                }
                let index = entry
                    .entry_index()
                    .ok_or_else(|| PwlError::Format("ring entry with no index".to_owned()))?;
                if index != first_valid {
                    return Err(PwlError::Corruption {
                        index,
                        detail: format!("retiring entry is not at the ring tail {first_valid}"),
                    });
                }
                first_valid = (first_valid + 1) % state.total_log_entries;
                state.log_entries.pop_front();
                if let LogEntry::Write(write_entry) = &entry {
                    // Out of the map: no more readers can appear.
                    self.map.remove_entry(write_entry);
                    debug_assert!(!write_entry.flushing());
                    debug_assert!(write_entry.flushed());
                    debug_assert_eq!(write_entry.referring_map_entries(), 0);
                }
                retiring.push(entry);
            }
        }

        if retiring.is_empty() {
            trace!(target: "pwl::cache::retire", event = "nothing_to_retire");
            return Ok(false);
        }

        {
            let cx = crate::util::background_cx();
            let _append = self.log_append_lock.lock();
            self.pool.tx(&cx, |tx| {
                tx.set_first_valid_entry(first_valid);
                for entry in &retiring {
                    if let LogEntry::Write(write_entry) = entry {
                        if let Some(buffer) = write_entry.buffer() {
                            tx.free(&buffer);
                        }
                    }
                }
                Ok(())
            })?;
        }

        {
            let mut state = self.state.lock();
            debug_assert_eq!(state.first_valid_entry, initial_first_valid);
            state.first_valid_entry = first_valid;
            state.free_log_entries += u32::try_from(retiring.len()).unwrap_or(u32::MAX);
            for entry in &retiring {
                if let LogEntry::Write(write_entry) = entry {
                    debug_assert!(state.bytes_cached >= write_entry.write_bytes);
                    state.bytes_cached = state.bytes_cached.saturating_sub(write_entry.write_bytes);
                    let allocation = write_entry.write_bytes.max(MIN_ALLOC);
                    state.bytes_allocated = state.bytes_allocated.saturating_sub(allocation);
                }
            }
            state.alloc_failed_since_retire = false;
            self.wake_up(&mut state);
        }

        debug!(
            target: "pwl::cache::retire",
            event = "entries_retired",
            retired = retiring.len(),
            first_valid
        );
        Ok(true)
    }
}
