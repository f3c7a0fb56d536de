//! The flusher: drains completed dirty entries to the lower tier.
//!
//! Entries flush from the head of the dirty list. An entry with a later
//! sync generation never starts flushing while an earlier generation is
//! still in flight, so the lower tier never observes a write ordered
//! ahead of one its application saw complete first. While `invalidating`
//! is set the flusher performs only the bookkeeping and skips the
//! lower-tier write.

use crate::util::{background_cx, status_code, Completion};
use crate::CacheInner;
use pwl_log::{LogEntry, WriteLogEntry};
use pwl_types::{ImageExtent, SyncGen};
use std::sync::Arc;
use tracing::{debug, error, trace};

impl CacheInner {
    /// Select and launch flushes from the dirty list head; drain flush
    /// completions when everything is clean.
    pub(crate) fn process_writeback_dirty_entries(self: &Arc<Self>) {
        let mut all_clean = false;
        let mut launched = 0_u32;
        let mut flush_work: Vec<Box<dyn FnOnce() + Send>> = Vec::new();

        {
            let _reader = self.entry_reader_lock.read();
            while launched < self.config.flush_in_flight_limit {
                let mut state = self.state.lock();
                let Some(candidate) = state.dirty_log_entries.front().cloned() else {
                    // Nothing left: flush-complete actions may fire once
                    // in-flight writes drain too.
                    all_clean = state.flush_ops_in_flight == 0;
                    break;
                };
                let flushable = self.can_flush_entry(&state, &candidate);
                if flushable {
                    if let LogEntry::Write(entry) = &candidate {
                        flush_work.push(self.construct_flush_entry_work(&mut state, entry));
                        launched += 1;
                    }
                }
                if flushable || !candidate.is_write() {
                    state.dirty_log_entries.pop_front();
                } else {
                    trace!(
                        target: "pwl::cache::flush",
                        event = "head_not_flushable",
                        sync_gen = candidate.sync_gen().0
                    );
                    break;
                }
            }
        }

        for work in flush_work {
            work();
        }

        if all_clean {
            let contexts = {
                let mut state = self.state.lock();
                std::mem::take(&mut state.flush_complete_contexts)
            };
            if !contexts.is_empty() {
                debug!(
                    target: "pwl::cache::flush",
                    event = "all_clean",
                    contexts = contexts.len()
                );
            }
            for context in contexts {
                context(0);
            }
        }
    }

    /// Whether the dirty-list head may start flushing now.
    fn can_flush_entry(&self, state: &crate::CacheState, entry: &LogEntry) -> bool {
        if state.invalidating {
            return true;
        }
        // Never flush a later generation ahead of an in-flight earlier
        // one; concurrent flushing within a generation is fine.
        if state.flush_ops_in_flight > 0 && entry.sync_gen() > state.lowest_flushing_sync_gen {
            return false;
        }
        entry.completed()
            && state.flush_ops_in_flight <= self.config.flush_in_flight_limit
            && state.flush_bytes_in_flight <= self.config.flush_bytes_limit
    }

    /// Account a flush start and build the work that performs it. Called
    /// with the cache lock and the entry-reader read lock held; the
    /// returned work runs after both drop.
    fn construct_flush_entry_work(
        self: &Arc<Self>,
        state: &mut crate::CacheState,
        entry: &Arc<WriteLogEntry>,
    ) -> Box<dyn FnOnce() + Send> {
        if state.flush_ops_in_flight == 0 || entry.sync_gen() < state.lowest_flushing_sync_gen {
            state.lowest_flushing_sync_gen = entry.sync_gen();
        }
        state.flush_ops_in_flight += 1;
        state.flush_bytes_in_flight += entry.write_bytes;
        entry.set_flushing(true);

        let invalidating = state.invalidating;
        let cache = Arc::clone(self);
        let entry = Arc::clone(entry);

        if invalidating {
            // Bookkeeping only; the data is being thrown away.
            return Box::new(move || cache.finish_entry_flush(&entry, 0));
        }

        // The reader reference pins the buffer until the lower-tier
        // write finishes.
        entry.add_reader();
        self.tracker.start_op();
        Box::new(move || {
            let worker_cache = Arc::clone(&cache);
            let worker_entry = Arc::clone(&entry);
            cache.workers.queue(move || {
                let cx = background_cx();
                let extent = ImageExtent {
                    offset: worker_entry.image_offset,
                    len: worker_entry.write_bytes,
                };
                let result = worker_entry
                    .buffer()
                    .and_then(|buffer| buffer.bytes().map(|bytes| bytes.to_vec()))
                    .ok_or_else(|| {
                        pwl_error::PwlError::Format("flush of an entry with no payload".to_owned())
                    })
                    .and_then(|bytes| worker_cache.lower.write(&cx, extent, &bytes));
                let status = status_code(&result);
                trace!(
                    target: "pwl::cache::flush",
                    event = "lower_write_done",
                    offset = worker_entry.image_offset,
                    bytes = worker_entry.write_bytes,
                    status
                );
                worker_cache.finish_entry_flush(&worker_entry, status);
                worker_entry.remove_reader();
                worker_cache.tracker.finish_op();
            });
        })
    }

    /// Flush completion bookkeeping; failures requeue at the dirty head.
    fn finish_entry_flush(self: &Arc<Self>, entry: &Arc<WriteLogEntry>, status: i32) {
        let mut state = self.state.lock();
        state.flush_ops_in_flight -= 1;
        state.flush_bytes_in_flight -= entry.write_bytes;
        entry.set_flushing(false);
        if status < 0 {
            error!(
                target: "pwl::cache::flush",
                event = "entry_flush_failed",
                offset = entry.image_offset,
                status
            );
            state
                .dirty_log_entries
                .push_front(LogEntry::Write(Arc::clone(entry)));
        } else {
            entry.set_flushed();
            debug_assert!(state.bytes_dirty >= entry.write_bytes);
            state.bytes_dirty = state.bytes_dirty.saturating_sub(entry.write_bytes);
        }
        if state.flush_ops_in_flight == 0 {
            state.lowest_flushing_sync_gen = SyncGen(0);
        }
        self.wake_up(&mut state);
    }

    /// Internal flush: complete once nothing is dirty or in flight.
    pub(crate) fn flush_internal(self: &Arc<Self>, on_finish: Completion) {
        let all_clean = {
            let state = self.state.lock();
            state.flush_ops_in_flight == 0 && state.dirty_log_entries.is_empty()
        };

        if all_clean {
            trace!(target: "pwl::cache::flush", event = "flush_no_dirty");
            on_finish(0);
            return;
        }

        let cache = Arc::clone(self);
        let mut state = self.state.lock();
        state.flush_complete_contexts.push(Box::new(move |_status| {
            // Re-check: new dirty entries may have arrived since.
            cache.flush_internal(on_finish);
        }));
        self.wake_up(&mut state);
    }
}
