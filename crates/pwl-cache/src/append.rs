//! The append pipeline.
//!
//! Stage A flushes the payload buffers of queued operations in batches,
//! one drain per batch. Stage B allocates ring slots, copies slot
//! records, flushes contiguous slot runs (splitting at ring wrap),
//! drains once, then commits a transaction advancing the root head and
//! publishing the data buffers. A single-appender flag keeps exactly one
//! worker in stage B; others return immediately because the active
//! worker re-checks the queue before dropping the flag.

use crate::ops::LogOperation;
use crate::util::background_cx;
use crate::CacheInner;
use asupersync::Cx;
use pwl_error::{PwlError, Result};
use pwl_log::LogEntry;
use std::sync::Arc;
use tracing::{debug, error, trace};

impl CacheInner {
    /// Takes custody of ops: their payload buffers get flushed, then
    /// their slots appended.
    pub(crate) fn schedule_flush_and_append(self: &Arc<Self>, ops: Vec<LogOperation>) {
        let need_worker = {
            let mut state = self.state.lock();
            let need_worker = state.ops_to_flush.is_empty();
            state.ops_to_flush.extend(ops);
            need_worker
        };
        if need_worker {
            let cache = Arc::clone(self);
            self.queue_tracked(move || cache.flush_then_append_scheduled_ops());
        }
    }

    /// Stage A worker: flush payload batches, then hand off to stage B.
    fn flush_then_append_scheduled_ops(self: &Arc<Self>) {
        let cx = background_cx();
        loop {
            let batch: Vec<LogOperation> = {
                let mut state = self.state.lock();
                let take = state.ops_to_flush.len().min(self.config.flush_batch);
                state.ops_to_flush.drain(..take).collect()
            };
            if batch.is_empty() {
                break;
            }

            // Ops scheduled later may finish flushing before these;
            // ordering matters only from the append stage on.
            match self.flush_pmem_buffers(&cx, &batch) {
                Ok(()) => self.schedule_append(batch),
                Err(err) => {
                    error!(
                        target: "pwl::cache::append",
                        event = "payload_flush_failed",
                        error = %err
                    );
                    let status = -err.to_errno();
                    self.complete_op_log_entries(batch, status);
                }
            }
        }
        self.append_scheduled_ops();
    }

    /// Flush the payload buffers of a set of ops; one drain for all.
    pub(crate) fn flush_pmem_buffers(&self, cx: &Cx, ops: &[LogOperation]) -> Result<()> {
        for op in ops {
            if let LogOperation::Write(write_op) = op {
                self.pool.flush_buffer(cx, &write_op.buffer)?;
            }
        }
        self.pool.drain(cx)
    }

    /// Queue ops for stage B and mark them appending: their ring order
    /// is now fixed by queue order.
    pub(crate) fn schedule_append(self: &Arc<Self>, ops: Vec<LogOperation>) {
        let appending = ops.clone();
        let need_worker = {
            let mut state = self.state.lock();
            let need_worker = state.ops_to_append.is_empty() && !state.appending;
            state.ops_to_append.extend(ops);
            need_worker
        };

        if need_worker {
            let cache = Arc::clone(self);
            self.queue_tracked(move || cache.append_scheduled_ops());
        }

        for op in &appending {
            op.appending();
        }
    }

    /// Stage B worker: see module docs.
    pub(crate) fn append_scheduled_ops(self: &Arc<Self>) {
        let cx = background_cx();
        let mut became_appender = false;
        loop {
            let batch: Vec<LogOperation> = {
                let mut state = self.state.lock();
                if !became_appender && state.appending {
                    // Another worker is appending; it re-checks the
                    // queue before releasing the flag.
                    trace!(target: "pwl::cache::append", event = "appender_busy");
                    return;
                }
                if state.ops_to_append.is_empty() {
                    if became_appender {
                        state.appending = false;
                    }
                    return;
                }
                became_appender = true;
                state.appending = true;
                let take = state.ops_to_append.len().min(self.config.append_batch);
                state.ops_to_append.drain(..take).collect()
            };

            let result = {
                let _append = self.log_append_lock.lock();
                let (initial_head, new_head) = self.alloc_op_log_entries(&batch);
                let result = self.append_op_log_entries(&cx, &batch, new_head);
                if result.is_err() {
                    // The root head never moved; take the in-memory ring
                    // back to match it.
                    let mut state = self.state.lock();
                    for _ in 0..batch.len() {
                        state.log_entries.pop_back();
                    }
                    state.first_free_entry = initial_head;
                }
                result
            };
            let status = match result {
                Ok(()) => 0,
                Err(err) => {
                    error!(
                        target: "pwl::cache::append",
                        event = "append_failed",
                        ops = batch.len(),
                        error = %err
                    );
                    -err.to_errno()
                }
            };

            // Complete inline: the single appender keeps completion
            // delivery FIFO, so clients observe completions in
            // submission order. New entries may be flushable; completion
            // wakes the flusher.
            self.complete_op_log_entries(batch, status);
        }
    }

    /// Allocate (already reserved) ring slots for a batch, in order.
    /// Returns the pre- and post-batch heads. Caller holds the append
    /// lock.
    fn alloc_op_log_entries(&self, ops: &[LogOperation]) -> (u32, u32) {
        let mut state = self.state.lock();
        let initial_head = state.first_free_entry;
        for op in ops {
            let entry_index = state.first_free_entry;
            state.first_free_entry = (state.first_free_entry + 1) % state.total_log_entries;
            let entry = op.log_entry();
            entry.set_entry_index(entry_index);
            state.log_entries.push_back(entry);
        }
        (initial_head, state.first_free_entry)
    }

    /// Write and persist the batch's slot records, then atomically
    /// advance the head and publish the data buffers.
    fn append_op_log_entries(&self, cx: &Cx, ops: &[LogOperation], new_head: u32) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        // Copy slot records; flush each contiguous run with one call,
        // starting a new run where the ring wraps.
        let mut run_first: Option<u32> = None;
        let mut run_len = 0_u32;
        let mut last_index: Option<u32> = None;
        for op in ops {
            let entry = op.log_entry();
            let index = entry
                .entry_index()
                .ok_or_else(|| PwlError::Format("append of unallocated entry".to_owned()))?;
            if let Some(last) = last_index {
                if index < last {
                    // Ring wrap: flush the pre-wrap run.
                    self.pool
                        .flush_slot_range(cx, run_first.take().expect("run in progress"), run_len)?;
                    run_len = 0;
                }
            }
            self.pool.write_slot(index, &entry.slot_record().encode())?;
            if run_first.is_none() {
                run_first = Some(index);
            }
            run_len += 1;
            last_index = Some(index);
        }
        if let Some(first) = run_first {
            self.pool.flush_slot_range(cx, first, run_len)?;
        }
        self.pool.drain(cx)?;

        // Atomically advance the head and publish the buffers.
        self.pool.tx(cx, |tx| {
            tx.set_first_free_entry(new_head);
            for op in ops {
                if let LogOperation::Write(write_op) = op {
                    tx.publish(&write_op.buffer);
                }
            }
            Ok(())
        })?;
        debug!(
            target: "pwl::cache::append",
            event = "batch_appended",
            ops = ops.len(),
            new_head
        );
        Ok(())
    }

    /// Complete a batch with the append result.
    ///
    /// On success entries become readable-forever and flushable: they're
    /// marked completed and queued dirty. On failure the operations
    /// surface the error and no bookkeeping advances (the root head was
    /// not moved).
    pub(crate) fn complete_op_log_entries(self: &Arc<Self>, ops: Vec<LogOperation>, status: i32) {
        let mut dirty_entries: Vec<LogEntry> = Vec::new();
        let mut published = 0_u32;

        for op in &ops {
            if status == 0 {
                let entry = op.log_entry();
                entry.set_completed();
                if let LogOperation::Write(write_op) = op {
                    if let Some(sync_point_entry) = write_op.log_entry.sync_point_entry() {
                        sync_point_entry.note_write_completed();
                    }
                    published += 1;
                    dirty_entries.push(entry);
                }
            }

            match op {
                LogOperation::Write(write_op) => write_op.complete(status),
                LogOperation::SyncPoint(sync_op) => {
                    let sync_point = &sync_op.sync_point;
                    if status == 0 {
                        sync_point.log_entry.set_completed();
                    }
                    // Break the strong link from the following sync point.
                    if let Some(later) = sync_point.later() {
                        later.clear_earlier();
                    }
                    // Handle on-appending work queued after the op was
                    // scheduled, then deliver persist continuations (the
                    // flush request that created this point is one).
                    sync_point.appending();
                    for continuation in sync_point.take_on_persisted() {
                        continuation(status);
                    }
                    debug!(
                        target: "pwl::cache::append",
                        event = "sync_point_persisted",
                        sync_gen = sync_point.sync_gen().0,
                        status
                    );
                }
            }
        }

        {
            let mut state = self.state.lock();
            if status == 0 {
                state.unpublished_reserves = state.unpublished_reserves.saturating_sub(published);
                state.dirty_log_entries.extend(dirty_entries);
            } else {
                // Failed batch: hand back the resources its entries
                // held so the cache stays consistent.
                for op in &ops {
                    state.free_log_entries += 1;
                    if let LogOperation::Write(write_op) = op {
                        // The write never became durable; stop serving it.
                        self.map.remove_entry(&write_op.log_entry);
                        state.unpublished_reserves = state.unpublished_reserves.saturating_sub(1);
                        let write_bytes = write_op.log_entry.write_bytes;
                        state.bytes_cached = state.bytes_cached.saturating_sub(write_bytes);
                        state.bytes_dirty = state.bytes_dirty.saturating_sub(write_bytes);
                        state.bytes_allocated = state
                            .bytes_allocated
                            .saturating_sub(write_op.buffer.alloc_len());
                        self.pool.cancel(&write_op.buffer);
                    }
                }
            }
            // New entries may be flushable.
            self.wake_up(&mut state);
        }
    }
}
