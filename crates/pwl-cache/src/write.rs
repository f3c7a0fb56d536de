//! The write path: from `aio_write` through buffer copy to append
//! scheduling, plus sync-point creation and rollover.

use crate::ops::WriteOpSet;
use crate::resources::{FlushRequest, IoRequest, WriteRequest};
use crate::sync_point::SyncPoint;
use crate::util::{background_cx, Completion, DeferredWork};
use crate::{CacheInner, CacheState};
use asupersync::Cx;
use pwl_guard::GuardedRequest;
use pwl_types::ImageExtent;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

impl CacheInner {
    /// Client write entry point. The payload is the concatenation of all
    /// extents' bytes in order.
    pub(crate) fn aio_write(
        self: &Arc<Self>,
        cx: &Cx,
        image_extents: Vec<ImageExtent>,
        data: Vec<u8>,
        on_finish: Completion,
    ) {
        if cx.checkpoint().is_err() {
            on_finish(-libc::ECANCELED);
            return;
        }
        if self.config.read_only {
            on_finish(-libc::EROFS);
            return;
        }
        let total_bytes: u64 = image_extents.iter().map(|extent| extent.len).sum();
        if image_extents.is_empty() || total_bytes != data.len() as u64 {
            on_finish(-libc::EINVAL);
            return;
        }

        let req = WriteRequest::new(image_extents, data, on_finish);
        trace!(
            target: "pwl::cache::write",
            event = "write_arrived",
            extents = req.image_extents.len(),
            bytes = req.summary.total_bytes
        );

        let cache = Arc::clone(self);
        let guarded_req = Arc::clone(&req);
        let guard_extent = req.summary.block_extent();
        let request = GuardedRequest::new(
            guard_extent,
            Box::new(move |cell, detained| {
                guarded_req.detained.store(detained, Ordering::Release);
                *guarded_req.cell.lock() = Some(cell);
                cache.alloc_and_dispatch_io(IoRequest::Write(Arc::clone(&guarded_req)));
            }),
        );
        if let Some(ready) = self.guard.detain(request) {
            ready.fire();
        }
    }

    /// Takes custody of an allocated write: build its operation set,
    /// copy the payload, publish it in the block map, and schedule the
    /// append.
    pub(crate) fn dispatch_write(self: &Arc<Self>, req: Arc<WriteRequest>) {
        let mut later = DeferredWork::new();

        let op_set = {
            let mut state = self.state.lock();
            debug_assert!(req.resources.lock().allocated);

            let current = state
                .current_sync_point
                .as_ref()
                .expect("dispatch before initialization")
                .clone();
            let needs_new_sync_point = (!state.persist_on_flush
                && current.log_entry.writes_completed() > 0)
                || current.log_entry.writes() > self.config.max_writes_per_sync_point
                || current.log_entry.bytes() > self.config.max_bytes_per_sync_point;
            if needs_new_sync_point {
                // A fresh sync point: this write will bear a gen number
                // shared with no already-completed writes.
                self.flush_new_sync_point(None, &mut state, &mut later);
            }

            let sync_point = state
                .current_sync_point
                .as_ref()
                .expect("rollover lost the sync point")
                .clone();
            let persist_on_flush = state.persist_on_flush;
            let buffers = req.resources.lock().buffers.clone();

            let cache = Arc::clone(self);
            let persisted_req = Arc::clone(&req);
            let op_set = Arc::new(WriteOpSet::new(
                sync_point,
                persist_on_flush,
                &req.image_extents,
                &buffers,
                Box::new(move |status| {
                    cache.complete_write_req(&persisted_req, status);
                }),
            ));

            for op in &op_set.operations {
                op.log_entry.set_sync_gen(state.current_sync_gen);
                if persist_on_flush {
                    // Sequence 0 is never used.
                    op.log_entry.set_write_sequence(0);
                } else {
                    state.last_op_sequence += 1;
                    op.log_entry.set_write_sequence(state.last_op_sequence);
                }
            }

            *req.op_set.lock() = Some(Arc::clone(&op_set));
            op_set
        };

        // Copy the payload into the reserved buffers, outside the lock.
        let mut payload_offset = 0_usize;
        for op in &op_set.operations {
            let len = op.log_entry.write_bytes as usize;
            op.buffer
                .fill(req.data[payload_offset..payload_offset + len].to_vec());
            payload_offset += len;
        }

        // Reads see this write from here on.
        self.map.add_entries(&op_set.write_entries());

        if op_set.persist_on_flush {
            // Done with the caller's buffer; durability waits for the
            // next flush, the client does not.
            req.complete_user(0);
        }

        let ops = op_set.log_operations();
        let cache = Arc::clone(self);
        let schedule_req = Arc::clone(&req);
        let schedule: Box<dyn FnOnce() + Send> = Box::new(move || {
            if schedule_req.do_early_flush.load(Ordering::Acquire) {
                // The caller is waiting for persistence; use its thread
                // to flush the payload before scheduling the append.
                let cx = background_cx();
                if let Err(err) = cache.flush_pmem_buffers(&cx, &ops) {
                    error!(
                        target: "pwl::cache::write",
                        event = "payload_flush_failed",
                        error = %err
                    );
                    let status = -err.to_errno();
                    cache.complete_op_log_entries(ops, status);
                    return;
                }
                cache.schedule_append(ops);
            } else {
                cache.schedule_flush_and_append(ops);
            }
        });

        {
            let _state = self.state.lock();
            let earlier = op_set.sync_point.earlier();
            if !op_set.persist_on_flush && earlier.is_some() {
                // Wait for the previous sync point to start appending.
                req.do_early_flush.store(false, Ordering::Release);
                earlier
                    .expect("earlier checked above")
                    .push_on_appending(schedule);
            } else {
                let early = !(req.detained.load(Ordering::Acquire)
                    || req.deferred.load(Ordering::Acquire)
                    || op_set.persist_on_flush);
                req.do_early_flush.store(early, Ordering::Release);
                later.add(schedule);
            }
        }
    }

    /// Runs when every extent of a write is durable.
    pub(crate) fn complete_write_req(self: &Arc<Self>, req: &Arc<WriteRequest>, status: i32) {
        let persist_on_flush = req
            .op_set
            .lock()
            .as_ref()
            .map(|set| set.persist_on_flush)
            .unwrap_or(false);
        if !persist_on_flush {
            req.complete_user(status);
        }
        // Completed to the caller by here.
        self.release_write_lanes(req);
        if let Some(cell) = req.take_cell() {
            self.release_guard_cell(cell);
        }
        trace!(target: "pwl::cache::write", event = "write_request_complete", status);
    }

    /// Release a guard cell, dispatching any newly admitted requests on
    /// worker threads.
    pub(crate) fn release_guard_cell(self: &Arc<Self>, cell: pwl_guard::CellHandle) {
        for ready in self.guard.release(cell) {
            self.queue_tracked(move || ready.fire());
        }
    }

    // ── Sync points ─────────────────────────────────────────────────────

    /// Begin a new sync point. Called with the cache lock held; work
    /// that must run after the lock drops goes on `later`.
    pub(crate) fn new_sync_point(
        self: &Arc<Self>,
        state: &mut CacheState,
        later: &mut DeferredWork,
    ) {
        let old_sync_point = state.current_sync_point.clone();
        // On a re-opened log the gen picks up after the highest replayed
        // sync point.
        state.current_sync_gen = state.current_sync_gen.next();
        let new_sync_point = SyncPoint::new(state.current_sync_gen);
        state.current_sync_point = Some(Arc::clone(&new_sync_point));

        if let Some(old) = &old_sync_point {
            SyncPoint::link(old, &new_sync_point);
            old.set_final_op_sequence(state.last_op_sequence);
            if !old.is_appending() {
                // The new point's prior gather waits for the old point
                // to start appending.
                let chain_sub = new_sync_point.prior_entries_persisted.new_sub();
                old.push_on_appending(Box::new(move || chain_sub.complete(0)));
            }
            // The old point will acquire no more subs.
            let old_prior = Arc::clone(&old.prior_entries_persisted);
            later.add(move || old_prior.activate());
            debug!(
                target: "pwl::cache::sync_point",
                event = "sync_point_rollover",
                new_gen = new_sync_point.sync_gen().0,
                old_gen = old.sync_gen().0
            );
        } else {
            info!(
                target: "pwl::cache::sync_point",
                event = "first_sync_point",
                sync_gen = new_sync_point.sync_gen().0
            );
        }

        // When all prior entries have persisted, this sync point may
        // itself persist.
        let persist_ready = new_sync_point.sync_point_persisted.new_sub();
        new_sync_point
            .prior_entries_persisted
            .set_finisher(Box::new(move |status| {
                persist_ready.complete(status);
            }));
    }

    /// Roll over to a new sync point and arrange for the previous one to
    /// be appended and persisted. `flush_req` is the request that
    /// triggered the rollover; an internal one is created for rollovers
    /// born from the write path.
    pub(crate) fn flush_new_sync_point(
        self: &Arc<Self>,
        flush_req: Option<Arc<FlushRequest>>,
        state: &mut CacheState,
        later: &mut DeferredWork,
    ) {
        let flush_req = flush_req.unwrap_or_else(|| {
            self.tracker.start_op();
            let tracker_cache = Arc::clone(self);
            FlushRequest::new(
                true,
                Box::new(move |_status| {
                    tracker_cache.tracker.finish_op();
                }),
            )
        });

        self.new_sync_point(state, later);
        let to_append = state
            .current_sync_point
            .as_ref()
            .expect("rollover without a current sync point")
            .earlier()
            .expect("rollover without a predecessor");

        *flush_req.to_append.lock() = Some(Arc::clone(&to_append));
        to_append.set_append_scheduled();

        // Any prior sync point still linked must already be scheduled.
        debug_assert!({
            let mut prior = to_append.earlier();
            let mut all_scheduled = true;
            while let Some(point) = prior {
                all_scheduled &= point.append_scheduled();
                prior = point.earlier();
            }
            all_scheduled
        });

        // Once the sync point may persist, allocate and dispatch its
        // append.
        let cache = Arc::clone(self);
        let dispatch_req = Arc::clone(&flush_req);
        to_append
            .sync_point_persisted
            .set_finisher(Box::new(move |_status| {
                trace!(
                    target: "pwl::cache::sync_point",
                    event = "sync_point_ready_to_persist"
                );
                cache.alloc_and_dispatch_io(IoRequest::Flush(dispatch_req));
            }));

        // The gather has all the subs it will ever get; activate once
        // the cache lock is released.
        let activate_point = Arc::clone(&to_append);
        later.add(move || activate_point.sync_point_persisted.activate());

        // The flush request completes when the sync point persists.
        let completed_req = Arc::clone(&flush_req);
        to_append.push_on_persisted(Box::new(move |status| {
            completed_req.complete_user(status);
        }));
    }

    /// First sync point at open, or rollover of the one replay built.
    pub(crate) fn init_flush_new_sync_point(
        self: &Arc<Self>,
        state: &mut CacheState,
        later: &mut DeferredWork,
    ) {
        if state.current_sync_point.is_none() {
            self.new_sync_point(state, later);
        } else {
            self.flush_new_sync_point(None, state, later);
        }
    }

    /// Dispatch an allocated flush: queue the sync-point slot append.
    pub(crate) fn dispatch_flush(self: &Arc<Self>, req: Arc<FlushRequest>) {
        debug_assert!(req.log_entry_allocated.load(Ordering::Acquire));
        let to_append = req
            .to_append
            .lock()
            .clone()
            .expect("flush dispatched without a sync point");
        let op = crate::ops::SyncPointOperation::new(to_append);
        self.schedule_append(vec![crate::ops::LogOperation::SyncPoint(op)]);
    }
}
