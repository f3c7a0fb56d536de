//! Admission and resource accounting.
//!
//! A write needs one lane and one log slot per image extent plus data
//! buffers; allocation is all-or-nothing in three phases: check the
//! counters under the cache lock, reserve buffers outside it, then
//! re-check and commit under the lock (another thread may have consumed
//! the counters in between). Requests that fail move to a deferred FIFO
//! walked by a single dispatcher.
//!
//! Lanes are a throttle on the outbound pipeline and come back as soon
//! as a write is durable; slots and bytes come back only when the
//! retirer frees them.

use crate::ops::WriteOpSet;
use crate::sync_point::SyncPoint;
use crate::util::Completion;
use crate::CacheInner;
use parking_lot::Mutex;
use pwl_guard::CellHandle;
use pwl_pmem::{PmemBuffer, MIN_ALLOC};
use pwl_types::{ExtentsSummary, ImageExtent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

// ── Requests ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct WriteResources {
    pub allocated: bool,
    pub buffers: Vec<Arc<PmemBuffer>>,
}

/// A client write moving through guard admission, allocation, dispatch
/// and persistence. Owns the guard cell until the write is durable.
pub(crate) struct WriteRequest {
    pub image_extents: Vec<ImageExtent>,
    pub data: Vec<u8>,
    pub summary: ExtentsSummary,
    on_finish: Mutex<Option<Completion>>,
    pub cell: Mutex<Option<CellHandle>>,
    pub detained: AtomicBool,
    pub deferred: AtomicBool,
    pub waited_lanes: AtomicBool,
    pub waited_entries: AtomicBool,
    pub waited_buffers: AtomicBool,
    pub resources: Mutex<WriteResources>,
    pub op_set: Mutex<Option<Arc<WriteOpSet>>>,
    pub do_early_flush: AtomicBool,
}

impl WriteRequest {
    pub fn new(image_extents: Vec<ImageExtent>, data: Vec<u8>, on_finish: Completion) -> Arc<Self> {
        let summary = ExtentsSummary::new(&image_extents);
        Arc::new(Self {
            image_extents,
            data,
            summary,
            on_finish: Mutex::new(Some(on_finish)),
            cell: Mutex::new(None),
            detained: AtomicBool::new(false),
            deferred: AtomicBool::new(false),
            waited_lanes: AtomicBool::new(false),
            waited_entries: AtomicBool::new(false),
            waited_buffers: AtomicBool::new(false),
            resources: Mutex::new(WriteResources::default()),
            op_set: Mutex::new(None),
            do_early_flush: AtomicBool::new(false),
        })
    }

    /// Complete the client exactly once.
    pub fn complete_user(&self, status: i32) {
        if let Some(on_finish) = self.on_finish.lock().take() {
            on_finish(status);
        }
    }

    pub fn take_cell(&self) -> Option<CellHandle> {
        self.cell.lock().take()
    }
}

impl std::fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteRequest")
            .field("extents", &self.image_extents.len())
            .field("total_bytes", &self.summary.total_bytes)
            .field("detained", &self.detained.load(Ordering::Relaxed))
            .field("deferred", &self.deferred.load(Ordering::Relaxed))
            .finish()
    }
}

/// An `aio_flush` (or internal rollover flush). Needs one log slot for
/// the sync-point entry it will append.
pub(crate) struct FlushRequest {
    pub internal: bool,
    on_finish: Mutex<Option<Completion>>,
    pub to_append: Mutex<Option<Arc<SyncPoint>>>,
    pub log_entry_allocated: AtomicBool,
    pub deferred: AtomicBool,
}

impl FlushRequest {
    pub fn new(internal: bool, on_finish: Completion) -> Arc<Self> {
        Arc::new(Self {
            internal,
            on_finish: Mutex::new(Some(on_finish)),
            to_append: Mutex::new(None),
            log_entry_allocated: AtomicBool::new(false),
            deferred: AtomicBool::new(false),
        })
    }

    pub fn complete_user(&self, status: i32) {
        if let Some(on_finish) = self.on_finish.lock().take() {
            on_finish(status);
        }
    }
}

impl std::fmt::Debug for FlushRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushRequest")
            .field("internal", &self.internal)
            .field(
                "log_entry_allocated",
                &self.log_entry_allocated.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// Either kind of admission-governed request.
#[derive(Clone, Debug)]
pub(crate) enum IoRequest {
    Write(Arc<WriteRequest>),
    Flush(Arc<FlushRequest>),
}

impl std::fmt::Debug for WriteResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteResources")
            .field("allocated", &self.allocated)
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

impl IoRequest {
    pub fn alloc_resources(&self, cache: &Arc<CacheInner>) -> bool {
        match self {
            Self::Write(req) => cache.alloc_write_resources(req),
            Self::Flush(req) => cache.alloc_flush_resources(req),
        }
    }

    pub fn dispatch(&self, cache: &Arc<CacheInner>) {
        match self {
            Self::Write(req) => cache.dispatch_write(Arc::clone(req)),
            Self::Flush(req) => cache.dispatch_flush(Arc::clone(req)),
        }
    }

    pub fn mark_deferred(&self) {
        match self {
            Self::Write(req) => req.deferred.store(true, Ordering::Release),
            Self::Flush(req) => req.deferred.store(true, Ordering::Release),
        }
    }
}

// ── Allocation ──────────────────────────────────────────────────────────────

impl CacheInner {
    /// Three-phase all-or-nothing allocation for a write. Records the
    /// shortage reason on the request and returns false on failure.
    pub(crate) fn alloc_write_resources(&self, req: &WriteRequest) -> bool {
        let num_extents = u32::try_from(req.image_extents.len()).unwrap_or(u32::MAX);
        let mut alloc_succeeds = true;
        let mut no_space = false;

        {
            let state = self.state.lock();
            if state.free_lanes < num_extents {
                req.waited_lanes.store(true, Ordering::Release);
                // Lanes are a throttle, not a space shortage.
                alloc_succeeds = false;
            }
            if state.free_log_entries < num_extents {
                req.waited_entries.store(true, Ordering::Release);
                alloc_succeeds = false;
                no_space = true;
            }
            if state.bytes_allocated > state.bytes_allocated_cap {
                req.waited_buffers.store(true, Ordering::Release);
                alloc_succeeds = false;
                no_space = true;
            }
        }

        let mut buffers: Vec<Arc<PmemBuffer>> = Vec::with_capacity(req.image_extents.len());
        let mut bytes_allocated = 0_u64;
        let mut bytes_cached = 0_u64;
        if alloc_succeeds {
            for extent in &req.image_extents {
                let alloc_len = extent.len.max(MIN_ALLOC);
                match self.pool.reserve(alloc_len) {
                    Ok(buffer) => {
                        bytes_allocated += alloc_len;
                        bytes_cached += extent.len;
                        buffers.push(buffer);
                    }
                    Err(err) => {
                        trace!(
                            target: "pwl::cache::alloc",
                            event = "buffer_reserve_failed",
                            error = %err
                        );
                        req.waited_buffers.store(true, Ordering::Release);
                        alloc_succeeds = false;
                        no_space = true;
                        break;
                    }
                }
            }
        }

        if alloc_succeeds {
            let mut state = self.state.lock();
            // Re-check: another thread may have taken these since phase 1.
            if state.free_lanes >= num_extents && state.free_log_entries >= num_extents {
                state.free_lanes -= num_extents;
                state.free_log_entries -= num_extents;
                state.unpublished_reserves += num_extents;
                state.bytes_allocated += bytes_allocated;
                state.bytes_cached += bytes_cached;
                state.bytes_dirty += bytes_cached;
                let mut resources = req.resources.lock();
                resources.allocated = true;
                resources.buffers = buffers;
                return true;
            }
            alloc_succeeds = false;
        }

        // Allocation failed: give back anything reserved so far.
        for buffer in &buffers {
            self.pool.cancel(buffer);
        }
        if no_space {
            let mut state = self.state.lock();
            state.alloc_failed_since_retire = true;
            debug!(
                target: "pwl::cache::alloc",
                event = "write_alloc_failed",
                bytes_allocated = state.bytes_allocated,
                free_log_entries = state.free_log_entries
            );
        }
        debug_assert!(!alloc_succeeds);
        false
    }

    /// A flush needs one free log slot for its sync-point entry.
    pub(crate) fn alloc_flush_resources(&self, req: &FlushRequest) -> bool {
        debug_assert!(!req.log_entry_allocated.load(Ordering::Acquire));
        let mut state = self.state.lock();
        if state.free_log_entries == 0 {
            return false;
        }
        state.free_log_entries -= 1;
        req.log_entry_allocated.store(true, Ordering::Release);
        true
    }

    /// Dispatch a request now if resources allow, otherwise defer it.
    pub(crate) fn alloc_and_dispatch_io(self: &Arc<Self>, req: IoRequest) {
        // Queue behind existing deferred requests for fairness.
        let mut dispatch_here = self.state.lock().deferred_ios.is_empty();
        if dispatch_here {
            dispatch_here = req.alloc_resources(self);
        }
        if dispatch_here {
            req.dispatch(self);
        } else {
            req.mark_deferred();
            let queued = {
                let mut state = self.state.lock();
                state.deferred_ios.push_back(req);
                // A shortage was just recorded; the retirer should run.
                self.wake_up(&mut state);
                state.deferred_ios.len()
            };
            debug!(target: "pwl::cache::alloc", event = "io_deferred", queued);
            self.dispatch_deferred_ios();
        }
    }

    /// Walk the deferred queue, dispatching while allocation succeeds.
    ///
    /// At most one thread dispatches at a time: the `dispatching_deferred`
    /// flag elects the dispatcher, and `deferred_dispatch_lock` keeps the
    /// walk itself single-file. The head is popped only after its
    /// allocation succeeded; the walk stops at the first failure.
    pub(crate) fn dispatch_deferred_ios(self: &Arc<Self>) {
        let mut front: Option<IoRequest> = None;
        let mut allocated_req: Option<IoRequest> = None;
        let mut allocated = false;

        {
            let mut state = self.state.lock();
            if state.dispatching_deferred || state.deferred_ios.is_empty() {
                return;
            }
            state.dispatching_deferred = true;
        }

        {
            let _dispatch = self.deferred_dispatch_lock.lock();
            loop {
                {
                    let mut state = self.state.lock();
                    debug_assert!(state.dispatching_deferred);
                    if allocated {
                        debug_assert!(front.is_some());
                        debug_assert!(allocated_req.is_none());
                        state.deferred_ios.pop_front();
                        allocated_req = front.take();
                        allocated = false;
                    }
                    if front.is_some() {
                        // Allocation failed for the head; stop dispatching.
                        front = None;
                        state.dispatching_deferred = false;
                    } else if let Some(head) = state.deferred_ios.front() {
                        front = Some(head.clone());
                    } else {
                        state.dispatching_deferred = false;
                    }
                }

                let Some(head) = front.as_ref() else { break };
                allocated = head.alloc_resources(self);

                if allocated && allocated_req.is_some() {
                    // Push the previously allocated request to a worker
                    // and keep walking on this thread.
                    let req = allocated_req.take().expect("allocated_req checked");
                    let cache = Arc::clone(self);
                    self.queue_tracked(move || req.dispatch(&cache));
                }
            }
        }

        if let Some(req) = allocated_req {
            req.dispatch(self);
        }
    }

    /// Return a write's lanes once it is durable, then try the deferred
    /// queue; slots and bytes stay allocated until retirement.
    pub(crate) fn release_write_lanes(self: &Arc<Self>, req: &WriteRequest) {
        {
            let mut state = self.state.lock();
            let mut resources = req.resources.lock();
            if !resources.allocated {
                warn!(target: "pwl::cache::alloc", event = "lanes_released_twice");
                return;
            }
            resources.allocated = false;
            state.free_lanes += u32::try_from(req.image_extents.len()).unwrap_or(u32::MAX);
        }
        self.dispatch_deferred_ios();
    }
}
