#![forbid(unsafe_code)]
//! Overlap-ordering block guard.
//!
//! The guard serializes requests whose block extents overlap: a request
//! is admitted with a cell handle when no in-flight cell overlaps it,
//! and parked behind the overlapping cell otherwise. Releasing a cell
//! re-submits its parked requests in arrival order; requests admitted
//! after waiting are tagged `detained` so callers can account for the
//! latency.
//!
//! A request may additionally be a **barrier**: while a barrier is
//! outstanding every subsequent request, overlapping or not, queues in
//! FIFO order behind it. When the barrier's cell releases, the queue is
//! re-submitted in order, stopping early if another barrier is hit.
//!
//! Admitted cells are pairwise non-overlapping, so in-flight cells live
//! in an ordered map keyed by extent start. All state sits under one
//! mutex; acquisition callbacks always run outside it.

use parking_lot::Mutex;
use pwl_types::BlockExtent;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::trace;

/// Callback invoked when the guard admits a request.
pub type GuardAcquire = Box<dyn FnOnce(CellHandle, bool) + Send>;

/// Handle of an in-flight guard cell; must be released exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellHandle(u64);

/// A request submitted to the guard.
pub struct GuardedRequest {
    pub block_extent: BlockExtent,
    pub barrier: bool,
    pub on_acquire: GuardAcquire,
    detained: bool,
    queued: bool,
    current_barrier: bool,
}

impl GuardedRequest {
    #[must_use]
    pub fn new(block_extent: BlockExtent, on_acquire: GuardAcquire) -> Self {
        Self {
            block_extent,
            barrier: false,
            on_acquire,
            detained: false,
            queued: false,
            current_barrier: false,
        }
    }

    #[must_use]
    pub fn barrier(block_extent: BlockExtent, on_acquire: GuardAcquire) -> Self {
        Self {
            barrier: true,
            ..Self::new(block_extent, on_acquire)
        }
    }
}

impl std::fmt::Debug for GuardedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedRequest")
            .field("block_extent", &self.block_extent)
            .field("barrier", &self.barrier)
            .field("detained", &self.detained)
            .field("queued", &self.queued)
            .finish_non_exhaustive()
    }
}

/// An admitted request ready to run; fire it after the guard lock drops.
pub struct ReadyRequest {
    pub cell: CellHandle,
    pub detained: bool,
    on_acquire: GuardAcquire,
}

impl ReadyRequest {
    pub fn fire(self) {
        (self.on_acquire)(self.cell, self.detained);
    }
}

impl std::fmt::Debug for ReadyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyRequest")
            .field("cell", &self.cell)
            .field("detained", &self.detained)
            .finish_non_exhaustive()
    }
}

struct Cell {
    id: u64,
    extent: BlockExtent,
    waiters: VecDeque<GuardedRequest>,
}

#[derive(Default)]
struct GuardState {
    next_id: u64,
    /// In-flight cells keyed by extent start (pairwise non-overlapping).
    cells: BTreeMap<u64, Cell>,
    /// Cell id → extent start, for release by handle.
    starts: HashMap<u64, u64>,
    barrier_in_progress: bool,
    barrier_cell: Option<u64>,
    awaiting_barrier: VecDeque<GuardedRequest>,
}

impl GuardState {
    /// Find the in-flight cell overlapping `extent` with the greatest
    /// start, if any.
    fn find_overlap(&self, extent: BlockExtent) -> Option<u64> {
        self.cells
            .range(..=extent.end)
            .next_back()
            .filter(|(_, cell)| cell.extent.overlaps(extent))
            .map(|(start, _)| *start)
    }

    /// Admit or park a request, ignoring barrier state.
    fn detain(&mut self, mut req: GuardedRequest) -> Option<ReadyRequest> {
        if let Some(start) = self.find_overlap(req.block_extent) {
            trace!(
                target: "pwl::guard",
                event = "request_detained",
                extent = %req.block_extent
            );
            self.cells
                .get_mut(&start)
                .expect("overlap hit a missing cell")
                .waiters
                .push_back(req);
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.cells.insert(
            req.block_extent.start,
            Cell {
                id,
                extent: req.block_extent,
                waiters: VecDeque::new(),
            },
        );
        self.starts.insert(id, req.block_extent.start);
        if req.current_barrier {
            self.barrier_cell = Some(id);
        }
        req.queued = false;
        Some(ReadyRequest {
            cell: CellHandle(id),
            detained: req.detained,
            on_acquire: req.on_acquire,
        })
    }

    /// Admit, park, or queue behind a barrier.
    fn detain_behind_barrier(&mut self, mut req: GuardedRequest) -> Option<ReadyRequest> {
        if self.barrier_in_progress {
            req.queued = true;
            self.awaiting_barrier.push_back(req);
            return None;
        }
        if req.barrier {
            self.barrier_in_progress = true;
            req.current_barrier = true;
        }
        self.detain(req)
    }
}

/// The overlap serializer. See module docs.
#[derive(Default)]
pub struct BlockGuard {
    state: Mutex<GuardState>,
}

impl BlockGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a request. If it is admitted immediately the returned
    /// [`ReadyRequest`] must be fired by the caller (outside any lock of
    /// its own that conflicts with the acquisition callback).
    #[must_use]
    pub fn detain(&self, req: GuardedRequest) -> Option<ReadyRequest> {
        self.state.lock().detain_behind_barrier(req)
    }

    /// Release an admitted cell. Parked requests behind it are
    /// re-submitted in order; if the cell was the current barrier, the
    /// barrier queue drains FIFO up to the next barrier. The returned
    /// requests must be fired by the caller.
    #[must_use]
    pub fn release(&self, cell: CellHandle) -> Vec<ReadyRequest> {
        let mut ready = Vec::new();
        let mut state = self.state.lock();

        let start = state
            .starts
            .remove(&cell.0)
            .expect("release of unknown guard cell");
        let released = state
            .cells
            .remove(&start)
            .expect("guard cell missing for release");
        debug_assert_eq!(released.id, cell.0);

        for mut waiter in released.waiters {
            waiter.detained = true;
            if let Some(admitted) = state.detain(waiter) {
                ready.push(admitted);
            }
        }

        if state.barrier_in_progress && state.barrier_cell == Some(cell.0) {
            trace!(target: "pwl::guard", event = "barrier_released");
            state.barrier_in_progress = false;
            state.barrier_cell = None;
            while !state.barrier_in_progress {
                let Some(queued) = state.awaiting_barrier.pop_front() else {
                    break;
                };
                if let Some(admitted) = state.detain_behind_barrier(queued) {
                    ready.push(admitted);
                }
            }
        }

        drop(state);
        ready
    }

    /// Number of in-flight cells.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().cells.len()
    }

    /// Number of requests queued behind the current barrier.
    #[must_use]
    pub fn awaiting_barrier(&self) -> usize {
        self.state.lock().awaiting_barrier.len()
    }
}

impl std::fmt::Debug for BlockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BlockGuard")
            .field("in_flight", &state.cells.len())
            .field("barrier_in_progress", &state.barrier_in_progress)
            .field("awaiting_barrier", &state.awaiting_barrier.len())
            .finish()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
