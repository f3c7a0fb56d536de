#![forbid(unsafe_code)]
//! Persistent write-back log cache.
//!
//! Client writes land in a file-backed circular log and are
//! acknowledged once durably appended (persist-on-write) or as soon as
//! the payload is captured (persist-on-flush); a background flusher
//! drains completed entries to the lower tier in sync-generation order
//! and the retirer reclaims the ring tail between the configured
//! watermarks. Reads are served from the log for resident ranges and
//! forwarded below for the rest. On open, all state is rebuilt from the
//! pool by replay.
//!
//! Completions carry a status code: 0 on success, a negated POSIX errno
//! otherwise, as delivered by the block layer this cache slots into.

mod append;
mod flusher;
mod ops;
mod read;
mod replay;
mod resources;
mod retire;
mod sync_point;
mod util;
mod workers;
mod write;

pub use pwl_error::{PwlError, Result};
pub use pwl_types::{BlockExtent, ImageExtent, SyncGen};
pub use read::ReadCompletion;
pub use util::Completion;

use crate::ops::LogOperation;
use crate::resources::{FlushRequest, IoRequest};
use crate::sync_point::SyncPoint;
use crate::util::{background_cx, status_code, AsyncOpTracker, DeferredWork};
use crate::workers::WorkerPool;
use asupersync::Cx;
use parking_lot::{Mutex, RwLock};
use pwl_guard::{BlockGuard, GuardedRequest};
use pwl_log::{LogEntry, WriteLogMap};
use pwl_pmem::{LogPool, MIN_ALLOC, MIN_POOL_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Compare-and-write continuation: status code plus the mismatch offset
/// when the comparison failed.
pub type CompareCompletion = Box<dyn FnOnce(i32, Option<u64>) + Send>;

// ── Configuration ───────────────────────────────────────────────────────────

/// Cache configuration. Field defaults come from [`CacheConfig::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Pool file location.
    pub pool_path: PathBuf,
    /// Pool size in bytes; clamped up to the pool minimum.
    pub pool_size: u64,
    /// Start in persist-on-write mode and switch to persist-on-flush at
    /// the first client flush.
    pub persist_on_write_until_flush: bool,
    /// Fraction of the pool usable for payloads; also scales the
    /// allocation cap.
    pub usable_fraction: f64,
    /// Retirement starts above this fraction of the allocation cap.
    pub high_water_fraction: f64,
    /// Retirement stops below this fraction of the allocation cap.
    pub low_water_fraction: f64,
    /// Concurrent lower-tier writes the flusher may keep in flight.
    pub flush_in_flight_limit: u32,
    /// Bytes of lower-tier writes the flusher may keep in flight.
    pub flush_bytes_limit: u64,
    /// Slot appends performed per ring transaction.
    pub append_batch: usize,
    /// Payload buffers flushed per drain.
    pub flush_batch: usize,
    /// Entries freed per retirement transaction.
    pub frees_per_tx: usize,
    /// Wall-clock budget of one retirement pass.
    pub retire_time_limit: Duration,
    /// Writes that roll the current sync point over.
    pub max_writes_per_sync_point: u64,
    /// Bytes that roll the current sync point over.
    pub max_bytes_per_sync_point: u64,
    /// Clamp on the derived ring slot count.
    pub max_log_entries: u32,
    /// Concurrency permits for the outbound pipeline.
    pub lanes: u32,
    /// Worker threads in the pool.
    pub worker_threads: usize,
    /// Periodic stats logging, if set.
    pub stats_interval: Option<Duration>,
    /// Reject all mutating requests at ingress.
    pub read_only: bool,
}

impl CacheConfig {
    #[must_use]
    pub fn new(pool_path: impl Into<PathBuf>) -> Self {
        Self {
            pool_path: pool_path.into(),
            pool_size: 64 * 1024 * 1024,
            persist_on_write_until_flush: true,
            usable_fraction: 0.9,
            high_water_fraction: 0.5,
            low_water_fraction: 0.4,
            flush_in_flight_limit: 64,
            flush_bytes_limit: 1024 * 1024,
            append_batch: 8,
            flush_batch: 4,
            frees_per_tx: 8,
            retire_time_limit: Duration::from_millis(250),
            max_writes_per_sync_point: 256,
            max_bytes_per_sync_point: 8 * 1024 * 1024,
            max_log_entries: 1024 * 1024,
            lanes: 256,
            worker_threads: 4,
            stats_interval: None,
            read_only: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.usable_fraction > 0.0 && self.usable_fraction <= 1.0) {
            return Err(PwlError::Format(format!(
                "usable_fraction {} outside (0, 1]",
                self.usable_fraction
            )));
        }
        if !(self.low_water_fraction > 0.0
            && self.low_water_fraction < self.high_water_fraction
            && self.high_water_fraction <= 1.0)
        {
            return Err(PwlError::Format(
                "watermarks must satisfy 0 < low < high <= 1".to_owned(),
            ));
        }
        if self.append_batch == 0 || self.flush_batch == 0 || self.frees_per_tx == 0 {
            return Err(PwlError::Format("batch sizes must be > 0".to_owned()));
        }
        if self.max_writes_per_sync_point == 0 || self.max_bytes_per_sync_point == 0 {
            return Err(PwlError::Format(
                "sync point limits must be > 0".to_owned(),
            ));
        }
        if self.lanes == 0 {
            return Err(PwlError::Format("lanes must be > 0".to_owned()));
        }
        if self.max_log_entries < 3 {
            return Err(PwlError::Format("max_log_entries must be >= 3".to_owned()));
        }
        Ok(())
    }
}

// ── Lower tier ──────────────────────────────────────────────────────────────

/// The block layer below the cache. Calls are synchronous and issued
/// from worker threads; no cache lock is held across them.
pub trait LowerTier: Send + Sync {
    fn init(&self, _cx: &Cx) -> Result<()> {
        Ok(())
    }

    fn shut_down(&self, _cx: &Cx) -> Result<()> {
        Ok(())
    }

    /// Read the extents, returning their bytes concatenated in order.
    fn read(&self, cx: &Cx, extents: &[ImageExtent]) -> Result<Vec<u8>>;

    fn write(&self, cx: &Cx, extent: ImageExtent, data: &[u8]) -> Result<()>;

    fn discard(&self, cx: &Cx, offset: u64, len: u64, skip_partial: bool) -> Result<()>;

    fn flush(&self, cx: &Cx) -> Result<()>;

    fn invalidate(&self, cx: &Cx) -> Result<()>;
}

// ── State ───────────────────────────────────────────────────────────────────

pub(crate) struct CacheState {
    pub first_free_entry: u32,
    pub first_valid_entry: u32,
    pub total_log_entries: u32,
    pub free_log_entries: u32,
    pub free_lanes: u32,
    pub bytes_allocated: u64,
    pub bytes_cached: u64,
    pub bytes_dirty: u64,
    pub bytes_allocated_cap: u64,
    pub unpublished_reserves: u32,
    pub alloc_failed_since_retire: bool,
    pub current_sync_gen: SyncGen,
    pub current_sync_point: Option<Arc<SyncPoint>>,
    pub last_op_sequence: u64,
    pub persist_on_flush: bool,
    pub flush_seen: bool,
    /// All appended entries in ring order.
    pub log_entries: VecDeque<LogEntry>,
    /// Completed entries awaiting writeback, oldest first.
    pub dirty_log_entries: VecDeque<LogEntry>,
    pub ops_to_flush: VecDeque<LogOperation>,
    pub ops_to_append: VecDeque<LogOperation>,
    pub appending: bool,
    pub deferred_ios: VecDeque<IoRequest>,
    pub dispatching_deferred: bool,
    pub flush_ops_in_flight: u32,
    pub flush_bytes_in_flight: u64,
    pub lowest_flushing_sync_gen: SyncGen,
    pub flush_complete_contexts: Vec<Completion>,
    pub invalidating: bool,
    pub shutting_down: bool,
    pub wake_up_requested: bool,
    pub wake_up_scheduled: bool,
    pub wake_up_enabled: bool,
}

pub(crate) struct CacheInner {
    pub(crate) config: CacheConfig,
    pub(crate) pool: LogPool,
    pub(crate) lower: Arc<dyn LowerTier>,
    pub(crate) guard: BlockGuard,
    pub(crate) map: WriteLogMap,
    pub(crate) workers: WorkerPool,
    pub(crate) tracker: AsyncOpTracker,
    // Lock order, top-down; taking them out of order is a bug.
    pub(crate) log_retire_lock: Mutex<()>,
    pub(crate) entry_reader_lock: RwLock<()>,
    pub(crate) deferred_dispatch_lock: Mutex<()>,
    pub(crate) log_append_lock: Mutex<()>,
    pub(crate) state: Mutex<CacheState>,
    stats_stop: Arc<AtomicBool>,
    stats_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Point-in-time counters for observability and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub current_sync_gen: u64,
    pub first_valid_entry: u32,
    pub first_free_entry: u32,
    pub free_log_entries: u32,
    pub log_entries: usize,
    pub dirty_log_entries: usize,
    pub deferred_ios: usize,
    pub bytes_allocated: u64,
    pub bytes_cached: u64,
    pub bytes_dirty: u64,
    pub free_lanes: u32,
    pub map_entries: usize,
    pub persist_on_flush: bool,
}

// ── Cache ───────────────────────────────────────────────────────────────────

/// The write-back log cache. Cheap to clone handles are not provided;
/// share it behind an `Arc` if needed.
pub struct WriteLogCache {
    inner: Arc<CacheInner>,
}

impl WriteLogCache {
    /// Create or reopen the pool, replay any existing log, and start
    /// background machinery.
    pub fn open(cx: &Cx, config: CacheConfig, lower: Arc<dyn LowerTier>) -> Result<Self> {
        config.validate()?;
        lower.init(cx)?;

        let pool_size = config.pool_size.max(MIN_POOL_SIZE);
        let exists = config.pool_path.exists();
        let pool = if exists {
            LogPool::open(cx, &config.pool_path)?
        } else {
            LogPool::create(
                cx,
                &config.pool_path,
                pool_size,
                config.usable_fraction,
                config.max_log_entries,
            )?
        };
        let root = pool.root();
        if root.block_size != MIN_ALLOC {
            return Err(PwlError::Layout {
                field: "block_size",
                expected: MIN_ALLOC,
                actual: root.block_size,
            });
        }

        let total = root.num_slots;
        // One slot is always kept empty, so an empty ring has n-1 free.
        let free_log_entries = if root.first_free_entry < root.first_valid_entry {
            total - (root.first_valid_entry - root.first_free_entry) - 1
        } else {
            total - (root.first_free_entry - root.first_valid_entry) - 1
        };
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bytes_allocated_cap = (root.pool_size as f64 * config.usable_fraction) as u64;

        let state = CacheState {
            first_free_entry: root.first_free_entry,
            first_valid_entry: root.first_valid_entry,
            total_log_entries: total,
            free_log_entries,
            free_lanes: config.lanes,
            bytes_allocated: 0,
            bytes_cached: 0,
            bytes_dirty: 0,
            bytes_allocated_cap,
            unpublished_reserves: 0,
            alloc_failed_since_retire: false,
            current_sync_gen: SyncGen(0),
            current_sync_point: None,
            last_op_sequence: 0,
            persist_on_flush: false,
            flush_seen: false,
            log_entries: VecDeque::new(),
            dirty_log_entries: VecDeque::new(),
            ops_to_flush: VecDeque::new(),
            ops_to_append: VecDeque::new(),
            appending: false,
            deferred_ios: VecDeque::new(),
            dispatching_deferred: false,
            flush_ops_in_flight: 0,
            flush_bytes_in_flight: 0,
            lowest_flushing_sync_gen: SyncGen(0),
            flush_complete_contexts: Vec::new(),
            invalidating: false,
            shutting_down: false,
            wake_up_requested: false,
            wake_up_scheduled: false,
            wake_up_enabled: true,
        };

        let worker_threads = config.worker_threads;
        let inner = Arc::new(CacheInner {
            config,
            pool,
            lower,
            guard: BlockGuard::new(),
            map: WriteLogMap::new(),
            workers: WorkerPool::new(worker_threads),
            tracker: AsyncOpTracker::new(),
            log_retire_lock: Mutex::new(()),
            entry_reader_lock: RwLock::new(()),
            deferred_dispatch_lock: Mutex::new(()),
            log_append_lock: Mutex::new(()),
            state: Mutex::new(state),
            stats_stop: Arc::new(AtomicBool::new(false)),
            stats_thread: Mutex::new(None),
        });

        {
            let mut later = DeferredWork::new();
            let mut state = inner.state.lock();
            if exists {
                if let Err(err) = inner.load_existing_entries(cx, &mut state, &mut later) {
                    drop(state);
                    later.cancel();
                    inner.workers.shutdown();
                    return Err(err);
                }
            }
            // Start the sync point following the last one seen in the
            // log; flush the one replay (or a fresh pool) left current.
            inner.init_flush_new_sync_point(&mut state, &mut later);
            drop(state);
            // `later` drops here: activations run with no lock held.
        }

        inner.start_stats_thread();
        {
            let state = inner.state.lock();
            info!(
                target: "pwl::cache",
                event = "cache_opened",
                pool = %inner.pool.path().display(),
                total_log_entries = state.total_log_entries,
                free_log_entries = state.free_log_entries,
                first_valid = state.first_valid_entry,
                first_free = state.first_free_entry,
                replayed = state.log_entries.len()
            );
        }
        Ok(Self {
            inner: Arc::clone(&inner),
        })
    }

    pub fn aio_write(
        &self,
        cx: &Cx,
        image_extents: Vec<ImageExtent>,
        data: Vec<u8>,
        on_finish: Completion,
    ) {
        self.inner.aio_write(cx, image_extents, data, on_finish);
    }

    pub fn aio_read(&self, cx: &Cx, image_extents: Vec<ImageExtent>, on_finish: ReadCompletion) {
        self.inner.aio_read(cx, image_extents, on_finish);
    }

    /// Client flush: completes when every prior completed write is
    /// persistent in the log. Passes through the guard as a barrier.
    pub fn aio_flush(&self, cx: &Cx, on_finish: Completion) {
        self.inner.aio_flush(cx, on_finish);
    }

    /// Internal flush: completes when nothing is dirty or in flight to
    /// the lower tier.
    pub fn flush(&self, _cx: &Cx, on_finish: Completion) {
        self.inner.flush_internal(on_finish);
    }

    /// Discard a region: drain the log, then forward below.
    pub fn aio_discard(
        &self,
        cx: &Cx,
        offset: u64,
        len: u64,
        skip_partial: bool,
        on_finish: Completion,
    ) {
        self.inner.aio_discard(cx, offset, len, skip_partial, on_finish);
    }

    /// Write a repeated pattern through the cache.
    pub fn aio_writesame(
        &self,
        cx: &Cx,
        offset: u64,
        len: u64,
        pattern: Vec<u8>,
        on_finish: Completion,
    ) {
        self.inner.aio_writesame(cx, offset, len, pattern, on_finish);
    }

    /// Compare `cmp` against current data; on match, dispatch the write.
    pub fn aio_compare_and_write(
        &self,
        cx: &Cx,
        image_extents: Vec<ImageExtent>,
        cmp: Vec<u8>,
        data: Vec<u8>,
        on_finish: CompareCompletion,
    ) {
        self.inner
            .aio_compare_and_write(cx, image_extents, cmp, data, on_finish);
    }

    /// Drop the entire cache contents. Unflushed writes are discarded;
    /// flush first to keep them.
    pub fn invalidate(&self, _cx: &Cx, on_finish: Completion) {
        self.inner.invalidate(on_finish);
    }

    /// Drain and close: quiesce, flush everything dirty, retire the
    /// whole ring, stop the machinery, close the pool and the tier
    /// below.
    pub fn shut_down(&self, cx: &Cx) -> Result<()> {
        self.inner.shut_down(cx)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

// ── Control surface ─────────────────────────────────────────────────────────

fn whole_volume_extent() -> BlockExtent {
    BlockExtent {
        start: 0,
        end: u64::MAX - 1,
    }
}

impl CacheInner {
    pub(crate) fn queue_tracked(self: &Arc<Self>, task: impl FnOnce() + Send + 'static) {
        self.tracker.start_op();
        let cache = Arc::clone(self);
        let accepted = self.workers.queue(move || {
            task();
            cache.tracker.finish_op();
        });
        if !accepted {
            self.tracker.finish_op();
        }
    }

    fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            current_sync_gen: state.current_sync_gen.0,
            first_valid_entry: state.first_valid_entry,
            first_free_entry: state.first_free_entry,
            free_log_entries: state.free_log_entries,
            log_entries: state.log_entries.len(),
            dirty_log_entries: state.dirty_log_entries.len(),
            deferred_ios: state.deferred_ios.len(),
            bytes_allocated: state.bytes_allocated,
            bytes_cached: state.bytes_cached,
            bytes_dirty: state.bytes_dirty,
            free_lanes: state.free_lanes,
            map_entries: self.map.len(),
            persist_on_flush: state.persist_on_flush,
        }
    }

    /// Schedule deferred processing: retirement, deferred dispatch and
    /// writeback. Requested-while-scheduled coalesces into one run.
    pub(crate) fn wake_up(self: &Arc<Self>, state: &mut CacheState) {
        if !state.wake_up_enabled {
            return;
        }
        if state.wake_up_requested && state.wake_up_scheduled {
            return;
        }
        state.wake_up_requested = true;
        if state.wake_up_scheduled {
            return;
        }
        state.wake_up_scheduled = true;
        let cache = Arc::clone(self);
        self.queue_tracked(move || cache.process_work());
    }

    fn process_work(self: &Arc<Self>) {
        let mut max_iterations = 4;
        loop {
            {
                self.state.lock().wake_up_requested = false;
            }

            let (high_water, low_water, should_retire) = {
                let state = self.state.lock();
                #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let high =
                    (state.bytes_allocated_cap as f64 * self.config.high_water_fraction) as u64;
                #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let low =
                    (state.bytes_allocated_cap as f64 * self.config.low_water_fraction) as u64;
                let should = state.alloc_failed_since_retire
                    || state.shutting_down
                    || state.invalidating
                    || state.bytes_allocated > high;
                (high, low, should)
            };

            if should_retire {
                let started = Instant::now();
                let mut retired_batches = 0_u32;
                loop {
                    let keep_retiring = {
                        let state = self.state.lock();
                        state.alloc_failed_since_retire
                            || state.shutting_down
                            || state.invalidating
                            || state.bytes_allocated > high_water
                            || (state.bytes_allocated > low_water
                                && started.elapsed() < self.config.retire_time_limit)
                    };
                    if !keep_retiring {
                        break;
                    }
                    match self.retire_entries(self.config.frees_per_tx) {
                        Ok(true) => {
                            retired_batches += 1;
                            self.dispatch_deferred_ios();
                            self.process_writeback_dirty_entries();
                        }
                        Ok(false) => break,
                        Err(err) => {
                            error!(
                                target: "pwl::cache::retire",
                                event = "retire_failed",
                                error = %err
                            );
                            break;
                        }
                    }
                }
                if retired_batches > 0 {
                    debug!(
                        target: "pwl::cache::retire",
                        event = "retire_pass_done",
                        batches = retired_batches
                    );
                }
            }

            self.dispatch_deferred_ios();
            self.process_writeback_dirty_entries();

            let again = self.state.lock().wake_up_requested;
            max_iterations -= 1;
            if !(again && max_iterations > 0) {
                break;
            }
        }

        let mut state = self.state.lock();
        state.wake_up_scheduled = false;
        if state.wake_up_requested {
            self.wake_up(&mut state);
        }
    }

    /// Client flush. See `WriteLogCache::aio_flush`.
    pub(crate) fn aio_flush(self: &Arc<Self>, cx: &Cx, on_finish: Completion) {
        if cx.checkpoint().is_err() {
            on_finish(-libc::ECANCELED);
            return;
        }
        if self.config.read_only {
            on_finish(-libc::EROFS);
            return;
        }

        let flush_req = FlushRequest::new(false, on_finish);
        let cache = Arc::clone(self);
        let request = GuardedRequest::barrier(
            whole_volume_extent(),
            Box::new(move |cell, _detained| {
                {
                    let mut later = DeferredWork::new();
                    let mut state = cache.state.lock();

                    if !state.flush_seen {
                        state.flush_seen = true;
                        if !state.persist_on_flush && cache.config.persist_on_write_until_flush {
                            state.persist_on_flush = true;
                            info!(target: "pwl::cache", event = "now_persisting_on_flush");
                        }
                    }

                    let current = state
                        .current_sync_point
                        .as_ref()
                        .expect("flush before initialization")
                        .clone();
                    if current.log_entry.writes() > 0 {
                        // Writes since the last sync point: roll over and
                        // complete this flush when the previous point
                        // persists.
                        cache.flush_new_sync_point(Some(flush_req), &mut state, &mut later);
                    } else if let Some(earlier) = current.earlier() {
                        // No new writes, but the previous sync point has
                        // not completed yet.
                        debug_assert!(earlier.append_scheduled());
                        let req = Arc::clone(&flush_req);
                        earlier.push_on_persisted(Box::new(move |status| {
                            req.complete_user(status);
                        }));
                    } else {
                        // Nothing outstanding at all.
                        let req = Arc::clone(&flush_req);
                        later.add(move || req.complete_user(0));
                    }
                    drop(state);
                }
                // The flush waits; subsequent writes proceed.
                cache.release_guard_cell(cell);
            }),
        );
        if let Some(ready) = self.guard.detain(request) {
            ready.fire();
        }
    }

    /// Whole-volume invalidate. See `WriteLogCache::invalidate`.
    pub(crate) fn invalidate(self: &Arc<Self>, on_finish: Completion) {
        let cache = Arc::clone(self);
        let request = GuardedRequest::barrier(
            whole_volume_extent(),
            Box::new(move |cell, _detained| {
                info!(target: "pwl::cache", event = "invalidate_begin");

                // Last step: clear the flag, complete, release the cell.
                let finish_cache = Arc::clone(&cache);
                let finish: Completion = Box::new(move |status| {
                    {
                        let mut state = finish_cache.state.lock();
                        state.invalidating = false;
                        debug_assert!(state.log_entries.is_empty());
                        debug_assert!(state.dirty_log_entries.is_empty());
                    }
                    info!(target: "pwl::cache", event = "invalidate_done", status);
                    on_finish(status);
                    finish_cache.release_guard_cell(cell);
                });

                // Retire everything, then invalidate the tier below.
                let retire_cache = Arc::clone(&cache);
                let retire_step: Completion = Box::new(move |status| {
                    if status < 0 {
                        finish(status);
                        return;
                    }
                    loop {
                        match retire_cache.retire_entries(retire_cache.config.frees_per_tx) {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(err) => {
                                finish(-err.to_errno());
                                return;
                            }
                        }
                    }
                    let cx = background_cx();
                    let result = retire_cache.lower.invalidate(&cx);
                    finish(status_code(&result));
                });

                // With `invalidating` set the flush discards dirty
                // entries without writing them below.
                let flush_cache = Arc::clone(&cache);
                let flush_step: Completion = Box::new(move |status| {
                    if status < 0 {
                        retire_step(status);
                        return;
                    }
                    flush_cache.flush_internal(retire_step);
                });

                let mut later = DeferredWork::new();
                let mut state = cache.state.lock();
                state.invalidating = true;
                // Leave a sync point as the last entry so a reopen
                // resumes cleanly.
                let flush_req = FlushRequest::new(true, flush_step);
                cache.flush_new_sync_point(Some(flush_req), &mut state, &mut later);
                drop(state);
            }),
        );
        if let Some(ready) = self.guard.detain(request) {
            ready.fire();
        }
    }

    /// Discard: drain the log, then forward below. The invalidation of
    /// the region is the flush itself; selective invalidate entries are
    /// not supported.
    pub(crate) fn aio_discard(
        self: &Arc<Self>,
        cx: &Cx,
        offset: u64,
        len: u64,
        skip_partial: bool,
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
        let Ok(extent) = ImageExtent::new(offset, len) else {
            on_finish(-libc::EINVAL);
            return;
        };

        let cache = Arc::clone(self);
        let request = GuardedRequest::new(
            extent.block_extent(),
            Box::new(move |cell, _detained| {
                let flush_cache = Arc::clone(&cache);
                cache.flush_internal(Box::new(move |status| {
                    if status < 0 {
                        on_finish(status);
                        flush_cache.release_guard_cell(cell);
                        return;
                    }
                    let discard_cache = Arc::clone(&flush_cache);
                    flush_cache.queue_tracked(move || {
                        let cx = background_cx();
                        let result = discard_cache.lower.discard(&cx, offset, len, skip_partial);
                        on_finish(status_code(&result));
                        discard_cache.release_guard_cell(cell);
                    });
                }));
            }),
        );
        if let Some(ready) = self.guard.detain(request) {
            ready.fire();
        }
    }

    /// Expand the pattern and dispatch it through the write path.
    pub(crate) fn aio_writesame(
        self: &Arc<Self>,
        cx: &Cx,
        offset: u64,
        len: u64,
        pattern: Vec<u8>,
        on_finish: Completion,
    ) {
        if pattern.is_empty() || len == 0 || len % pattern.len() as u64 != 0 {
            on_finish(-libc::EINVAL);
            return;
        }
        let mut payload = Vec::with_capacity(len as usize);
        while (payload.len() as u64) < len {
            payload.extend_from_slice(&pattern);
        }
        let Ok(extent) = ImageExtent::new(offset, len) else {
            on_finish(-libc::EINVAL);
            return;
        };
        self.aio_write(cx, vec![extent], payload, on_finish);
    }

    /// Read through the cache, compare, and write on match.
    pub(crate) fn aio_compare_and_write(
        self: &Arc<Self>,
        cx: &Cx,
        image_extents: Vec<ImageExtent>,
        cmp: Vec<u8>,
        data: Vec<u8>,
        on_finish: CompareCompletion,
    ) {
        let cache = Arc::clone(self);
        let write_extents = image_extents.clone();
        self.aio_read(
            cx,
            image_extents,
            Box::new(move |status, bytes| {
                if status < 0 {
                    on_finish(status, None);
                    return;
                }
                if bytes != cmp {
                    let mismatch = bytes
                        .iter()
                        .zip(&cmp)
                        .position(|(have, want)| have != want)
                        .unwrap_or(0) as u64;
                    on_finish(-libc::EILSEQ, Some(mismatch));
                    return;
                }
                let cx = background_cx();
                cache.aio_write(
                    &cx,
                    write_extents,
                    data,
                    Box::new(move |status| on_finish(status, None)),
                );
            }),
        );
    }

    /// Synchronous internal flush used by shutdown.
    fn flush_sync(self: &Arc<Self>) -> Result<()> {
        let done = Arc::new((Mutex::new(None::<i32>), parking_lot::Condvar::new()));
        let signal = Arc::clone(&done);
        self.flush_internal(Box::new(move |status| {
            let (lock, condvar) = &*signal;
            *lock.lock() = Some(status);
            condvar.notify_all();
        }));
        let (lock, condvar) = &*done;
        let mut status = lock.lock();
        while status.is_none() {
            condvar.wait(&mut status);
        }
        let status = status.expect("flush status set");
        if status == 0 {
            Ok(())
        } else {
            Err(PwlError::Io(std::io::Error::from_raw_os_error(-status)))
        }
    }

    /// Orderly shutdown. See `WriteLogCache::shut_down`.
    pub(crate) fn shut_down(self: &Arc<Self>, cx: &Cx) -> Result<()> {
        info!(target: "pwl::cache", event = "shutdown_begin");

        // Ingress has quiesced (caller's contract); wait for what's in
        // flight.
        self.tracker.wait_idle();
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
        }

        // Flush everything dirty to the lower tier and wait.
        self.flush_sync()?;
        self.tracker.wait_idle();

        {
            let mut state = self.state.lock();
            state.wake_up_enabled = false;
        }

        // Retire the whole ring.
        while self.retire_entries(self.config.frees_per_tx)? {}

        {
            let state = self.state.lock();
            debug_assert!(state.dirty_log_entries.is_empty());
            debug_assert!(state.log_entries.is_empty());
            debug_assert!(state.deferred_ios.is_empty());
            debug_assert_eq!(state.unpublished_reserves, 0);
            if !state.log_entries.is_empty() {
                warn!(
                    target: "pwl::cache",
                    event = "shutdown_with_live_entries",
                    entries = state.log_entries.len()
                );
            }
        }
        debug_assert!(self.map.is_empty());

        self.stop_stats_thread();
        self.workers.shutdown();
        self.pool.drain(cx)?;
        self.lower.shut_down(cx)?;
        info!(target: "pwl::cache", event = "shutdown_complete");
        Ok(())
    }

    // ── Periodic stats ──────────────────────────────────────────────────

    fn start_stats_thread(self: &Arc<Self>) {
        let Some(interval) = self.config.stats_interval else {
            return;
        };
        let cache = Arc::clone(self);
        let stop = Arc::clone(&self.stats_stop);
        let handle = std::thread::Builder::new()
            .name("pwl-stats".to_owned())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let stats = cache.stats();
                    info!(
                        target: "pwl::cache::stats",
                        event = "periodic_stats",
                        free_log_entries = stats.free_log_entries,
                        log_entries = stats.log_entries,
                        dirty_log_entries = stats.dirty_log_entries,
                        deferred_ios = stats.deferred_ios,
                        bytes_allocated = stats.bytes_allocated,
                        bytes_cached = stats.bytes_cached,
                        bytes_dirty = stats.bytes_dirty,
                        free_lanes = stats.free_lanes
                    );
                }
            })
            .expect("failed to spawn stats thread");
        *self.stats_thread.lock() = Some(handle);
    }

    fn stop_stats_thread(&self) {
        self.stats_stop.store(true, Ordering::Release);
        if let Some(handle) = self.stats_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for WriteLogCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("WriteLogCache").field("stats", &stats).finish()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
