//! Log operations: the units queued through the append pipeline.
//!
//! A write request becomes a [`WriteOpSet`] carrying one
//! [`WriteOperation`] per image extent; an `aio_flush` (or internal
//! rollover) becomes a [`SyncPointOperation`]. Both move through the
//! same two append stages.

use crate::sync_point::SyncPoint;
use crate::util::{Completion, Gather, GatherSub};
use parking_lot::Mutex;
use pwl_log::{LogEntry, SyncPointLogEntry, WriteLogEntry};
use pwl_pmem::PmemBuffer;
use pwl_types::ImageExtent;
use std::sync::Arc;

/// One extent's worth of a write request.
pub(crate) struct WriteOperation {
    pub log_entry: Arc<WriteLogEntry>,
    pub buffer: Arc<PmemBuffer>,
    state: Mutex<WriteOpState>,
}

struct WriteOpState {
    on_append: Option<GatherSub>,
    on_persist: Option<GatherSub>,
}

impl WriteOperation {
    fn new(
        set: &WriteOpSet,
        sync_point_entry: &Arc<SyncPointLogEntry>,
        extent: ImageExtent,
        buffer: Arc<PmemBuffer>,
    ) -> Arc<Self> {
        let log_entry = WriteLogEntry::new(
            Some(Arc::clone(sync_point_entry)),
            extent.offset,
            extent.len,
        );
        log_entry.set_buffer(Arc::clone(&buffer));
        sync_point_entry.note_write(extent.len);
        Arc::new(Self {
            log_entry,
            buffer,
            state: Mutex::new(WriteOpState {
                on_append: Some(set.extent_ops_appending.new_sub()),
                on_persist: Some(set.extent_ops_persist.new_sub()),
            }),
        })
    }

    /// The op's log position is guaranteed: wake the appending sub.
    pub fn appending(&self) {
        let sub = self.state.lock().on_append.take();
        if let Some(sub) = sub {
            sub.complete(0);
        }
    }

    /// The op's slot is durable (or the batch failed).
    pub fn complete(&self, status: i32) {
        self.appending();
        let sub = self.state.lock().on_persist.take();
        if let Some(sub) = sub {
            sub.complete(status);
        }
    }
}

impl std::fmt::Debug for WriteOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteOperation")
            .field("image_offset", &self.log_entry.image_offset)
            .field("write_bytes", &self.log_entry.write_bytes)
            .finish()
    }
}

/// The append of a sync-point slot.
pub(crate) struct SyncPointOperation {
    pub sync_point: Arc<SyncPoint>,
}

impl SyncPointOperation {
    pub fn new(sync_point: Arc<SyncPoint>) -> Arc<Self> {
        Arc::new(Self { sync_point })
    }
}

impl std::fmt::Debug for SyncPointOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPointOperation")
            .field("sync_gen", &self.sync_point.sync_gen().0)
            .finish()
    }
}

/// Either kind of operation in the append pipeline.
#[derive(Clone, Debug)]
pub(crate) enum LogOperation {
    Write(Arc<WriteOperation>),
    SyncPoint(Arc<SyncPointOperation>),
}

impl LogOperation {
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write(_))
    }

    pub fn log_entry(&self) -> LogEntry {
        match self {
            Self::Write(op) => LogEntry::Write(Arc::clone(&op.log_entry)),
            Self::SyncPoint(op) => LogEntry::SyncPoint(Arc::clone(&op.sync_point.log_entry)),
        }
    }

    /// Entered the appending state (queued in order for stage B).
    pub fn appending(&self) {
        match self {
            Self::Write(op) => op.appending(),
            Self::SyncPoint(op) => op.sync_point.appending(),
        }
    }
}

/// All operations of one write request, with the completion wiring that
/// chains them into the current sync point.
pub(crate) struct WriteOpSet {
    pub operations: Vec<Arc<WriteOperation>>,
    pub sync_point: Arc<SyncPoint>,
    pub persist_on_flush: bool,
    /// Fires when every op of the set has entered the appending state.
    pub extent_ops_appending: Arc<Gather>,
    /// Fires when every op of the set is durable; finisher completes the
    /// write request.
    pub extent_ops_persist: Arc<Gather>,
}

impl WriteOpSet {
    /// Build the set and its gather wiring.
    ///
    /// `on_set_persisted` is the write request completion; it runs when
    /// all extents are durable. The sync point's
    /// `prior_entries_persisted` gather holds one sub completed when the
    /// whole set reaches the appending state.
    pub fn new(
        sync_point: Arc<SyncPoint>,
        persist_on_flush: bool,
        extents: &[ImageExtent],
        buffers: &[Arc<PmemBuffer>],
        on_set_persisted: Completion,
    ) -> Self {
        debug_assert_eq!(extents.len(), buffers.len());

        let on_ops_appending = sync_point.prior_entries_persisted.new_sub();

        let extent_ops_persist = Gather::new();
        extent_ops_persist.set_finisher(on_set_persisted);

        let appending_persist_sub = extent_ops_persist.new_sub();
        let extent_ops_appending = Gather::new();
        extent_ops_appending.set_finisher(Box::new(move |status| {
            on_ops_appending.complete(status);
            appending_persist_sub.complete(status);
        }));

        let mut set = Self {
            operations: Vec::with_capacity(extents.len()),
            sync_point,
            persist_on_flush,
            extent_ops_appending,
            extent_ops_persist,
        };
        for (extent, buffer) in extents.iter().zip(buffers) {
            let op = WriteOperation::new(
                &set,
                &set.sync_point.log_entry,
                *extent,
                Arc::clone(buffer),
            );
            set.operations.push(op);
        }

        // All subs acquired.
        set.extent_ops_appending.activate();
        set.extent_ops_persist.activate();
        set
    }

    pub fn log_operations(&self) -> Vec<LogOperation> {
        self.operations
            .iter()
            .map(|op| LogOperation::Write(Arc::clone(op)))
            .collect()
    }

    pub fn write_entries(&self) -> Vec<Arc<WriteLogEntry>> {
        self.operations
            .iter()
            .map(|op| Arc::clone(&op.log_entry))
            .collect()
    }
}

impl std::fmt::Debug for WriteOpSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteOpSet")
            .field("operations", &self.operations.len())
            .field("sync_gen", &self.sync_point.sync_gen().0)
            .field("persist_on_flush", &self.persist_on_flush)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pwl_types::SyncGen;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn test_buffers(count: usize) -> Vec<Arc<PmemBuffer>> {
        // Buffers only need offsets/lengths for these tests; fabricate
        // them through a throwaway pool.
        let cx = asupersync::Cx::for_testing();
        let dir = tempfile::tempdir().unwrap();
        let pool = pwl_pmem::LogPool::create(
            &cx,
            dir.path().join("ops.pool"),
            pwl_pmem::MIN_POOL_SIZE,
            0.9,
            16,
        )
        .unwrap();
        (0..count)
            .map(|_| pool.reserve(pwl_pmem::MIN_ALLOC).unwrap())
            .collect()
    }

    #[test]
    fn set_completion_requires_appending_and_all_persists() {
        let sync_point = SyncPoint::new(SyncGen(1));

        let extents = [
            ImageExtent::new(0, 4096).unwrap(),
            ImageExtent::new(8192, 4096).unwrap(),
        ];
        let buffers = test_buffers(2);
        let status = Arc::new(AtomicI32::new(i32::MIN));
        let status_clone = Arc::clone(&status);
        let set = WriteOpSet::new(
            Arc::clone(&sync_point),
            false,
            &extents,
            &buffers,
            Box::new(move |code| {
                status_clone.store(code, Ordering::SeqCst);
            }),
        );

        assert_eq!(set.sync_point.log_entry.writes(), 2);
        assert_eq!(set.sync_point.log_entry.bytes(), 8192);

        set.operations[0].complete(0);
        assert_eq!(status.load(Ordering::SeqCst), i32::MIN);
        set.operations[1].complete(0);
        assert_eq!(status.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn first_error_reaches_set_completion() {
        let sync_point = SyncPoint::new(SyncGen(1));

        let extents = [ImageExtent::new(0, 4096).unwrap()];
        let buffers = test_buffers(1);
        let status = Arc::new(AtomicI32::new(0));
        let status_clone = Arc::clone(&status);
        let set = WriteOpSet::new(
            Arc::clone(&sync_point),
            false,
            &extents,
            &buffers,
            Box::new(move |code| {
                status_clone.store(code, Ordering::SeqCst);
            }),
        );
        set.operations[0].complete(-libc::EIO);
        assert_eq!(status.load(Ordering::SeqCst), -libc::EIO);
    }
}
