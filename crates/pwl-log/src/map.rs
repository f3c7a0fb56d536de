//! Block-to-entry map.
//!
//! Maps block extents to the write log entries currently covering them.
//! The map never contains overlapping extents: adding an entry rewrites
//! any older overlap first (removed when fully covered, shrunk when
//! covered on one side, split in two when covered in the middle). Every
//! map entry holds a reference on its write entry, counted in
//! `referring_map_entries`; a split adds one net reference.

use crate::WriteLogEntry;
use parking_lot::RwLock;
use pwl_types::BlockExtent;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// One mapping from a block extent to (a portion of) a write entry.
#[derive(Debug, Clone)]
pub struct MapEntry {
    pub block_extent: BlockExtent,
    pub entry: Arc<WriteLogEntry>,
}

/// Ordered, non-overlapping block-extent → write-entry map.
///
/// Shared on query (reads enumerate overlaps under the read lock),
/// exclusive on mutate.
#[derive(Debug, Default)]
pub struct WriteLogMap {
    /// Keyed by extent start. Non-overlap makes start a unique key and
    /// keeps both starts and ends sorted.
    inner: RwLock<BTreeMap<u64, MapEntry>>,
}

impl WriteLogMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a write entry, replacing any overlapping older coverage.
    pub fn add_entry(&self, entry: &Arc<WriteLogEntry>) {
        let mut inner = self.inner.write();
        Self::add_locked(&mut inner, entry);
    }

    /// Add several entries under one write lock (one write request's
    /// extents land atomically with respect to readers).
    pub fn add_entries(&self, entries: &[Arc<WriteLogEntry>]) {
        let mut inner = self.inner.write();
        for entry in entries {
            Self::add_locked(&mut inner, entry);
        }
    }

    /// Remove every map entry that refers to `entry`.
    pub fn remove_entry(&self, entry: &Arc<WriteLogEntry>) {
        let mut inner = self.inner.write();
        let overlaps = Self::overlapping_starts(&inner, entry.block_extent());
        for start in overlaps {
            let hit = inner
                .get(&start)
                .is_some_and(|map_entry| Arc::ptr_eq(&map_entry.entry, entry));
            if hit {
                Self::remove_locked(&mut inner, start);
            }
        }
    }

    /// Ordered map entries overlapping `extent`.
    #[must_use]
    pub fn find_map_entries(&self, extent: BlockExtent) -> Vec<MapEntry> {
        let inner = self.inner.read();
        Self::overlapping_starts(&inner, extent)
            .into_iter()
            .map(|start| inner[&start].clone())
            .collect()
    }

    /// Write entries overlapping `extent`. An entry appears once per
    /// referring map entry, so splits produce duplicates.
    #[must_use]
    pub fn find_log_entries(&self, extent: BlockExtent) -> Vec<Arc<WriteLogEntry>> {
        self.find_map_entries(extent)
            .into_iter()
            .map(|map_entry| map_entry.entry)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    // ── Locked internals ────────────────────────────────────────────────

    /// Starts of all entries overlapping `extent`, in address order.
    ///
    /// Entries are non-overlapping and keyed by start, so both starts and
    /// ends are sorted; the overlaps form a contiguous run at the tail of
    /// the entries whose start is ≤ `extent.end`.
    fn overlapping_starts(inner: &BTreeMap<u64, MapEntry>, extent: BlockExtent) -> Vec<u64> {
        let mut starts: Vec<u64> = inner
            .range(..=extent.end)
            .rev()
            .take_while(|(_, map_entry)| map_entry.block_extent.end >= extent.start)
            .map(|(start, _)| *start)
            .collect();
        starts.reverse();
        starts
    }

    fn add_locked(inner: &mut BTreeMap<u64, MapEntry>, entry: &Arc<WriteLogEntry>) {
        let new_extent = entry.block_extent();
        trace!(target: "pwl::log::map", event = "map_add", extent = %new_extent);

        for start in Self::overlapping_starts(inner, new_extent) {
            let old_extent = inner[&start].block_extent;
            if new_extent.start <= old_extent.start {
                if new_extent.end >= old_extent.end {
                    // Old entry completely occluded.
                    Self::remove_locked(inner, start);
                } else {
                    // New entry occludes the beginning of the old one.
                    let shrunk = BlockExtent {
                        start: new_extent.end + 1,
                        end: old_extent.end,
                    };
                    Self::adjust_locked(inner, start, shrunk);
                }
            } else if new_extent.end >= old_extent.end {
                // New entry occludes the end of the old one.
                let shrunk = BlockExtent {
                    start: old_extent.start,
                    end: new_extent.start - 1,
                };
                Self::adjust_locked(inner, start, shrunk);
            } else {
                // New entry splits the old one in two.
                Self::split_locked(inner, start, new_extent);
            }
        }

        Self::insert_locked(
            inner,
            MapEntry {
                block_extent: new_extent,
                entry: Arc::clone(entry),
            },
        );
    }

    fn insert_locked(inner: &mut BTreeMap<u64, MapEntry>, map_entry: MapEntry) {
        map_entry.entry.add_map_reference();
        let replaced = inner.insert(map_entry.block_extent.start, map_entry);
        debug_assert!(replaced.is_none(), "map entries must not collide");
    }

    fn remove_locked(inner: &mut BTreeMap<u64, MapEntry>, start: u64) {
        let removed = inner.remove(&start).expect("removing a missing map entry");
        removed.entry.remove_map_reference();
    }

    /// Re-key an entry to a smaller extent without touching its
    /// reference count.
    fn adjust_locked(inner: &mut BTreeMap<u64, MapEntry>, start: u64, new_extent: BlockExtent) {
        let mut map_entry = inner.remove(&start).expect("adjusting a missing map entry");
        map_entry.block_extent = new_extent;
        let replaced = inner.insert(new_extent.start, map_entry);
        debug_assert!(replaced.is_none(), "adjusted extent collides");
    }

    /// Split an entry around `removed`: the two surviving fragments both
    /// refer to the original write entry, which gains one net reference.
    fn split_locked(inner: &mut BTreeMap<u64, MapEntry>, start: u64, removed: BlockExtent) {
        let split = inner.remove(&start).expect("splitting a missing map entry");
        let left = BlockExtent {
            start: split.block_extent.start,
            end: removed.start - 1,
        };
        let right = BlockExtent {
            start: removed.end + 1,
            end: split.block_extent.end,
        };
        let entry = split.entry;
        entry.add_map_reference();
        inner.insert(
            left.start,
            MapEntry {
                block_extent: left,
                entry: Arc::clone(&entry),
            },
        );
        inner.insert(
            right.start,
            MapEntry {
                block_extent: right,
                entry,
            },
        );
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn write_entry(offset: u64, len: u64) -> Arc<WriteLogEntry> {
        WriteLogEntry::new(None, offset, len)
    }

    fn extent(start: u64, end: u64) -> BlockExtent {
        BlockExtent::new(start, end).unwrap()
    }

    fn extents_of(map: &WriteLogMap, query: BlockExtent) -> Vec<(u64, u64)> {
        map.find_map_entries(query)
            .into_iter()
            .map(|m| (m.block_extent.start, m.block_extent.end))
            .collect()
    }

    #[test]
    fn single_entry_covers_its_extent() {
        let map = WriteLogMap::new();
        let a = write_entry(0, 4096);
        map.add_entry(&a);
        assert_eq!(map.len(), 1);
        assert_eq!(a.referring_map_entries(), 1);
        assert_eq!(extents_of(&map, extent(0, 4095)), vec![(0, 4095)]);
        assert!(map.find_map_entries(extent(4096, 8191)).is_empty());
    }

    #[test]
    fn full_cover_removes_old_entry() {
        let map = WriteLogMap::new();
        let old = write_entry(4096, 4096);
        let new = write_entry(0, 12288);
        map.add_entry(&old);
        map.add_entry(&new);
        assert_eq!(map.len(), 1);
        assert_eq!(old.referring_map_entries(), 0);
        assert_eq!(new.referring_map_entries(), 1);
        let found = map.find_log_entries(extent(4096, 8191));
        assert_eq!(found.len(), 1);
        assert!(Arc::ptr_eq(&found[0], &new));
    }

    #[test]
    fn new_entry_shrinks_old_from_the_left() {
        let map = WriteLogMap::new();
        let old = write_entry(0, 8192);
        let new = write_entry(0, 4096);
        map.add_entry(&old);
        map.add_entry(&new);
        assert_eq!(extents_of(&map, extent(0, 8191)), vec![(0, 4095), (4096, 8191)]);
        assert_eq!(old.referring_map_entries(), 1);
        assert_eq!(new.referring_map_entries(), 1);
    }

    #[test]
    fn new_entry_shrinks_old_from_the_right() {
        let map = WriteLogMap::new();
        let old = write_entry(0, 8192);
        let new = write_entry(4096, 8192);
        map.add_entry(&old);
        map.add_entry(&new);
        assert_eq!(
            extents_of(&map, extent(0, 12287)),
            vec![(0, 4095), (4096, 12287)]
        );
        assert_eq!(old.referring_map_entries(), 1);
    }

    #[test]
    fn middle_overwrite_splits_old_entry() {
        let map = WriteLogMap::new();
        let old = write_entry(0, 12288);
        let new = write_entry(4096, 4096);
        map.add_entry(&old);
        map.add_entry(&new);

        assert_eq!(map.len(), 3);
        assert_eq!(old.referring_map_entries(), 2);
        assert_eq!(new.referring_map_entries(), 1);
        assert_eq!(
            extents_of(&map, extent(0, 12287)),
            vec![(0, 4095), (4096, 8191), (8192, 12287)]
        );

        // The split entry shows up twice in a spanning log-entry query.
        let found = map.find_log_entries(extent(0, 12287));
        assert_eq!(found.len(), 3);
        assert!(Arc::ptr_eq(&found[0], &old));
        assert!(Arc::ptr_eq(&found[1], &new));
        assert!(Arc::ptr_eq(&found[2], &old));
    }

    #[test]
    fn remove_entry_strips_all_fragments() {
        let map = WriteLogMap::new();
        let old = write_entry(0, 12288);
        let new = write_entry(4096, 4096);
        map.add_entry(&old);
        map.add_entry(&new);
        map.remove_entry(&old);
        assert_eq!(map.len(), 1);
        assert_eq!(old.referring_map_entries(), 0);
        assert_eq!(extents_of(&map, extent(0, 12287)), vec![(4096, 8191)]);
    }

    #[test]
    fn overwrite_spanning_multiple_entries() {
        let map = WriteLogMap::new();
        let a = write_entry(0, 4096);
        let b = write_entry(4096, 4096);
        let c = write_entry(8192, 4096);
        map.add_entry(&a);
        map.add_entry(&b);
        map.add_entry(&c);

        // Covers the tail of a, all of b, and the head of c.
        let new = write_entry(2048, 8192);
        map.add_entry(&new);

        assert_eq!(
            extents_of(&map, extent(0, 12287)),
            vec![(0, 2047), (2048, 10239), (10240, 12287)]
        );
        assert_eq!(a.referring_map_entries(), 1);
        assert_eq!(b.referring_map_entries(), 0);
        assert_eq!(c.referring_map_entries(), 1);
    }

    #[test]
    fn adjacent_entries_do_not_interfere() {
        let map = WriteLogMap::new();
        let a = write_entry(0, 4096);
        let b = write_entry(4096, 4096);
        map.add_entry(&a);
        map.add_entry(&b);
        assert_eq!(map.len(), 2);
        assert_eq!(a.referring_map_entries(), 1);
        assert_eq!(b.referring_map_entries(), 1);
    }

    // ── Property tests ──────────────────────────────────────────────────

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use proptest::test_runner::TestCaseError;
        use std::collections::HashMap;

        /// Apply random writes; the map must stay non-overlapping, cover
        /// exactly the bytes of a byte-level reference model, and keep
        /// reference counts equal to the number of referring fragments.
        fn check_against_model(writes: &[(u64, u64)]) -> Result<(), TestCaseError> {
            let map = WriteLogMap::new();
            let mut model: HashMap<u64, usize> = HashMap::new();
            let mut entries = Vec::new();

            for (idx, (offset, len)) in writes.iter().enumerate() {
                let entry = write_entry(*offset, *len);
                map.add_entry(&entry);
                entries.push(entry);
                for byte in *offset..*offset + *len {
                    model.insert(byte, idx);
                }
            }

            let all = map.find_map_entries(extent(0, u64::MAX - 1));

            // Non-overlap and address order.
            for pair in all.windows(2) {
                prop_assert!(pair[0].block_extent.end < pair[1].block_extent.start);
            }

            // Coverage equals the model, byte for byte, newest writer wins.
            let mut covered = 0_u64;
            for map_entry in &all {
                covered += map_entry.block_extent.len();
                for byte in map_entry.block_extent.start..=map_entry.block_extent.end {
                    let winner = model.get(&byte).copied();
                    let mapped = entries
                        .iter()
                        .position(|e| Arc::ptr_eq(e, &map_entry.entry));
                    prop_assert_eq!(winner, mapped);
                }
            }
            prop_assert_eq!(covered as usize, model.len());

            // Reference accounting.
            for (idx, entry) in entries.iter().enumerate() {
                let fragments = all
                    .iter()
                    .filter(|m| Arc::ptr_eq(&m.entry, &entries[idx]))
                    .count();
                prop_assert_eq!(entry.referring_map_entries() as usize, fragments);
            }
            Ok(())
        }

        proptest! {
            #[test]
            fn random_writes_preserve_invariants(
                writes in prop::collection::vec((0_u64..64, 1_u64..32), 1..24)
            ) {
                check_against_model(&writes)?;
            }
        }
    }
}
