#![forbid(unsafe_code)]
//! End-to-end scenarios against an in-memory lower tier.

use asupersync::Cx;
use parking_lot::{Condvar, Mutex};
use pwl_cache::{CacheConfig, ImageExtent, LowerTier, Result, WriteLogCache};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BLOCK: u64 = 4096;

// ── Test lower tier ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct MemoryLowerTier {
    bytes: Mutex<Vec<u8>>,
    writes: Mutex<Vec<(u64, u64)>>,
    flush_calls: AtomicUsize,
    invalidate_calls: AtomicUsize,
    discard_calls: AtomicUsize,
}

impl MemoryLowerTier {
    fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(vec![0_u8; len]),
            writes: Mutex::new(Vec::new()),
            flush_calls: AtomicUsize::new(0),
            invalidate_calls: AtomicUsize::new(0),
            discard_calls: AtomicUsize::new(0),
        })
    }

    fn write_log(&self) -> Vec<(u64, u64)> {
        self.writes.lock().clone()
    }
}

impl LowerTier for MemoryLowerTier {
    fn read(&self, _cx: &Cx, extents: &[ImageExtent]) -> Result<Vec<u8>> {
        let bytes = self.bytes.lock();
        let mut out = Vec::new();
        for extent in extents {
            let start = extent.offset as usize;
            out.extend_from_slice(&bytes[start..start + extent.len as usize]);
        }
        Ok(out)
    }

    fn write(&self, _cx: &Cx, extent: ImageExtent, data: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let start = extent.offset as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
        drop(bytes);
        self.writes.lock().push((extent.offset, extent.len));
        Ok(())
    }

    fn discard(&self, _cx: &Cx, _offset: u64, _len: u64, _skip_partial: bool) -> Result<()> {
        self.discard_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&self, _cx: &Cx) -> Result<()> {
        self.flush_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn invalidate(&self, _cx: &Cx) -> Result<()> {
        self.invalidate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Completion plumbing ─────────────────────────────────────────────────────

/// Blocks until a completion delivers its status code.
struct StatusWaiter {
    inner: Arc<(Mutex<Option<i32>>, Condvar)>,
}

impl StatusWaiter {
    fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    fn completion(&self) -> Box<dyn FnOnce(i32) + Send> {
        let inner = Arc::clone(&self.inner);
        Box::new(move |status| {
            let (lock, condvar) = &*inner;
            *lock.lock() = Some(status);
            condvar.notify_all();
        })
    }

    fn wait(&self) -> i32 {
        let (lock, condvar) = &*self.inner;
        let mut status = lock.lock();
        let deadline = Instant::now() + Duration::from_secs(30);
        while status.is_none() {
            assert!(
                !condvar.wait_until(&mut status, deadline).timed_out(),
                "completion did not arrive in time"
            );
        }
        status.expect("status set")
    }
}

fn write_blocking(cache: &WriteLogCache, cx: &Cx, offset: u64, data: Vec<u8>) -> i32 {
    let waiter = StatusWaiter::new();
    let extent = ImageExtent::new(offset, data.len() as u64).unwrap();
    cache.aio_write(cx, vec![extent], data, waiter.completion());
    waiter.wait()
}

fn read_blocking(cache: &WriteLogCache, cx: &Cx, offset: u64, len: u64) -> (i32, Vec<u8>) {
    let result = Arc::new((Mutex::new(None::<(i32, Vec<u8>)>), Condvar::new()));
    let signal = Arc::clone(&result);
    cache.aio_read(
        cx,
        vec![ImageExtent::new(offset, len).unwrap()],
        Box::new(move |status, bytes| {
            let (lock, condvar) = &*signal;
            *lock.lock() = Some((status, bytes));
            condvar.notify_all();
        }),
    );
    let (lock, condvar) = &*result;
    let mut slot = lock.lock();
    let deadline = Instant::now() + Duration::from_secs(30);
    while slot.is_none() {
        assert!(
            !condvar.wait_until(&mut slot, deadline).timed_out(),
            "read did not complete in time"
        );
    }
    slot.take().expect("read result set")
}

fn flush_blocking(cache: &WriteLogCache, cx: &Cx) -> i32 {
    let waiter = StatusWaiter::new();
    cache.aio_flush(cx, waiter.completion());
    waiter.wait()
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn small_cache_config(dir: &tempfile::TempDir) -> CacheConfig {
    let mut config = CacheConfig::new(dir.path().join("cache.pool"));
    config.pool_size = 4 * 1024 * 1024;
    config.max_log_entries = 16;
    config.max_writes_per_sync_point = 4;
    config.worker_threads = 4;
    config
}

fn blake3_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

// ── Scenarios ───────────────────────────────────────────────────────────────

#[test]
fn simple_write_read() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let lower = MemoryLowerTier::new(1 << 20);
    let cache =
        WriteLogCache::open(&cx, small_cache_config(&dir), Arc::clone(&lower) as _).unwrap();

    assert_eq!(write_blocking(&cache, &cx, 0, vec![0xAA; BLOCK as usize]), 0);

    let (status, bytes) = read_blocking(&cache, &cx, 0, BLOCK);
    assert_eq!(status, 0);
    assert_eq!(bytes, vec![0xAA; BLOCK as usize]);
    assert_eq!(cache.stats().map_entries, 1);

    cache.shut_down(&cx).unwrap();
    // Shutdown drained the write to the lower tier.
    assert_eq!(lower.write_log(), vec![(0, BLOCK)]);
}

#[test]
fn overwrite_splits_older_write() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let lower = MemoryLowerTier::new(1 << 20);
    let cache =
        WriteLogCache::open(&cx, small_cache_config(&dir), Arc::clone(&lower) as _).unwrap();

    assert_eq!(
        write_blocking(&cache, &cx, 0, vec![0xAA; (3 * BLOCK) as usize]),
        0
    );
    assert_eq!(
        write_blocking(&cache, &cx, BLOCK, vec![0xBB; BLOCK as usize]),
        0
    );

    let (status, bytes) = read_blocking(&cache, &cx, 0, 3 * BLOCK);
    assert_eq!(status, 0);
    let mut expected = vec![0xAA; BLOCK as usize];
    expected.extend_from_slice(&vec![0xBB; BLOCK as usize]);
    expected.extend_from_slice(&vec![0xAA; BLOCK as usize]);
    assert_eq!(blake3_hex(&bytes), blake3_hex(&expected));

    // Three fragments: the older write was split around the newer one.
    assert_eq!(cache.stats().map_entries, 3);

    cache.shut_down(&cx).unwrap();
}

#[test]
fn unwritten_range_reads_from_lower_tier() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let lower = MemoryLowerTier::new(1 << 20);
    lower.bytes.lock()[BLOCK as usize..2 * BLOCK as usize].fill(0x77);
    let cache =
        WriteLogCache::open(&cx, small_cache_config(&dir), Arc::clone(&lower) as _).unwrap();

    assert_eq!(write_blocking(&cache, &cx, 0, vec![0xAA; BLOCK as usize]), 0);

    // Hit then miss, spliced in order.
    let (status, bytes) = read_blocking(&cache, &cx, 0, 2 * BLOCK);
    assert_eq!(status, 0);
    assert_eq!(&bytes[..BLOCK as usize], &vec![0xAA; BLOCK as usize][..]);
    assert_eq!(&bytes[BLOCK as usize..], &vec![0x77; BLOCK as usize][..]);

    cache.shut_down(&cx).unwrap();
}

#[test]
fn sync_point_rollover_and_completion_order() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let lower = MemoryLowerTier::new(1 << 20);
    let cache =
        WriteLogCache::open(&cx, small_cache_config(&dir), Arc::clone(&lower) as _).unwrap();

    // Six concurrent persist-on-write writes; the per-sync-point write
    // limit of 4 forces at least one rollover however completions
    // interleave. Each completion records its submission index.
    let order = Arc::new(Mutex::new(Vec::new()));
    let waiters: Vec<StatusWaiter> = (0..6).map(|_| StatusWaiter::new()).collect();
    for (index, waiter) in waiters.iter().enumerate() {
        let extent = ImageExtent::new(index as u64 * BLOCK, BLOCK).unwrap();
        let order = Arc::clone(&order);
        let completion = waiter.completion();
        cache.aio_write(
            &cx,
            vec![extent],
            vec![index as u8; BLOCK as usize],
            Box::new(move |status| {
                order.lock().push(index);
                completion(status);
            }),
        );
    }
    for waiter in &waiters {
        assert_eq!(waiter.wait(), 0);
    }

    // Client-observed completion order matches submission order.
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 5]);
    // At least one rollover happened.
    assert!(cache.stats().current_sync_gen > 1);

    for index in 0..6_u64 {
        let (status, bytes) = read_blocking(&cache, &cx, index * BLOCK, BLOCK);
        assert_eq!(status, 0);
        assert_eq!(bytes, vec![index as u8; BLOCK as usize]);
    }

    cache.shut_down(&cx).unwrap();
}

#[test]
fn back_pressure_defers_then_completes() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let lower = MemoryLowerTier::new(1 << 20);
    let mut config = small_cache_config(&dir);
    // A tiny allocation cap: a handful of 4 KiB writes exceeds it and
    // the rest must wait for the flusher and retirer.
    config.usable_fraction = 0.02;
    config.max_log_entries = 8;
    let cache = WriteLogCache::open(&cx, config, Arc::clone(&lower) as _).unwrap();

    let waiters: Vec<StatusWaiter> = (0..24).map(|_| StatusWaiter::new()).collect();
    for (index, waiter) in waiters.iter().enumerate() {
        let extent = ImageExtent::new(index as u64 * BLOCK, BLOCK).unwrap();
        cache.aio_write(
            &cx,
            vec![extent],
            vec![index as u8; BLOCK as usize],
            waiter.completion(),
        );
    }
    for waiter in &waiters {
        assert_eq!(waiter.wait(), 0);
    }

    // Everything is readable afterwards, from the log or the image.
    for index in [0_u64, 7, 23] {
        let (status, bytes) = read_blocking(&cache, &cx, index * BLOCK, BLOCK);
        assert_eq!(status, 0);
        assert_eq!(bytes, vec![index as u8; BLOCK as usize]);
    }

    cache.shut_down(&cx).unwrap();
}

#[test]
fn barrier_flush_orders_surrounding_writes() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let lower = MemoryLowerTier::new(1 << 20);
    // Stay in persist-on-write so W2's completion means durability and
    // the client-visible order is deterministic.
    let mut config = small_cache_config(&dir);
    config.persist_on_write_until_flush = false;
    let cache = WriteLogCache::open(&cx, config, Arc::clone(&lower) as _).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let w1 = StatusWaiter::new();
    let f1 = StatusWaiter::new();
    let w2 = StatusWaiter::new();

    let record = |label: &'static str, completion: Box<dyn FnOnce(i32) + Send>| {
        let order = Arc::clone(&order);
        Box::new(move |status: i32| {
            order.lock().push(label);
            completion(status);
        })
    };

    cache.aio_write(
        &cx,
        vec![ImageExtent::new(0, BLOCK).unwrap()],
        vec![0x11; BLOCK as usize],
        record("w1", w1.completion()),
    );
    cache.aio_flush(&cx, record("f1", f1.completion()));
    cache.aio_write(
        &cx,
        vec![ImageExtent::new(BLOCK, BLOCK).unwrap()],
        vec![0x22; BLOCK as usize],
        record("w2", w2.completion()),
    );

    assert_eq!(w1.wait(), 0);
    assert_eq!(f1.wait(), 0);
    assert_eq!(w2.wait(), 0);
    assert_eq!(*order.lock(), vec!["w1", "f1", "w2"]);

    cache.shut_down(&cx).unwrap();
}

#[test]
fn first_flush_switches_to_persist_on_flush() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let lower = MemoryLowerTier::new(1 << 20);
    let cache =
        WriteLogCache::open(&cx, small_cache_config(&dir), Arc::clone(&lower) as _).unwrap();

    assert!(!cache.stats().persist_on_flush);
    assert_eq!(write_blocking(&cache, &cx, 0, vec![0x42; BLOCK as usize]), 0);
    assert_eq!(flush_blocking(&cache, &cx), 0);
    assert!(cache.stats().persist_on_flush);

    // Later writes are acknowledged on copy and still readable.
    assert_eq!(
        write_blocking(&cache, &cx, BLOCK, vec![0x43; BLOCK as usize]),
        0
    );
    let (status, bytes) = read_blocking(&cache, &cx, BLOCK, BLOCK);
    assert_eq!(status, 0);
    assert_eq!(bytes, vec![0x43; BLOCK as usize]);

    cache.shut_down(&cx).unwrap();
}

#[test]
fn flush_drains_dirty_entries_in_gen_order() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let lower = MemoryLowerTier::new(1 << 20);
    let cache =
        WriteLogCache::open(&cx, small_cache_config(&dir), Arc::clone(&lower) as _).unwrap();

    for index in 0..4_u64 {
        assert_eq!(
            write_blocking(&cache, &cx, index * BLOCK, vec![index as u8; BLOCK as usize]),
            0
        );
    }

    // Internal flush drains everything to the lower tier.
    let waiter = StatusWaiter::new();
    cache.flush(&cx, waiter.completion());
    assert_eq!(waiter.wait(), 0);
    wait_until("dirty entries drained", || {
        cache.stats().dirty_log_entries == 0 && cache.stats().bytes_dirty == 0
    });

    // One lower-tier write per entry, oldest generation first.
    let writes = lower.write_log();
    assert_eq!(writes.len(), 4);
    let offsets: Vec<u64> = writes.iter().map(|(offset, _)| *offset).collect();
    assert_eq!(offsets, vec![0, BLOCK, 2 * BLOCK, 3 * BLOCK]);

    cache.shut_down(&cx).unwrap();
}

#[test]
fn writesame_expands_pattern_through_cache() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let lower = MemoryLowerTier::new(1 << 20);
    let cache =
        WriteLogCache::open(&cx, small_cache_config(&dir), Arc::clone(&lower) as _).unwrap();

    let waiter = StatusWaiter::new();
    cache.aio_writesame(&cx, 0, 2 * BLOCK, vec![0xA5; 512], waiter.completion());
    assert_eq!(waiter.wait(), 0);

    let (status, bytes) = read_blocking(&cache, &cx, 0, 2 * BLOCK);
    assert_eq!(status, 0);
    assert_eq!(bytes, vec![0xA5; (2 * BLOCK) as usize]);

    // A misaligned pattern is rejected.
    let bad = StatusWaiter::new();
    cache.aio_writesame(&cx, 0, BLOCK + 1, vec![0xA5; 512], bad.completion());
    assert_eq!(bad.wait(), -libc::EINVAL);

    cache.shut_down(&cx).unwrap();
}

#[test]
fn compare_and_write_matches_then_mismatches() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let lower = MemoryLowerTier::new(1 << 20);
    let cache =
        WriteLogCache::open(&cx, small_cache_config(&dir), Arc::clone(&lower) as _).unwrap();

    assert_eq!(write_blocking(&cache, &cx, 0, vec![0x10; BLOCK as usize]), 0);

    // Matching compare dispatches the write.
    let matched = Arc::new((Mutex::new(None::<(i32, Option<u64>)>), Condvar::new()));
    let signal = Arc::clone(&matched);
    cache.aio_compare_and_write(
        &cx,
        vec![ImageExtent::new(0, BLOCK).unwrap()],
        vec![0x10; BLOCK as usize],
        vec![0x20; BLOCK as usize],
        Box::new(move |status, mismatch| {
            let (lock, condvar) = &*signal;
            *lock.lock() = Some((status, mismatch));
            condvar.notify_all();
        }),
    );
    {
        let (lock, condvar) = &*matched;
        let mut slot = lock.lock();
        while slot.is_none() {
            condvar.wait(&mut slot);
        }
        assert_eq!(slot.take(), Some((0, None)));
    }
    let (status, bytes) = read_blocking(&cache, &cx, 0, BLOCK);
    assert_eq!(status, 0);
    assert_eq!(bytes, vec![0x20; BLOCK as usize]);

    // Stale compare data reports the mismatch offset.
    let mismatched = Arc::new((Mutex::new(None::<(i32, Option<u64>)>), Condvar::new()));
    let signal = Arc::clone(&mismatched);
    cache.aio_compare_and_write(
        &cx,
        vec![ImageExtent::new(0, BLOCK).unwrap()],
        vec![0x10; BLOCK as usize],
        vec![0x30; BLOCK as usize],
        Box::new(move |status, mismatch| {
            let (lock, condvar) = &*signal;
            *lock.lock() = Some((status, mismatch));
            condvar.notify_all();
        }),
    );
    let (lock, condvar) = &*mismatched;
    let mut slot = lock.lock();
    while slot.is_none() {
        condvar.wait(&mut slot);
    }
    assert_eq!(slot.take(), Some((-libc::EILSEQ, Some(0))));

    cache.shut_down(&cx).unwrap();
}

#[test]
fn discard_flushes_then_forwards() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let lower = MemoryLowerTier::new(1 << 20);
    let cache =
        WriteLogCache::open(&cx, small_cache_config(&dir), Arc::clone(&lower) as _).unwrap();

    assert_eq!(write_blocking(&cache, &cx, 0, vec![0xAA; BLOCK as usize]), 0);

    let waiter = StatusWaiter::new();
    cache.aio_discard(&cx, 0, BLOCK, false, waiter.completion());
    assert_eq!(waiter.wait(), 0);
    assert_eq!(lower.discard_calls.load(Ordering::SeqCst), 1);
    // The dirty write drained before the discard went below.
    assert!(!lower.write_log().is_empty());

    cache.shut_down(&cx).unwrap();
}

#[test]
fn invalidate_discards_everything() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let lower = MemoryLowerTier::new(1 << 20);
    let cache =
        WriteLogCache::open(&cx, small_cache_config(&dir), Arc::clone(&lower) as _).unwrap();

    for index in 0..3_u64 {
        assert_eq!(
            write_blocking(&cache, &cx, index * BLOCK, vec![0xEE; BLOCK as usize]),
            0
        );
    }

    let waiter = StatusWaiter::new();
    cache.invalidate(&cx, waiter.completion());
    assert_eq!(waiter.wait(), 0);

    let stats = cache.stats();
    assert_eq!(stats.map_entries, 0);
    assert_eq!(stats.log_entries, 0);
    assert_eq!(stats.dirty_log_entries, 0);
    assert_eq!(stats.bytes_allocated, 0);
    assert_eq!(lower.invalidate_calls.load(Ordering::SeqCst), 1);

    // Reads now miss to the lower tier.
    let (status, bytes) = read_blocking(&cache, &cx, 0, BLOCK);
    assert_eq!(status, 0);
    assert_eq!(bytes, vec![0x00; BLOCK as usize]);

    cache.shut_down(&cx).unwrap();
}

#[test]
fn read_only_cache_rejects_mutations() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let lower = MemoryLowerTier::new(1 << 20);
    let mut config = small_cache_config(&dir);
    config.read_only = true;
    let cache = WriteLogCache::open(&cx, config, Arc::clone(&lower) as _).unwrap();

    assert_eq!(
        write_blocking(&cache, &cx, 0, vec![0xAA; BLOCK as usize]),
        -libc::EROFS
    );
    let waiter = StatusWaiter::new();
    cache.aio_flush(&cx, waiter.completion());
    assert_eq!(waiter.wait(), -libc::EROFS);

    cache.shut_down(&cx).unwrap();
}

#[test]
fn multi_extent_write_lands_in_order() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let lower = MemoryLowerTier::new(1 << 20);
    let cache =
        WriteLogCache::open(&cx, small_cache_config(&dir), Arc::clone(&lower) as _).unwrap();

    // Two discontiguous extents in a single request; the payload is
    // their concatenation.
    let mut payload = vec![0xC1; BLOCK as usize];
    payload.extend_from_slice(&vec![0xC2; BLOCK as usize]);
    let waiter = StatusWaiter::new();
    cache.aio_write(
        &cx,
        vec![
            ImageExtent::new(0, BLOCK).unwrap(),
            ImageExtent::new(4 * BLOCK, BLOCK).unwrap(),
        ],
        payload,
        waiter.completion(),
    );
    assert_eq!(waiter.wait(), 0);

    let (status, first) = read_blocking(&cache, &cx, 0, BLOCK);
    assert_eq!(status, 0);
    assert_eq!(first, vec![0xC1; BLOCK as usize]);
    let (status, second) = read_blocking(&cache, &cx, 4 * BLOCK, BLOCK);
    assert_eq!(status, 0);
    assert_eq!(second, vec![0xC2; BLOCK as usize]);
    assert_eq!(cache.stats().map_entries, 2);

    cache.shut_down(&cx).unwrap();
}
