//! Completion plumbing: one-shot continuations, counted barriers, and
//! the in-flight operation tracker used for orderly shutdown.

use asupersync::Cx;
use parking_lot::{Condvar, Mutex};
use pwl_error::PwlError;
use tracing::trace;

/// One-shot continuation carrying a status code: 0 for success, a
/// negated POSIX errno otherwise.
pub type Completion = Box<dyn FnOnce(i32) + Send>;

/// Convert an internal result into a completion status code.
#[must_use]
pub fn status_code(result: &Result<(), PwlError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => -err.to_errno(),
    }
}

/// Long-lived context for background worker threads.
pub(crate) fn background_cx() -> Cx {
    Cx::for_testing()
}

// ── Deferred work ───────────────────────────────────────────────────────────

/// Work deferred until a lock is released: callbacks added while the
/// lock is held run when this value drops.
#[derive(Default)]
pub struct DeferredWork {
    items: Vec<Box<dyn FnOnce() + Send>>,
}

impl DeferredWork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, work: impl FnOnce() + Send + 'static) {
        self.items.push(Box::new(work));
    }

    /// Drop the queued work without running it (failed-open path).
    pub fn cancel(&mut self) {
        self.items.clear();
    }
}

impl Drop for DeferredWork {
    fn drop(&mut self) {
        for work in self.items.drain(..) {
            work();
        }
    }
}

// ── Gather ──────────────────────────────────────────────────────────────────

struct GatherInner {
    pending: usize,
    result: i32,
    activated: bool,
    finished: bool,
    finisher: Option<Completion>,
}

/// Counted completion barrier.
///
/// Subs are acquired before activation; each completes exactly once.
/// After `activate`, when the last sub completes (or immediately, if
/// none remain) the finisher runs with the first non-zero status seen.
pub struct Gather {
    inner: Mutex<GatherInner>,
}

impl Gather {
    #[must_use]
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            inner: Mutex::new(GatherInner {
                pending: 0,
                result: 0,
                activated: false,
                finished: false,
                finisher: None,
            }),
        })
    }

    /// Acquire a sub. Must happen before `activate`.
    #[must_use]
    pub fn new_sub(self: &std::sync::Arc<Self>) -> GatherSub {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.activated, "sub acquired after activation");
        inner.pending += 1;
        GatherSub {
            gather: std::sync::Arc::clone(self),
        }
    }

    pub fn set_finisher(&self, finisher: Completion) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.finisher.is_none(), "finisher set twice");
        inner.finisher = Some(finisher);
    }

    /// No more subs will be acquired; fire once all outstanding subs
    /// complete.
    pub fn activate(&self) {
        let fire = {
            let mut inner = self.inner.lock();
            inner.activated = true;
            Self::take_finisher(&mut inner)
        };
        if let Some((finisher, result)) = fire {
            finisher(result);
        }
    }

    fn sub_complete(&self, status: i32) {
        let fire = {
            let mut inner = self.inner.lock();
            debug_assert!(inner.pending > 0, "gather sub underflow");
            inner.pending -= 1;
            if inner.result == 0 && status != 0 {
                inner.result = status;
            }
            Self::take_finisher(&mut inner)
        };
        if let Some((finisher, result)) = fire {
            finisher(result);
        }
    }

    fn take_finisher(inner: &mut GatherInner) -> Option<(Completion, i32)> {
        if inner.activated && inner.pending == 0 && !inner.finished {
            if let Some(finisher) = inner.finisher.take() {
                inner.finished = true;
                return Some((finisher, inner.result));
            }
        }
        None
    }
}

impl std::fmt::Debug for Gather {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Gather")
            .field("pending", &inner.pending)
            .field("activated", &inner.activated)
            .field("finished", &inner.finished)
            .finish()
    }
}

/// A single sub of a [`Gather`]; completing it consumes it.
pub struct GatherSub {
    gather: std::sync::Arc<Gather>,
}

impl GatherSub {
    pub fn complete(self, status: i32) {
        trace!(target: "pwl::cache::gather", event = "sub_complete", status);
        self.gather.sub_complete(status);
    }
}

impl std::fmt::Debug for GatherSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GatherSub")
    }
}

// ── Async op tracker ────────────────────────────────────────────────────────

/// Counts in-flight asynchronous operations; shutdown waits for zero.
#[derive(Default)]
pub struct AsyncOpTracker {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl AsyncOpTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_op(&self) {
        *self.count.lock() += 1;
    }

    pub fn finish_op(&self) {
        let mut count = self.count.lock();
        debug_assert!(*count > 0, "op tracker underflow");
        *count -= 1;
        if *count == 0 {
            self.condvar.notify_all();
        }
    }

    /// Block until every started op finishes.
    pub fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.condvar.wait(&mut count);
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        *self.count.lock()
    }
}

impl std::fmt::Debug for AsyncOpTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncOpTracker")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn gather_fires_after_activation_and_last_sub() {
        let fired = Arc::new(AtomicI32::new(-1));
        let gather = Gather::new();
        let a = gather.new_sub();
        let b = gather.new_sub();
        let fired_clone = Arc::clone(&fired);
        gather.set_finisher(Box::new(move |status| {
            fired_clone.store(status, Ordering::SeqCst);
        }));

        a.complete(0);
        assert_eq!(fired.load(Ordering::SeqCst), -1);
        gather.activate();
        assert_eq!(fired.load(Ordering::SeqCst), -1);
        b.complete(0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn gather_with_no_subs_fires_on_activate() {
        let fired = Arc::new(AtomicI32::new(-1));
        let gather = Gather::new();
        let fired_clone = Arc::clone(&fired);
        gather.set_finisher(Box::new(move |status| {
            fired_clone.store(status, Ordering::SeqCst);
        }));
        gather.activate();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn gather_keeps_first_error() {
        let fired = Arc::new(AtomicI32::new(1));
        let gather = Gather::new();
        let a = gather.new_sub();
        let b = gather.new_sub();
        let fired_clone = Arc::clone(&fired);
        gather.set_finisher(Box::new(move |status| {
            fired_clone.store(status, Ordering::SeqCst);
        }));
        gather.activate();
        a.complete(-libc::EIO);
        b.complete(-libc::EINVAL);
        assert_eq!(fired.load(Ordering::SeqCst), -libc::EIO);
    }

    #[test]
    fn gather_fires_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let gather = Gather::new();
        let sub = gather.new_sub();
        let count_clone = Arc::clone(&count);
        gather.set_finisher(Box::new(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        gather.activate();
        sub.complete(0);
        gather.activate();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deferred_work_runs_on_drop_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let mut deferred = DeferredWork::new();
            let order_a = Arc::clone(&order);
            deferred.add(move || order_a.lock().push(1));
            let order_b = Arc::clone(&order);
            deferred.add(move || order_b.lock().push(2));
            assert!(order.lock().is_empty());
        }
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn tracker_wait_idle_returns_at_zero() {
        let tracker = Arc::new(AsyncOpTracker::new());
        tracker.start_op();
        let tracker_clone = Arc::clone(&tracker);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            tracker_clone.finish_op();
        });
        tracker.wait_idle();
        assert_eq!(tracker.in_flight(), 0);
        handle.join().unwrap();
    }

    #[test]
    fn status_code_mapping() {
        assert_eq!(status_code(&Ok(())), 0);
        assert_eq!(status_code(&Err(PwlError::ReadOnly)), -libc::EROFS);
    }
}
