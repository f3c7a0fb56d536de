//! Sync points: barrier log entries grouping writes that may flush
//! concurrently.
//!
//! Each sync point owns two gathers. `prior_entries_persisted` holds one
//! sub per operation dispatched under the *previous* generation plus a
//! chaining sub from the earlier sync point; when it fires, this sync
//! point's own slot may be appended. `sync_point_persisted` fires when
//! the sync point itself is ready to persist; its finisher dispatches
//! the sync-point log operation.
//!
//! The `earlier` link is a strong reference, `later` a weak one; the
//! strong link is broken explicitly when the sync-point operation
//! completes, so no reference cycles survive.

use crate::util::{Completion, Gather};
use parking_lot::Mutex;
use pwl_log::SyncPointLogEntry;
use pwl_types::SyncGen;
use std::sync::{Arc, Weak};
use tracing::trace;

pub(crate) struct SyncPointState {
    pub appending: bool,
    pub append_scheduled: bool,
    pub earlier: Option<Arc<SyncPoint>>,
    pub later: Weak<SyncPoint>,
    pub on_appending: Vec<Box<dyn FnOnce() + Send>>,
    pub on_persisted: Vec<Completion>,
    pub final_op_sequence: u64,
}

/// See module docs. Mutable state sits behind its own mutex, which may
/// be taken while holding the cache lock but never the reverse.
pub(crate) struct SyncPoint {
    pub log_entry: Arc<SyncPointLogEntry>,
    pub prior_entries_persisted: Arc<Gather>,
    pub sync_point_persisted: Arc<Gather>,
    state: Mutex<SyncPointState>,
}

impl SyncPoint {
    pub fn new(sync_gen: SyncGen) -> Arc<Self> {
        trace!(target: "pwl::cache::sync_point", event = "sync_point_created", sync_gen = sync_gen.0);
        Arc::new(Self {
            log_entry: SyncPointLogEntry::new(sync_gen),
            prior_entries_persisted: Gather::new(),
            sync_point_persisted: Gather::new(),
            state: Mutex::new(SyncPointState {
                appending: false,
                append_scheduled: false,
                earlier: None,
                later: Weak::new(),
                on_appending: Vec::new(),
                on_persisted: Vec::new(),
                final_op_sequence: 0,
            }),
        })
    }

    pub fn sync_gen(&self) -> SyncGen {
        self.log_entry.sync_gen
    }

    pub fn link(earlier: &Arc<Self>, later: &Arc<Self>) {
        later.state.lock().earlier = Some(Arc::clone(earlier));
        earlier.state.lock().later = Arc::downgrade(later);
    }

    pub fn earlier(&self) -> Option<Arc<Self>> {
        self.state.lock().earlier.clone()
    }

    pub fn later(&self) -> Option<Arc<Self>> {
        self.state.lock().later.upgrade()
    }

    /// Drop the strong back-link from a completed earlier sync point.
    pub fn clear_earlier(&self) {
        self.state.lock().earlier = None;
    }

    pub fn is_appending(&self) -> bool {
        self.state.lock().appending
    }

    pub fn set_append_scheduled(&self) {
        self.state.lock().append_scheduled = true;
    }

    pub fn append_scheduled(&self) -> bool {
        self.state.lock().append_scheduled
    }

    pub fn set_final_op_sequence(&self, sequence: u64) {
        self.state.lock().final_op_sequence = sequence;
    }

    /// Queue work for when this sync point enters the appending state.
    /// Runs immediately if it already has.
    pub fn push_on_appending(&self, work: Box<dyn FnOnce() + Send>) {
        let run_now = {
            let mut state = self.state.lock();
            if state.appending {
                true
            } else {
                state.on_appending.push(work);
                return;
            }
        };
        if run_now {
            work();
        }
    }

    /// Queue a completion for when this sync point persists.
    pub fn push_on_persisted(&self, completion: Completion) {
        self.state.lock().on_persisted.push(completion);
    }

    /// Enter the appending state and wake everything queued on it.
    pub fn appending(&self) {
        let callbacks = {
            let mut state = self.state.lock();
            if !state.appending {
                trace!(
                    target: "pwl::cache::sync_point",
                    event = "sync_point_appending",
                    sync_gen = self.log_entry.sync_gen.0
                );
                state.appending = true;
            }
            std::mem::take(&mut state.on_appending)
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Take the persisted-continuation list for delivery.
    pub fn take_on_persisted(&self) -> Vec<Completion> {
        std::mem::take(&mut self.state.lock().on_persisted)
    }
}

impl std::fmt::Debug for SyncPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SyncPoint")
            .field("sync_gen", &self.log_entry.sync_gen.0)
            .field("appending", &state.appending)
            .field("append_scheduled", &state.append_scheduled)
            .field("has_earlier", &state.earlier.is_some())
            .field("on_appending", &state.on_appending.len())
            .field("on_persisted", &state.on_persisted.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn linking_and_breaking() {
        let a = SyncPoint::new(SyncGen(1));
        let b = SyncPoint::new(SyncGen(2));
        SyncPoint::link(&a, &b);
        assert!(Arc::ptr_eq(&b.earlier().unwrap(), &a));
        assert!(Arc::ptr_eq(&a.later().unwrap(), &b));
        b.clear_earlier();
        assert!(b.earlier().is_none());
    }

    #[test]
    fn appending_fires_queued_and_late_callbacks() {
        let point = SyncPoint::new(SyncGen(1));
        let count = Arc::new(AtomicUsize::new(0));

        let count_early = Arc::clone(&count);
        point.push_on_appending(Box::new(move || {
            count_early.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        point.appending();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Late registration runs immediately.
        let count_late = Arc::clone(&count);
        point.push_on_appending(Box::new(move || {
            count_late.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropped_later_link_upgrades_to_none() {
        let a = SyncPoint::new(SyncGen(1));
        {
            let b = SyncPoint::new(SyncGen(2));
            SyncPoint::link(&a, &b);
            b.clear_earlier();
        }
        assert!(a.later().is_none());
    }
}
