//! Fixed worker thread pool.
//!
//! A handful of named threads drain a condvar-fed queue of boxed tasks.
//! Shutdown drains the queue before the threads exit, so every task
//! queued before `shutdown` runs.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::trace;

type Task = Box<dyn FnOnce() + Send>;

struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    condvar: Condvar,
    stopping: AtomicBool,
}

/// Fixed-size pool of worker threads.
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let queue = Arc::new(TaskQueue {
            tasks: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stopping: AtomicBool::new(false),
        });

        let threads = (0..workers.max(1))
            .map(|index| {
                let queue = Arc::clone(&queue);
                std::thread::Builder::new()
                    .name(format!("pwl-worker-{index}"))
                    .spawn(move || worker_loop(&queue))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            queue,
            threads: Mutex::new(threads),
        }
    }

    /// Queue a task. Returns false (and drops the task) once shutdown
    /// has begun.
    pub fn queue(&self, task: impl FnOnce() + Send + 'static) -> bool {
        if self.queue.stopping.load(Ordering::Acquire) {
            trace!(target: "pwl::cache::workers", event = "task_dropped_at_shutdown");
            return false;
        }
        self.queue.tasks.lock().push_back(Box::new(task));
        self.queue.condvar.notify_one();
        true
    }

    /// Drain the queue and join all threads. Idempotent. A worker
    /// dropping the last pool handle must not join itself; its thread
    /// is detached instead.
    pub fn shutdown(&self) {
        self.queue.stopping.store(true, Ordering::Release);
        self.queue.condvar.notify_all();
        let threads = std::mem::take(&mut *self.threads.lock());
        let current = std::thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queued", &self.queue.tasks.lock().len())
            .field("stopping", &self.queue.stopping.load(Ordering::Relaxed))
            .finish()
    }
}

fn worker_loop(queue: &TaskQueue) {
    loop {
        let task = {
            let mut tasks = queue.tasks.lock();
            loop {
                if let Some(task) = tasks.pop_front() {
                    break Some(task);
                }
                if queue.stopping.load(Ordering::Acquire) {
                    break None;
                }
                queue.condvar.wait(&mut tasks);
            }
        };
        match task {
            Some(task) => task(),
            None => return,
        }
    }
}
