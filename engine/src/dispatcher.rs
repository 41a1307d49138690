//! Fixed-size worker pool draining a [`TaskQueue`].
//!
//! One dispatcher instance is shared (via `Arc`) by every component that
//! offloads work: server payload handling, client sends, anything the
//! application layer defers. There is deliberately no global instance;
//! owners construct one, inject it, and stop it when they are done, which
//! also gives every test an isolated pool.
//!
//! Workers make no affinity promises. Tasks dispatched concurrently from
//! different call sites may execute in any order beyond the two-class
//! priority of the queue itself.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::task_queue::{Task, TaskQueue};

pub struct Dispatcher {
    queue: Arc<TaskQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl Dispatcher {
    /// Creates a dispatcher with no workers. Call [`start`](Self::start) to
    /// spawn the pool.
    pub fn new() -> Self {
        Self {
            queue: Arc::new(TaskQueue::new()),
            workers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Spawns `thread_count` workers (at least one). Idempotent while
    /// running. The lifecycle is one-shot: once stopped, a dispatcher cannot
    /// be started again.
    pub fn start(&self, thread_count: usize) {
        if self.stopped.load(Ordering::SeqCst) {
            warn!("dispatcher already stopped; start ignored");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock();
        for index in 0..thread_count.max(1) {
            let queue = Arc::clone(&self.queue);
            let spawned = thread::Builder::new()
                .name(format!("dispatch-{}", index))
                .spawn(move || worker_loop(queue));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => error!("failed to spawn dispatcher worker {}: {}", index, err),
            }
        }
        debug!("dispatcher started with {} workers", workers.len());
    }

    /// Submits a task to the pool. No-op (with a log line) when the
    /// dispatcher is not running; the task is dropped unexecuted.
    pub fn dispatch(&self, task: Task, high_priority: bool) {
        if !self.running.load(Ordering::SeqCst) {
            debug!("dispatch ignored; dispatcher not running");
            return;
        }
        self.queue.push(task, high_priority);
    }

    /// Closes the queue, lets workers drain the tasks already queued, and
    /// joins them. Idempotent and safe from any thread.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.queue.close();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("dispatcher worker thread terminated abnormally");
            }
        }
        debug!("dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn thread_count(&self) -> usize {
        self.workers.lock().len()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(queue: Arc<TaskQueue>) {
    while let Some(task) = queue.pop() {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("dispatched task panicked; worker continues");
        }
    }
}
