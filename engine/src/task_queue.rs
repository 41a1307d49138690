//! Unbounded dual-priority work queue feeding the dispatcher's workers.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// A deferred, zero-argument unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    tasks: VecDeque<Task>,
    closed: bool,
}

/// Closable work queue with two priority classes.
///
/// Normal-priority tasks dequeue in submission order. High-priority tasks are
/// inserted at the dequeue end, so they run before every queued
/// normal-priority task, and a burst of high-priority tasks pushed without
/// interleaving pops dequeues newest-first. Consumers that need strict FIFO
/// among urgent work should not mark more than one task high-priority at a
/// time.
pub struct TaskQueue {
    inner: Mutex<Inner>,
    available: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueues a task. Silently drops it if the queue is closed.
    pub fn push(&self, task: Task, high_priority: bool) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        if high_priority {
            inner.tasks.push_front(task);
        } else {
            inner.tasks.push_back(task);
        }
        self.available.notify_one();
    }

    /// Blocks until a task is available or the queue is closed.
    ///
    /// Tasks still queued when `close` is called are drained; `None` means
    /// closed and empty.
    pub fn pop(&self) -> Option<Task> {
        let mut inner = self.inner.lock();
        while inner.tasks.is_empty() && !inner.closed {
            self.available.wait(&mut inner);
        }
        inner.tasks.pop_front()
    }

    /// Non-blocking variant of [`pop`](Self::pop).
    pub fn try_pop(&self) -> Option<Task> {
        self.inner.lock().tasks.pop_front()
    }

    /// Closes the queue and wakes every blocked `pop` caller. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().tasks.is_empty()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn tagged(order: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Task {
        let order = Arc::clone(order);
        Box::new(move || order.lock().push(tag))
    }

    fn run_all(queue: &TaskQueue) {
        while let Some(task) = queue.try_pop() {
            task();
        }
    }

    #[test]
    fn test_normal_tasks_dequeue_fifo() {
        let queue = TaskQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        queue.push(tagged(&order, "a"), false);
        queue.push(tagged(&order, "b"), false);
        queue.push(tagged(&order, "c"), false);
        run_all(&queue);
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_high_priority_precedes_earlier_normal_tasks() {
        let queue = TaskQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        queue.push(tagged(&order, "n1"), false);
        queue.push(tagged(&order, "n2"), false);
        queue.push(tagged(&order, "h1"), true);
        run_all(&queue);
        assert_eq!(*order.lock(), vec!["h1", "n1", "n2"]);
    }

    #[test]
    fn test_consecutive_high_priority_dequeues_in_reverse() {
        let queue = TaskQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        queue.push(tagged(&order, "n1"), false);
        queue.push(tagged(&order, "h1"), true);
        queue.push(tagged(&order, "h2"), true);
        queue.push(tagged(&order, "h3"), true);
        run_all(&queue);
        assert_eq!(*order.lock(), vec!["h3", "h2", "h1", "n1"]);
    }

    #[test]
    fn test_close_unblocks_waiting_pop() {
        let queue = Arc::new(TaskQueue::new());
        let popper = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        queue.close();
        let result = popper.join().unwrap();
        assert!(result.is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_push_after_close_is_dropped() {
        let queue = TaskQueue::new();
        queue.close();
        queue.push(Box::new(|| panic!("must never run")), false);
        assert!(queue.is_empty());
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_pop_drains_remaining_after_close() {
        let queue = TaskQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        queue.push(tagged(&order, "a"), false);
        queue.push(tagged(&order, "b"), false);
        queue.close();
        queue.pop().unwrap()();
        queue.pop().unwrap()();
        assert!(queue.pop().is_none());
        assert_eq!(*order.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let queue = TaskQueue::new();
        queue.close();
        queue.close();
        assert!(queue.is_closed());
    }
}
