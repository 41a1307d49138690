//! Bounded, closable channel between connection threads and message
//! consumers.
//!
//! Capacity is fixed at construction and blocking `push` is the only
//! backpressure mechanism; the channel never drops an accepted item. By
//! default elements pop in strict FIFO order. An injected comparator switches
//! the channel to priority order: elements that compare `Greater` pop first,
//! and elements that compare equal pop in insertion order, so ordering stays
//! deterministic either way.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Caller-supplied ordering. `Greater` means "pop first".
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Heap entry carrying an insertion sequence number as the tie-break.
struct Entry<T> {
    item: T,
    seq: u64,
    compare: Comparator<T>,
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.compare)(&self.item, &other.item) {
            // Max-heap: the earlier insertion must compare greater to win ties.
            Ordering::Equal => other.seq.cmp(&self.seq),
            ordering => ordering,
        }
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Entry<T> {}

enum Buffer<T> {
    Fifo(VecDeque<T>),
    Ordered {
        heap: BinaryHeap<Entry<T>>,
        compare: Comparator<T>,
        next_seq: u64,
    },
}

impl<T> Buffer<T> {
    fn push(&mut self, item: T) {
        match self {
            Buffer::Fifo(queue) => queue.push_back(item),
            Buffer::Ordered {
                heap,
                compare,
                next_seq,
            } => {
                heap.push(Entry {
                    item,
                    seq: *next_seq,
                    compare: Arc::clone(compare),
                });
                *next_seq += 1;
            }
        }
    }

    fn pop(&mut self) -> Option<T> {
        match self {
            Buffer::Fifo(queue) => queue.pop_front(),
            Buffer::Ordered { heap, .. } => heap.pop().map(|entry| entry.item),
        }
    }

    fn len(&self) -> usize {
        match self {
            Buffer::Fifo(queue) => queue.len(),
            Buffer::Ordered { heap, .. } => heap.len(),
        }
    }
}

struct State<T> {
    buffer: Buffer<T>,
    closed: bool,
}

/// Fixed-capacity closable channel. See the module docs for ordering.
pub struct MessageQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> MessageQueue<T> {
    /// Creates a FIFO channel.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, Buffer::Fifo(VecDeque::with_capacity(capacity)))
    }

    /// Creates a priority channel ordered by `compare`.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn with_comparator(capacity: usize, compare: Comparator<T>) -> Self {
        Self::build(
            capacity,
            Buffer::Ordered {
                heap: BinaryHeap::with_capacity(capacity),
                compare,
                next_seq: 0,
            },
        )
    }

    fn build(capacity: usize, buffer: Buffer<T>) -> Self {
        assert!(capacity > 0, "channel capacity must be non-zero");
        Self {
            state: Mutex::new(State {
                buffer,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Enqueues `item`, blocking while the channel is full and open.
    ///
    /// Returns `true` on enqueue. Returns `false` without enqueueing once the
    /// channel is closed, including when `close` lands while this call is
    /// blocked.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        while state.buffer.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return false;
        }
        state.buffer.push(item);
        self.not_empty.notify_one();
        true
    }

    /// Blocks until an item is available or the channel is closed empty.
    ///
    /// Items accepted before `close` still drain; `None` means closed and
    /// empty.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        while state.buffer.len() == 0 && !state.closed {
            self.not_empty.wait(&mut state);
        }
        let item = state.buffer.pop();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Non-blocking variant of [`pop`](Self::pop).
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        let item = state.buffer.pop();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Permanently closes the channel and wakes all blocked callers.
    /// Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_default_order_is_fifo() {
        let queue = MessageQueue::new(8);
        for value in 1..=3 {
            assert!(queue.push(value));
        }
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
    }

    #[test]
    fn test_push_blocks_at_capacity_until_pop() {
        let queue = Arc::new(MessageQueue::new(2));
        assert!(queue.push(1));
        assert!(queue.push(2));
        let pusher = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let start = Instant::now();
                let accepted = queue.push(3);
                (accepted, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(100));
        // The third push must still be parked.
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(1));
        let (accepted, blocked_for) = pusher.join().unwrap();
        assert!(accepted);
        assert!(blocked_for >= Duration::from_millis(50));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
    }

    #[test]
    fn test_close_unblocks_blocked_push() {
        let queue = Arc::new(MessageQueue::new(1));
        assert!(queue.push(1));
        let pusher = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        queue.close();
        assert!(!pusher.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
        // The rejected item never landed.
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_close_unblocks_blocked_pop() {
        let queue: Arc<MessageQueue<u32>> = Arc::new(MessageQueue::new(4));
        let popper = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(popper.join().unwrap(), None);
    }

    #[test]
    fn test_pop_drains_items_accepted_before_close() {
        let queue = MessageQueue::new(4);
        assert!(queue.push("a"));
        assert!(queue.push("b"));
        queue.close();
        assert!(!queue.push("c"));
        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), Some("b"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_try_pop_never_blocks() {
        let queue: MessageQueue<u32> = MessageQueue::new(4);
        let start = Instant::now();
        assert_eq!(queue.try_pop(), None);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_comparator_pops_greater_first() {
        let queue = MessageQueue::with_comparator(8, Arc::new(|a: &u32, b: &u32| a.cmp(b)));
        for value in [3u32, 1, 4, 2] {
            assert!(queue.push(value));
        }
        assert_eq!(queue.pop(), Some(4));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(1));
    }

    #[test]
    fn test_comparator_ties_pop_in_insertion_order() {
        type Item = (u8, &'static str);
        let queue =
            MessageQueue::with_comparator(8, Arc::new(|a: &Item, b: &Item| a.0.cmp(&b.0)));
        for item in [(1, "a"), (1, "b"), (2, "c"), (1, "d")] {
            assert!(queue.push(item));
        }
        assert_eq!(queue.pop(), Some((2, "c")));
        assert_eq!(queue.pop(), Some((1, "a")));
        assert_eq!(queue.pop(), Some((1, "b")));
        assert_eq!(queue.pop(), Some((1, "d")));
    }

    #[test]
    #[should_panic(expected = "capacity must be non-zero")]
    fn test_zero_capacity_is_rejected() {
        let _ = MessageQueue::<u32>::new(0);
    }
}
