//! # Network Engine Library
//!
//! This library provides the concurrency and transport building blocks for
//! the networked game services in this workspace. It owns the thread pools,
//! the bounded queues, and the socket plumbing; the `server` and `client`
//! crates compose these pieces into the actual endpoints.
//!
//! ## Core Responsibilities
//!
//! ### Task Dispatch
//! A fixed pool of OS worker threads drains a shared two-priority task
//! queue. Network handlers push short-lived jobs (decode, classify, reply)
//! onto the pool instead of spawning a thread per event, keeping thread
//! count flat under load.
//!
//! ### Bounded Message Passing
//! Producer/consumer channels with a hard capacity. Producers block when
//! the channel is full, so a slow consumer applies backpressure instead of
//! growing memory without bound. An optional comparator turns a channel
//! into a priority channel while keeping FIFO order for equal items.
//!
//! ### Transport
//! Blocking TCP, UDP, and TLS-over-TCP primitives: split read/write halves,
//! handshake handling, and the heartbeat vocabulary both endpoints speak.
//!
//! ### Abuse Protection
//! A fixed-window rate limiter with least-recently-used eviction, sized so
//! that an attacker cycling source addresses cannot grow its bookkeeping
//! past a configured bound.
//!
//! ## Module Organization
//!
//! - [`dispatcher`]: worker pool executing queued tasks
//! - [`task_queue`]: two-priority blocking queue feeding the pool
//! - [`message_queue`]: bounded channel with optional ordering
//! - [`rate_limiter`]: fixed-window limiter with LRU eviction
//! - [`protocol`]: connection ids, control payloads, message hooks
//! - [`transport`]: reader/writer halves over TCP, TLS, and UDP
//! - [`tls`]: certificate loading, handshakes, session halves
//! - [`signal`]: shutdown signal for waking sleeping threads
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use engine::dispatcher::Dispatcher;
//! use engine::message_queue::MessageQueue;
//! use std::sync::Arc;
//!
//! let dispatcher = Dispatcher::new();
//! dispatcher.start(4);
//!
//! let queue: Arc<MessageQueue<String>> = Arc::new(MessageQueue::new(64));
//! let consumer = Arc::clone(&queue);
//! dispatcher.dispatch(
//!     Box::new(move || {
//!         while let Some(message) = consumer.pop() {
//!             println!("got {}", message);
//!         }
//!     }),
//!     false,
//! );
//!
//! queue.push("hello".to_string());
//! queue.close();
//! dispatcher.stop();
//! ```
//!
//! ## Threading Model
//!
//! Everything here is plain OS threads and blocking I/O. Long-lived work
//! (connection readers, heartbeat timers) gets a dedicated named thread;
//! short-lived work goes through the dispatcher pool. Shutdown is
//! cooperative: queues close, sockets shut down, and every spawned thread
//! is joined before the owning object finishes stopping.

pub mod dispatcher;
pub mod message_queue;
pub mod protocol;
pub mod rate_limiter;
pub mod signal;
pub mod task_queue;
pub mod tls;
pub mod transport;
