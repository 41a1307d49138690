//! Per-client fixed-window rate limiting with a bounded record table.
//!
//! Every client id gets a request counter that resets when its window
//! expires. The table is capped: inserting past the cap evicts the least
//! recently used record, and a background sweeper reclaims records that have
//! sat idle past the window regardless of eviction pressure. One mutex per
//! limiter serializes the whole check-reset-increment sequence.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::signal::ShutdownSignal;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Fixed window duration.
    pub window: Duration,
    /// Upper bound on simultaneously tracked client ids. Zero is treated
    /// as one; the table always has room for the client being checked.
    pub max_tracked_clients: usize,
    /// How often the sweeper wakes to drop idle records.
    pub sweep_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 5,
            window: Duration::from_secs(2),
            max_tracked_clients: 1024,
            sweep_interval: Duration::from_secs(10),
        }
    }
}

struct ClientRecord {
    count: u32,
    window_start: Instant,
    last_access: Instant,
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    records: Arc<Mutex<HashMap<String, ClientRecord>>>,
    stop: Arc<ShutdownSignal>,
    sweeper: Option<JoinHandle<()>>,
}

impl RateLimiter {
    /// Creates the limiter and starts its sweeper thread. The sweeper is
    /// signalled and joined when the limiter is dropped.
    pub fn new(mut config: RateLimiterConfig) -> Self {
        config.max_tracked_clients = config.max_tracked_clients.max(1);
        let records: Arc<Mutex<HashMap<String, ClientRecord>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(ShutdownSignal::new());
        let sweeper = spawn_sweeper(
            Arc::clone(&records),
            Arc::clone(&stop),
            config.window,
            config.sweep_interval,
        );
        Self {
            config,
            records,
            stop,
            sweeper,
        }
    }

    /// Records one request from `client_id` and reports whether it stays
    /// within the window's request limit.
    pub fn allow(&self, client_id: &str) -> bool {
        let now = Instant::now();
        let mut records = self.records.lock();
        if !records.contains_key(client_id) && records.len() >= self.config.max_tracked_clients {
            evict_least_recently_used(&mut records);
        }
        let record = records
            .entry(client_id.to_string())
            .or_insert_with(|| ClientRecord {
                count: 0,
                window_start: now,
                last_access: now,
            });
        record.last_access = now;
        if now.duration_since(record.window_start) > self.config.window {
            record.count = 0;
            record.window_start = now;
        }
        if record.count < self.config.max_requests {
            record.count += 1;
            true
        } else {
            false
        }
    }

    /// Number of client ids currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.records.lock().len()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop.trigger();
        if let Some(handle) = self.sweeper.take() {
            if handle.join().is_err() {
                warn!("rate limiter sweeper terminated abnormally");
            }
        }
    }
}

fn evict_least_recently_used(records: &mut HashMap<String, ClientRecord>) {
    let oldest = records
        .iter()
        .min_by_key(|(_, record)| record.last_access)
        .map(|(id, _)| id.clone());
    if let Some(id) = oldest {
        debug!("rate limiter evicted least recently used client {}", id);
        records.remove(&id);
    }
}

fn spawn_sweeper(
    records: Arc<Mutex<HashMap<String, ClientRecord>>>,
    stop: Arc<ShutdownSignal>,
    window: Duration,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("ratelimit-sweep".to_string())
        .spawn(move || {
            while !stop.wait_timeout(interval) {
                let now = Instant::now();
                let mut records = records.lock();
                let before = records.len();
                records.retain(|_, record| now.duration_since(record.last_access) <= window);
                let removed = before - records.len();
                if removed > 0 {
                    debug!("rate limiter sweeper removed {} idle records", removed);
                }
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            // The limiter still works without the sweeper; idle records are
            // then reclaimed only by LRU pressure.
            error!("failed to spawn rate limiter sweeper: {}", err);
            None
        }
    }
}
