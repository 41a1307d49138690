//! One-shot shutdown signalling shared between a component and its
//! background threads.
//!
//! Periodic threads (heartbeat supervisors, the rate-limiter sweeper,
//! reconnect backoff) sleep via [`ShutdownSignal::wait_timeout`] instead of
//! `thread::sleep` so that `stop()` interrupts them immediately instead of
//! waiting out the interval.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A latch that starts unset and can be triggered exactly once.
///
/// Triggering is permanent and wakes every thread currently waiting on it.
pub struct ShutdownSignal {
    triggered: Mutex<bool>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            triggered: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Sets the signal and wakes all waiters. Idempotent.
    pub fn trigger(&self) {
        let mut triggered = self.triggered.lock();
        *triggered = true;
        self.condvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock()
    }

    /// Waits until the signal fires or `timeout` elapses.
    ///
    /// Returns `true` if the signal fired, `false` on timeout. Used as the
    /// sleep primitive of periodic loops: a `false` return means "do another
    /// tick", a `true` return means "shut down".
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut triggered = self.triggered.lock();
        while !*triggered {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.condvar.wait_for(&mut triggered, deadline - now);
        }
        true
    }

    /// Blocks until the signal fires.
    pub fn wait(&self) {
        let mut triggered = self.triggered.lock();
        while !*triggered {
            self.condvar.wait(&mut triggered);
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_timeout_expires_when_untriggered() {
        let signal = ShutdownSignal::new();
        let start = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_trigger_wakes_waiter() {
        let signal = Arc::new(ShutdownSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait_timeout(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(50));
        signal.trigger();
        let start = Instant::now();
        assert!(waiter.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_trigger_is_idempotent_and_sticky() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        signal.trigger();
        assert!(signal.is_triggered());
        // An already-triggered signal returns without sleeping.
        let start = Instant::now();
        assert!(signal.wait_timeout(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_blocks_until_trigger() {
        let signal = Arc::new(ShutdownSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait())
        };
        thread::sleep(Duration::from_millis(50));
        signal.trigger();
        waiter.join().unwrap();
        assert!(signal.is_triggered());
    }
}
