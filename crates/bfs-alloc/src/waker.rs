//! Wake signal for the allocator thread.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

/// Counts wakeups and lets the allocator sleep until the next one.
///
/// Marking calls [`wake`](Self::wake) whenever a bucket goes from
/// unavailable to available. The allocator remembers the last count it
/// saw and waits for it to move.
#[derive(Debug, Default)]
pub struct AllocatorWaker {
    wakeups: Mutex<u64>,
    condvar: Condvar,
}

impl AllocatorWaker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        let mut n = self.wakeups.lock();
        *n += 1;
        let count = *n;
        drop(n);
        self.condvar.notify_all();
        trace!(target: "bfs::alloc", wakeups = count, "allocator_wake");
    }

    #[must_use]
    pub fn wake_count(&self) -> u64 {
        *self.wakeups.lock()
    }

    /// Block until the count exceeds `seen` or `timeout` elapses; returns
    /// the count observed last.
    pub fn wait_past(&self, seen: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut n = self.wakeups.lock();
        while *n <= seen {
            if self.condvar.wait_until(&mut n, deadline).timed_out() {
                break;
            }
        }
        *n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn wait_returns_after_wake() {
        let waker = Arc::new(AllocatorWaker::new());
        let seen = waker.wake_count();
        let w = Arc::clone(&waker);
        let handle = std::thread::spawn(move || w.wait_past(seen, Duration::from_secs(10)));
        waker.wake();
        assert_eq!(handle.join().unwrap(), seen + 1);
    }

    #[test]
    fn wait_times_out_without_wake() {
        let waker = AllocatorWaker::new();
        assert_eq!(waker.wait_past(0, Duration::from_millis(10)), 0);
    }
}
