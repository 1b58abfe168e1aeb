//! Cooperative stop signal for background runners.
//!
//! Binlog players, load generators and lag monitors are long-lived loops
//! that must stop *between* batches, never mid-batch. The signal is backed
//! by a Condvar so a blocked `wait_timeout` wakes within milliseconds of
//! `trigger()` instead of sleeping out its full interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Clone-shared stop signal. All clones observe the same state.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request stop. Wakes all waiters immediately.
    pub fn trigger(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    /// Check whether stop has been requested (non-blocking).
    pub fn is_triggered(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking early on `trigger()`.
    /// Returns `true` if stop was requested (caller should exit its loop).
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        let mut guard = self.inner.mutex.lock();
        let _ = self.inner.condvar.wait_for(&mut guard, duration);
        self.is_triggered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_untriggered() {
        assert!(!StopSignal::new().is_triggered());
    }

    #[test]
    fn test_trigger_is_sticky_across_clones() {
        let sig = StopSignal::new();
        let clone = sig.clone();
        sig.trigger();
        assert!(clone.is_triggered());
        assert!(clone.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn test_wait_wakes_on_trigger() {
        let sig = StopSignal::new();
        let sig2 = sig.clone();
        let handle = std::thread::spawn(move || {
            let start = std::time::Instant::now();
            let stopped = sig2.wait_timeout(Duration::from_secs(10));
            (stopped, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        sig.trigger();
        let (stopped, elapsed) = handle.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
    }

    #[test]
    fn test_wait_expires_without_trigger() {
        let sig = StopSignal::new();
        assert!(!sig.wait_timeout(Duration::from_millis(20)));
    }
}
