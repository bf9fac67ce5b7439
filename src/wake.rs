//! Wake Primitive
//!
//! A counting semaphore shared between threads. One side signals, the other
//! blocks until a signal is available. Every queue doorbell, every blocked
//! caller and every commit waiter in the runtime is built on this type.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Counting wake primitive.
///
/// Signals accumulate: three `signal()` calls satisfy three `wait()` calls,
/// in any interleaving.
#[derive(Debug, Default)]
pub struct Wake {
    permits: Mutex<u64>,
    cond: Condvar,
}

impl Wake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one permit and wakes a blocked waiter. Never blocks.
    pub fn signal(&self) {
        let mut permits = lock(&self.permits);
        *permits = permits.saturating_add(1);
        self.cond.notify_one();
    }

    /// Blocks until a permit is available and consumes it.
    pub fn wait(&self) {
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            permits = self.cond.wait(permits).unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }

    /// Blocks for at most `timeout`. Returns `true` if a permit was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(permits, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            permits = guard;
        }
        *permits -= 1;
        true
    }

    /// Consumes a permit if one is pending, without blocking.
    pub fn try_take(&self) -> bool {
        let mut permits = lock(&self.permits);
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Number of signals not yet consumed.
    pub fn pending(&self) -> u64 {
        *lock(&self.permits)
    }
}

// ============================================================================
// LOCK HELPERS
// ============================================================================

// A panicking holder never leaves these structures half-updated, so poison
// is ignored instead of propagated to every caller.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_signals_accumulate() {
        let wake = Wake::new();
        wake.signal();
        wake.signal();
        wake.signal();
        assert_eq!(wake.pending(), 3);

        assert!(wake.wait_timeout(Duration::from_millis(1)));
        assert!(wake.wait_timeout(Duration::from_millis(1)));
        assert!(wake.try_take());
        assert!(!wake.try_take());
        assert_eq!(wake.pending(), 0);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let wake = Wake::new();
        let start = Instant::now();
        assert!(!wake.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_signal_from_other_thread() {
        let wake = Arc::new(Wake::new());
        let remote = Arc::clone(&wake);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.signal();
        });
        wake.wait();
        handle.join().unwrap();
        assert_eq!(wake.pending(), 0);
    }

    #[test]
    fn test_each_signal_releases_one_waiter() {
        let wake = Arc::new(Wake::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let wake = Arc::clone(&wake);
                thread::spawn(move || wake.wait_timeout(Duration::from_secs(5)))
            })
            .collect();
        for _ in 0..4 {
            wake.signal();
        }
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(wake.pending(), 0);
    }
}
