//! Index Waiters
//!
//! Maps a key (normally a serialized log position) to the wake primitive a
//! blocked caller sleeps on. The engine registers a waiter before the event
//! that could wake it is possible, so `wake` finding nothing is harmless.
//! Closing the registry releases every blocked caller at once.

use crate::raft::{LogIndex, Term};
use crate::wake::{lock, Wake};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Result of waiting on a registered key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Committed,
    TimedOut,
    /// The owning group went away before the key was woken.
    Closed,
}

/// Serializes a log position into a waiter key.
///
/// The term is part of the key: an index rewritten by a later leader must
/// not wake the caller whose entry was replaced.
pub fn entry_key(index: LogIndex, term: Term) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&index.to_be_bytes());
    key[8..].copy_from_slice(&term.to_be_bytes());
    key
}

#[derive(Debug)]
struct Slot {
    wake: Arc<Wake>,
    woken: bool,
}

/// Thread-safe registry of per-key waiters.
#[derive(Debug, Default)]
pub struct IndexWaiters {
    entries: Mutex<HashMap<Vec<u8>, Slot>>,
    closed: AtomicBool,
}

impl IndexWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fresh waiter for `key` and returns the handle to block on.
    ///
    /// # Panics
    ///
    /// Panics if `key` already has a live waiter. Two owners for one log
    /// index means index assignment is broken.
    pub fn register(&self, key: &[u8]) -> Arc<Wake> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(key) {
            drop(entries);
            panic!("waiter already registered for key {key:?}");
        }
        let wake = Arc::new(Wake::new());
        if self.is_closed() {
            wake.signal();
        }
        entries.insert(
            key.to_vec(),
            Slot {
                wake: Arc::clone(&wake),
                woken: false,
            },
        );
        wake
    }

    /// Blocks on `handle` for up to `timeout`, then removes the entry for
    /// `key` regardless of the outcome.
    pub fn await_and_remove(&self, key: &[u8], handle: &Wake, timeout: Duration) -> WaitOutcome {
        handle.wait_timeout(timeout);
        let woken = lock(&self.entries).remove(key).is_some_and(|slot| slot.woken);
        if woken {
            WaitOutcome::Committed
        } else if self.is_closed() {
            WaitOutcome::Closed
        } else {
            WaitOutcome::TimedOut
        }
    }

    /// Signals the waiter for `key`, if one is registered.
    pub fn wake(&self, key: &[u8]) -> bool {
        let wake = {
            let mut entries = lock(&self.entries);
            entries.get_mut(key).map(|slot| {
                slot.woken = true;
                Arc::clone(&slot.wake)
            })
        };
        match wake {
            Some(wake) => {
                wake.signal();
                true
            }
            None => false,
        }
    }

    /// Releases every blocked caller with [`WaitOutcome::Closed`]. Waiters
    /// registered afterwards return immediately.
    pub fn close(&self) {
        let pending: Vec<Arc<Wake>> = {
            let entries = lock(&self.entries);
            self.closed.store(true, Ordering::Release);
            entries
                .values()
                .filter(|slot| !slot.woken)
                .map(|slot| Arc::clone(&slot.wake))
                .collect()
        };
        for wake in pending {
            wake.signal();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_register_then_wake() {
        let waiters = IndexWaiters::new();
        let key = entry_key(7, 1);
        let handle = waiters.register(&key);

        assert!(waiters.wake(&key));
        assert_eq!(
            waiters.await_and_remove(&key, &handle, Duration::from_secs(1)),
            WaitOutcome::Committed
        );
        assert!(!waiters.contains(&key));
    }

    #[test]
    #[should_panic(expected = "waiter already registered")]
    fn test_duplicate_register_panics() {
        let waiters = IndexWaiters::new();
        let key = entry_key(1, 1);
        let _first = waiters.register(&key);
        let _second = waiters.register(&key);
    }

    #[test]
    fn test_wake_after_removal_is_noop() {
        let waiters = IndexWaiters::new();
        let key = entry_key(3, 1);
        let handle = waiters.register(&key);
        waiters.wake(&key);
        waiters.await_and_remove(&key, &handle, Duration::from_millis(10));

        assert!(!waiters.wake(&key));
        assert!(waiters.is_empty());
    }

    #[test]
    fn test_wake_unknown_key_is_noop() {
        let waiters = IndexWaiters::new();
        assert!(!waiters.wake(&entry_key(99, 1)));
    }

    #[test]
    fn test_timeout_removes_entry() {
        let waiters = IndexWaiters::new();
        let key = entry_key(11, 1);
        let handle = waiters.register(&key);

        let timeout = Duration::from_millis(50);
        let start = Instant::now();
        let outcome = waiters.await_and_remove(&key, &handle, timeout);
        let elapsed = start.elapsed();

        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500));
        assert!(!waiters.contains(&key));
    }

    #[test]
    fn test_wake_before_await_is_not_lost() {
        let waiters = Arc::new(IndexWaiters::new());
        let key = entry_key(5, 1);
        let handle = waiters.register(&key);

        let remote = Arc::clone(&waiters);
        thread::spawn(move || remote.wake(&entry_key(5, 1)))
            .join()
            .unwrap();

        assert_eq!(
            waiters.await_and_remove(&key, &handle, Duration::from_millis(10)),
            WaitOutcome::Committed
        );
    }

    #[test]
    fn test_key_distinguishes_terms() {
        let waiters = IndexWaiters::new();
        let _old = waiters.register(&entry_key(4, 1));
        assert!(!waiters.wake(&entry_key(4, 2)));
        assert!(waiters.wake(&entry_key(4, 1)));
    }

    #[test]
    fn test_close_releases_blocked_callers() {
        let waiters = Arc::new(IndexWaiters::new());
        let key = entry_key(6, 2);
        let handle = waiters.register(&key);

        let remote = Arc::clone(&waiters);
        let blocked = thread::spawn(move || {
            let start = Instant::now();
            let outcome = remote.await_and_remove(&entry_key(6, 2), &handle, Duration::from_secs(30));
            (outcome, start.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        waiters.close();

        let (outcome, elapsed) = blocked.join().unwrap();
        assert_eq!(outcome, WaitOutcome::Closed);
        assert!(elapsed < Duration::from_secs(5));
        assert!(waiters.is_empty());
    }

    #[test]
    fn test_close_keeps_committed_outcome() {
        let waiters = IndexWaiters::new();
        let key = entry_key(8, 1);
        let handle = waiters.register(&key);
        waiters.wake(&key);
        waiters.close();
        assert_eq!(
            waiters.await_and_remove(&key, &handle, Duration::from_secs(1)),
            WaitOutcome::Committed
        );

        let late = entry_key(9, 1);
        let handle = waiters.register(&late);
        assert_eq!(
            waiters.await_and_remove(&late, &handle, Duration::from_secs(30)),
            WaitOutcome::Closed
        );
    }

    #[test]
    fn test_key_reusable_after_removal() {
        let waiters = IndexWaiters::new();
        let key = entry_key(2, 1);
        let handle = waiters.register(&key);
        waiters.await_and_remove(&key, &handle, Duration::from_millis(1));
        let _again = waiters.register(&key);
        assert_eq!(waiters.len(), 1);
    }
}
