//! Lazily created per-key mutexes.
//!
//! Each key gets its own lock the first time it is used. Entries only hold
//! weak references, so a lock disappears once no caller holds it and the
//! map is swept on the next acquisition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// A map from key to mutex.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl KeyedLocks {
    /// Creates an empty lock map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = locks.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(Mutex::new(()));
        let _ = locks.insert(key.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Runs `f` while holding the lock for `key`.
    pub fn with<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.handle(key);
        // The guarded value is `()`, so a poisoned lock carries no broken state.
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Number of keys with a live lock.
    #[must_use]
    pub fn live(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (locks, inside, max_seen) =
                    (Arc::clone(&locks), Arc::clone(&inside), Arc::clone(&max_seen));
                thread::spawn(move || {
                    locks.with("alice-main", || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        let _ = max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        let _ = inside.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_keys_do_not_contend() {
        let locks = KeyedLocks::new();
        let value = locks.with("a", || locks.with("b", || 7));
        assert_eq!(value, 7);
    }

    #[test]
    fn idle_locks_are_collected() {
        let locks = KeyedLocks::new();
        locks.with("a", || ());
        locks.with("b", || ());
        assert_eq!(locks.live(), 0);
        locks.with("c", || assert_eq!(locks.live(), 1));
    }
}
