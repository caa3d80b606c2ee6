//! In-process synchronization helpers: per-key mutual exclusion and
//! cooperative cancellation.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// A family of mutexes addressed by key.
///
/// Holders of different keys never block each other. Holders of the same key
/// are serialized: a second `lock` waits until the first guard is dropped.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    held: Mutex<HashSet<K>>,
    released: Condvar,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        KeyedLocks {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    fn held(&self) -> MutexGuard<'_, HashSet<K>> {
        // The set is only mutated by insert/remove, so a poisoned lock
        // still holds consistent data.
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until `key` is free, then hold it.
    pub fn lock(&self, key: &K) -> KeyGuard<'_, K> {
        let mut held = self.held();
        while held.contains(key) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|e| e.into_inner());
        }
        held.insert(key.clone());
        KeyGuard {
            owner: self,
            key: key.clone(),
        }
    }

    /// Hold `key` if it is free right now.
    pub fn try_lock(&self, key: &K) -> Option<KeyGuard<'_, K>> {
        let mut held = self.held();
        if !held.insert(key.clone()) {
            return None;
        }
        Some(KeyGuard {
            owner: self,
            key: key.clone(),
        })
    }

    /// Whether some guard currently holds `key`.
    pub fn is_locked(&self, key: &K) -> bool {
        self.held().contains(key)
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct KeyGuard<'a, K: Eq + Hash + Clone> {
    owner: &'a KeyedLocks<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> KeyGuard<'_, K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        self.owner.held().remove(&self.key);
        self.owner.released.notify_all();
    }
}

/// Cooperative cancellation flag shared between a caller and a running
/// fetch or build. Work checks it between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    let _guard = locks.lock(&"zlib".to_string());
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(&"a");
        assert!(locks.try_lock(&"b").is_some());
        assert!(locks.try_lock(&"a").is_none());
        assert!(locks.is_locked(&"a"));
    }

    #[test]
    fn test_guard_drop_releases() {
        let locks = KeyedLocks::new();
        drop(locks.lock(&1u32));
        assert!(!locks.is_locked(&1));
        assert!(locks.try_lock(&1).is_some());
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
