//! Keyed async mutual exclusion
//!
//! One `tokio::sync::Mutex` per key, created on demand. Used as the
//! single-writer point per conversation (pair), per connection and per viewer
//! queue build. Unrelated keys never contend.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Entries are pruned once the table grows past this many keys
const PRUNE_THRESHOLD: usize = 1024;

/// Table of per-key async locks
#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    ///
    /// The guard releases the key when dropped.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            if locks.len() >= PRUNE_THRESHOLD {
                // Held or awaited locks have clones outside the table
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::task::JoinSet;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::<u32>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut join_set = JoinSet::new();

        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            join_set.spawn(async move {
                let _guard = locks.lock(&7).await;
                let concurrent = inside.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                concurrent
            });
        }

        while let Some(result) = join_set.join_next().await {
            assert_eq!(result.expect("Task panicked"), 0);
        }
    }

    #[tokio::test]
    async fn test_different_keys_do_not_contend() {
        let locks = KeyedLocks::<u32>::new();
        let _first = locks.lock(&1).await;
        let second = tokio::time::timeout(Duration::from_millis(100), locks.lock(&2)).await;
        assert!(second.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_idle_keys_are_pruned() {
        let locks = KeyedLocks::<usize>::new();
        for key in 0..PRUNE_THRESHOLD {
            drop(locks.lock(&key).await);
        }
        let _held = locks.lock(&usize::MAX).await;
        assert_eq!(locks.len(), 1);
    }
}
