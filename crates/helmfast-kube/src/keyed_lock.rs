//! Per-key async mutexes
//!
//! Serialises work per release key across the unlock/relock transition. The
//! per-key mutex is created or fetched under the outer map lock, so two
//! tasks racing on a fresh key always end up contending on the same mutex.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct KeyedLock<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the mutex for a key, creating it if needed
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().await;
            Arc::clone(
                locks
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serialises() {
        let lock = Arc::new(KeyedLock::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let guard = lock.lock(&"k").await;

        let task = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _guard = lock.lock(&"k").await;
                order.lock().unwrap().push("second");
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        order.lock().unwrap().push("first");
        drop(guard);

        task.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_contend() {
        let lock = KeyedLock::new();
        let _a = lock.lock(&"a").await;
        // would deadlock if keys shared a mutex
        let _b = lock.lock(&"b").await;
    }
}
