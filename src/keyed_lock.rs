//! Per-key async mutexes whose entries go away once nobody holds or waits on them.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slots<K> = Arc<DashMap<K, Arc<Mutex<()>>>>;

pub struct KeyedLocks<K: Eq + Hash + Clone> {
    slots: Slots<K>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self { slots: Arc::new(DashMap::new()) }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let mutex = self.slots.entry(key.clone()).or_default().value().clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard { guard: Some(guard), key, slots: self.slots.clone() }
    }

    /// Keys with a live entry.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Releases the key on drop and removes its entry when no one else holds a handle.
pub struct KeyedGuard<K: Eq + Hash + Clone> {
    guard: Option<OwnedMutexGuard<()>>,
    key: K,
    slots: Slots<K>,
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        // the owned guard keeps its own handle on the mutex; release it first
        self.guard.take();
        self.slots.remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
