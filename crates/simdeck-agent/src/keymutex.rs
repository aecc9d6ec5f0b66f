//! Keyed exclusive lock.
//!
//! One async mutex per key, created on first use and kept for the life of
//! the process. Used to guarantee that at most one LPA session is open per
//! modem at a time.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct KeyMutex<K> {
    locks: Arc<DashMap<K, Arc<Mutex<()>>>>,
    /// Guards of currently held keys, for the explicit lock/unlock pair.
    held: Arc<DashMap<K, OwnedMutexGuard<()>>>,
}

impl<K> Clone for KeyMutex<K> {
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
            held: self.held.clone(),
        }
    }
}

impl<K> Default for KeyMutex<K>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyMutex<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            held: Arc::new(DashMap::new()),
        }
    }

    fn mutex_for(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait until `key` is free, then hold it until [`unlock`](Self::unlock).
    pub async fn lock(&self, key: K) {
        let guard = self.mutex_for(&key).lock_owned().await;
        self.held.insert(key, guard);
    }

    /// Release `key`.
    ///
    /// # Panics
    ///
    /// Panics if `key` is not currently held. An unpaired unlock is a
    /// programming error.
    pub fn unlock(&self, key: &K) {
        if self.held.remove(key).is_none() {
            panic!("unlock of unlocked key {key:?}");
        }
    }

    /// Wait until `key` is free and return a guard that releases it on drop.
    pub async fn lock_scoped(&self, key: K) -> KeyGuard<K> {
        self.lock(key.clone()).await;
        KeyGuard {
            mutex: self.clone(),
            key: Some(key),
        }
    }

    pub fn is_locked(&self, key: &K) -> bool {
        self.held.contains_key(key)
    }
}

/// Holds a key of a [`KeyMutex`] until dropped.
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct KeyGuard<K>
where
    K: Eq + Hash + Clone + Debug,
{
    mutex: KeyMutex<K>,
    key: Option<K>,
}

impl<K> KeyGuard<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }
}

impl<K> Drop for KeyGuard<K>
where
    K: Eq + Hash + Clone + Debug,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.mutex.unlock(&key);
        }
    }
}
