use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Bounded map whose entries expire `ttl` after insertion.
///
/// Cloning shares the underlying storage.
pub struct ExpireCache<K, V> {
    inner: Arc<Mutex<HashMap<K, (V, Instant)>>>,
    capacity: usize,
    ttl: Duration,
}

impl<K, V> Clone for ExpireCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            capacity: self.capacity,
            ttl: self.ttl,
        }
    }
}

impl<K: Hash + Eq + Clone, V> ExpireCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::with_capacity(capacity.min(64)))),
            capacity: capacity.max(1),
            ttl,
        }
    }
    /// Inserts only when no live entry exists for `key`.
    /// Returns false for a duplicate.
    pub fn insert_if_absent(&self, key: K, value: V, now: Instant) -> bool {
        let mut guard = self.inner.lock();
        if let Some((_, deadline)) = guard.get(&key) {
            if *deadline > now {
                return false;
            }
        }
        Self::make_room(&mut guard, self.capacity, &key, now);
        guard.insert(key, (value, now + self.ttl));
        true
    }
    /// Inserts or replaces, returning the previous live value.
    pub fn insert(&self, key: K, value: V, now: Instant) -> Option<V> {
        let mut guard = self.inner.lock();
        Self::make_room(&mut guard, self.capacity, &key, now);
        guard
            .insert(key, (value, now + self.ttl))
            .and_then(|(v, deadline)| (deadline > now).then_some(v))
    }
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().remove(key).map(|(v, _)| v)
    }
    /// Removes and returns every expired entry.
    pub fn purge(&self, now: Instant) -> Vec<(K, V)> {
        let mut guard = self.inner.lock();
        let expired: Vec<K> = guard
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| guard.remove(&k).map(|(v, _)| (k, v)))
            .collect()
    }
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn make_room(map: &mut HashMap<K, (V, Instant)>, capacity: usize, key: &K, now: Instant) {
        if map.contains_key(key) || map.len() < capacity {
            return;
        }
        map.retain(|_, (_, deadline)| *deadline > now);
        if map.len() < capacity {
            return;
        }
        let oldest = map
            .iter()
            .min_by_key(|(_, (_, deadline))| *deadline)
            .map(|(k, _)| k.clone());
        if let Some(oldest) = oldest {
            log::debug!("cache full ({capacity}), evicting oldest entry");
            map.remove(&oldest);
        }
    }
}

impl<K: Hash + Eq + Clone, V: Clone> ExpireCache<K, V> {
    pub fn get(&self, key: &K, now: Instant) -> Option<V> {
        self.inner
            .lock()
            .get(key)
            .filter(|(_, deadline)| *deadline > now)
            .map(|(v, _)| v.clone())
    }
}
