//! Two-queue (2Q) cache built on `lru::LruCache`.
//!
//! New keys enter the A1in FIFO. Keys evicted from A1in are remembered in
//! the A1out ghost list; a key that comes back while it is still remembered
//! goes straight to the Am LRU. A1in plus Am never hold more than the
//! configured capacity.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;

pub struct TwoQueueCache<K: Hash + Eq, V> {
    a1in: LruCache<K, V>,
    a1out: LruCache<K, ()>,
    am: LruCache<K, V>,
    capacity: usize,
    in_capacity: usize,
}

impl<K: Hash + Eq + Clone, V> TwoQueueCache<K, V> {
    /// Creates a cache holding at most `capacity` entries.
    pub fn new(capacity: usize, in_ratio: f64, out_ratio: f64) -> Self {
        let capacity = capacity.max(2);
        let in_capacity = ((capacity as f64 * in_ratio) as usize).clamp(1, capacity - 1);
        let out_capacity = NonZeroUsize::new((capacity as f64 * out_ratio) as usize).unwrap_or(NonZeroUsize::MIN);
        Self {
            a1in: LruCache::unbounded(),
            a1out: LruCache::new(out_capacity),
            am: LruCache::unbounded(),
            capacity,
            in_capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.a1in.len() + self.am.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &K) -> bool {
        self.a1in.contains(key) || self.am.contains(key)
    }

    /// Looks an entry up, refreshing it if it lives in Am.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.a1in.contains(key) {
            return self.a1in.peek(key);
        }
        self.am.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.a1in.contains(key) {
            return self.a1in.peek_mut(key);
        }
        self.am.get_mut(key)
    }

    /// Looks an entry up without touching the queues.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.a1in.peek(key).or_else(|| self.am.peek(key))
    }

    /// Inserts or replaces an entry; returns the entries evicted to make
    /// room.
    pub fn insert(&mut self, key: K, value: V) -> Vec<(K, V)> {
        if let Some(slot) = self.am.get_mut(&key) {
            *slot = value;
            return Vec::new();
        }
        if let Some(slot) = self.a1in.peek_mut(&key) {
            *slot = value;
            return Vec::new();
        }

        let mut evicted = Vec::new();
        if self.a1out.pop(&key).is_some() {
            self.am.put(key, value);
        } else {
            self.a1in.put(key, value);
            while self.a1in.len() > self.in_capacity {
                if let Some((old_key, old_value)) = self.a1in.pop_lru() {
                    self.a1out.put(old_key.clone(), ());
                    evicted.push((old_key, old_value));
                }
            }
        }
        while self.len() > self.capacity {
            let victim = if self.am.is_empty() {
                self.a1in.pop_lru()
            } else {
                self.am.pop_lru()
            };
            match victim {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.a1in.pop(key).or_else(|| self.am.pop(key))
    }

    /// Removes every entry, forgetting the ghost list as well.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let mut entries = Vec::with_capacity(self.len());
        while let Some(entry) = self.a1in.pop_lru() {
            entries.push(entry);
        }
        while let Some(entry) = self.am.pop_lru() {
            entries.push(entry);
        }
        self.a1out.clear();
        entries
    }

    pub fn keys(&self) -> Vec<K> {
        self.a1in
            .iter()
            .chain(self.am.iter())
            .map(|(k, _)| k.clone())
            .collect()
    }
}
