//! Store statistics.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Block and cache counters of a store.
#[derive(Debug, Default)]
pub struct StoreStats {
    blocks_created: AtomicUsize,
    blocks_cloned: AtomicUsize,
    blocks_removed: AtomicUsize,
    blocks_reclaimed: AtomicUsize,
    cache_hits: AtomicUsize,
    cache_misses: AtomicUsize,
    cache_evictions: AtomicUsize,
}

/// Point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub blocks_created: usize,
    pub blocks_cloned: usize,
    pub blocks_removed: usize,
    pub blocks_reclaimed: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub cache_evictions: usize,
}

impl StoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_created(&self) {
        self.blocks_created.fetch_add(1, Ordering::Relaxed);
    }

    /// A block was cloned by copy-on-write or copied from another snapshot.
    pub fn record_cloned(&self) {
        self.blocks_cloned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_removed(&self) {
        self.blocks_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reclaimed(&self, count: usize) {
        self.blocks_reclaimed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: usize) {
        self.cache_evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            blocks_created: self.blocks_created.load(Ordering::Relaxed),
            blocks_cloned: self.blocks_cloned.load(Ordering::Relaxed),
            blocks_removed: self.blocks_removed.load(Ordering::Relaxed),
            blocks_reclaimed: self.blocks_reclaimed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = StoreStats::new();
        stats.record_created();
        stats.record_created();
        stats.record_cloned();
        stats.record_reclaimed(3);
        stats.record_hit();
        stats.record_miss();
        stats.record_evictions(2);

        let snap = stats.snapshot();
        assert_eq!(snap.blocks_created, 2);
        assert_eq!(snap.blocks_cloned, 1);
        assert_eq!(snap.blocks_removed, 0);
        assert_eq!(snap.blocks_reclaimed, 3);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.cache_evictions, 2);
    }
}
