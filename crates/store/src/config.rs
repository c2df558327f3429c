//! Store configuration.

use memoria_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Configuration of a [`MemoryStore`](crate::MemoryStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Block size used by `create_block` when the caller passes 0.
    pub block_size: usize,
    /// Retention capacity of each snapshot's block cache, in entries.
    pub cache_capacity: usize,
    /// Share of the cache capacity given to the A1in FIFO.
    pub cache_in_ratio: f64,
    /// Size of the A1out ghost list relative to the cache capacity.
    pub cache_out_ratio: f64,
    /// Fan-out of persistent tree nodes.
    pub ptree_branching: usize,
    /// Log snapshot lifecycle events at info level.
    pub dump_snapshot_lifecycle: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            cache_capacity: 1024,
            cache_in_ratio: 0.25,
            cache_out_ratio: 0.5,
            ptree_branching: 32,
            dump_snapshot_lifecycle: false,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_cache_ratios(mut self, in_ratio: f64, out_ratio: f64) -> Self {
        self.cache_in_ratio = in_ratio;
        self.cache_out_ratio = out_ratio;
        self
    }

    pub fn with_ptree_branching(mut self, branching: usize) -> Self {
        self.ptree_branching = branching;
        self
    }

    pub fn with_dump_snapshot_lifecycle(mut self, enabled: bool) -> Self {
        self.dump_snapshot_lifecycle = enabled;
        self
    }

    /// Checks that every setting is in range.
    pub fn validate(&self) -> Result<()> {
        if self.block_size < 512 || self.block_size % 8 != 0 {
            return Err(Error::invalid_operation(format!(
                "block_size must be a multiple of 8 and at least 512, got {}",
                self.block_size
            )));
        }
        if self.cache_capacity < 4 {
            return Err(Error::invalid_operation(format!(
                "cache_capacity must be at least 4, got {}",
                self.cache_capacity
            )));
        }
        if !(self.cache_in_ratio > 0.0 && self.cache_in_ratio < 1.0) {
            return Err(Error::invalid_operation(format!(
                "cache_in_ratio must be in (0, 1), got {}",
                self.cache_in_ratio
            )));
        }
        if !(self.cache_out_ratio > 0.0 && self.cache_out_ratio <= 1.0) {
            return Err(Error::invalid_operation(format!(
                "cache_out_ratio must be in (0, 1], got {}",
                self.cache_out_ratio
            )));
        }
        if self.ptree_branching < 4 {
            return Err(Error::invalid_operation(format!(
                "ptree_branching must be at least 4, got {}",
                self.ptree_branching
            )));
        }
        Ok(())
    }
}
