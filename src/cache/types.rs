//! Counters kept by the state cache

use serde::{Deserialize, Serialize};
use std::fmt;

/// Snapshot of [`crate::cache::StateCache`] counters
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered with a cached record
    pub hits: u64,

    /// Lookups answered from a deletion stamp (known to have no record)
    pub negative_hits: u64,

    /// Lookups that need a fetch
    pub misses: u64,

    pub entries: usize,
    pub tombstones: usize,
    pub evictions: u64,

    /// Fetch results written to the cache
    pub accepted_merges: u64,

    /// Fetch results dropped because the cache already knew a newer stamp
    pub stale_merges: u64,
}

impl CacheStats {
    pub fn lookups(&self) -> u64 {
        self.hits + self.negative_hits + self.misses
    }

    /// Percentage of lookups answered without a fetch
    pub fn hit_rate(&self) -> f64 {
        match self.lookups() {
            0 => 0.0,
            total => (self.hits + self.negative_hits) as f64 * 100.0 / total as f64,
        }
    }

    /// Percentage of merged fetch results that arrived out of date
    pub fn stale_rate(&self) -> f64 {
        match self.accepted_merges + self.stale_merges {
            0 => 0.0,
            total => self.stale_merges as f64 * 100.0 / total as f64,
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records, {} tombstones | lookups {} (hit {:.1}%) | evicted {} | merges {} ok / {} stale",
            self.entries,
            self.tombstones,
            self.lookups(),
            self.hit_rate(),
            self.evictions,
            self.accepted_merges,
            self.stale_merges
        )
    }
}
