//! State cache: per-item records over the LRU engine
//!
//! The cache keeps three co-indexed structures (records, their `updatedAt`
//! stamps, access order) inside one [`LruEngine`], plus a bounded tombstone
//! table remembering when ids were deleted. Every mutation happens inside a
//! single write-lock critical section with no await in between, so readers
//! never observe a half-applied update.

use crate::cache::{
    config::CacheConfig,
    lru::{AuxHandle, ConsistencyReport, LruEngine, RepairAction},
    types::CacheStats,
};
use crate::record::{now_millis, ItemState, Record};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The record is cached
    Hit(Record),
    /// The id was recently deleted or fetched as absent (normal state)
    KnownAbsent,
    /// Nothing is known about the id
    Unknown,
}

/// Everything the cache knew about one id at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub lookup: Lookup,
    /// Record stamp or deletion stamp
    pub stamp: Option<i64>,
}

/// Front-end cache of item records
///
/// Cloning is cheap and every clone shares the same storage.
#[derive(Clone)]
pub struct StateCache {
    config: CacheConfig,
    store: Arc<RwLock<CacheState>>,
}

struct CacheState {
    engine: LruEngine<Record>,
    timestamps: AuxHandle,
    tombstones: HashMap<String, i64>,
    stats: CacheStats,
}

impl CacheState {
    fn known_timestamp(&self, id: &str) -> Option<i64> {
        self.engine
            .aux_value(self.timestamps, id)
            .or_else(|| self.tombstones.get(id).copied())
    }

    /// Current knowledge about `id`, leaving access order and counters alone
    fn snapshot(&self, id: &str) -> Snapshot {
        let lookup = match self.engine.peek(id) {
            Some(record) => Lookup::Hit(record.clone()),
            None if self.tombstones.contains_key(id) => Lookup::KnownAbsent,
            None => Lookup::Unknown,
        };
        Snapshot {
            lookup,
            stamp: self.known_timestamp(id),
        }
    }

    fn apply_update(&mut self, config: &CacheConfig, id: &str, record: Option<Record>) {
        match record {
            Some(mut record) if record.state.is_stored() => {
                let stamp = record.timestamp().unwrap_or_else(now_millis);
                record.updated_at = stamp;

                self.engine.insert(id, record);
                self.engine.set_aux(self.timestamps, id, stamp);
                self.tombstones.remove(id);
                self.engine.touch(id);

                let evicted = self.engine.evict_over_capacity();
                if config.enable_metrics {
                    self.stats.evictions += evicted.len() as u64;
                }
            }
            // The normal state is never stored, only remembered as absence
            Some(record) => {
                let stamp = record.timestamp().unwrap_or_else(now_millis);
                self.tombstone(config, id, stamp);
            }
            None => self.tombstone(config, id, now_millis()),
        }
        self.refresh_counts();
    }

    fn tombstone(&mut self, config: &CacheConfig, id: &str, stamp: i64) {
        let stamp = self.known_timestamp(id).map_or(stamp, |prev| prev.max(stamp));
        self.engine.remove(id);
        self.tombstones.insert(id.to_string(), stamp);
        self.trim_tombstones(config.tombstone_capacity);
    }

    /// Put `snapshot` back exactly, stamps included
    fn restore(&mut self, config: &CacheConfig, id: &str, snapshot: &Snapshot) {
        match &snapshot.lookup {
            Lookup::Hit(record) => self.apply_update(config, id, Some(record.clone())),
            Lookup::KnownAbsent => {
                self.engine.remove(id);
                self.tombstones
                    .insert(id.to_string(), snapshot.stamp.unwrap_or_else(now_millis));
                self.trim_tombstones(config.tombstone_capacity);
                self.refresh_counts();
            }
            Lookup::Unknown => {
                self.engine.remove(id);
                self.tombstones.remove(id);
                self.refresh_counts();
            }
        }
    }

    fn merge_fetched(&mut self, config: &CacheConfig, id: &str, record: Option<Record>) -> bool {
        let incoming = record.as_ref().and_then(Record::timestamp).unwrap_or(0);

        if let Some(known) = self.known_timestamp(id) {
            if incoming <= known {
                debug!(
                    "Rejecting stale merge for {} (incoming {}, known {})",
                    id, incoming, known
                );
                self.engine.touch(id);
                if config.enable_metrics {
                    self.stats.stale_merges += 1;
                }
                return false;
            }
        }

        self.apply_update(config, id, record);
        if config.enable_metrics {
            self.stats.accepted_merges += 1;
        }
        true
    }

    fn trim_tombstones(&mut self, capacity: usize) {
        if self.tombstones.len() <= capacity {
            return;
        }
        let excess = self.tombstones.len() - capacity;
        let mut oldest: Vec<(i64, String)> = self
            .tombstones
            .iter()
            .map(|(id, stamp)| (*stamp, id.clone()))
            .collect();
        oldest.sort_unstable();
        for (_, id) in oldest.into_iter().take(excess) {
            self.tombstones.remove(&id);
        }
    }

    fn refresh_counts(&mut self) {
        self.stats.entries = self.engine.len();
        self.stats.tombstones = self.tombstones.len();
    }
}

impl StateCache {
    /// Create a new cache with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        info!("Initializing state cache with config: {:?}", config);

        let mut engine = LruEngine::new(config.capacity);
        let timestamps = engine.add_aux_index("timestamps");

        let state = CacheState {
            engine,
            timestamps,
            tombstones: HashMap::new(),
            stats: CacheStats::default(),
        };

        Self {
            config,
            store: Arc::new(RwLock::new(state)),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Unconditional write. `None` deletes the record and stamps the id so
    /// that older fetch results for it are rejected later.
    pub async fn apply_update(&self, id: &str, record: Option<Record>) {
        let mut state = self.store.write().await;
        state.apply_update(&self.config, id, record);
        debug!("Applied update for {}", id);
    }

    /// Write a locally originated state change. The new stamp is strictly
    /// newer than anything known for `id`. Returns the snapshot it replaced
    /// and the stamp it wrote; both are taken under the same lock as the
    /// write.
    pub async fn apply_local(&self, id: &str, state: ItemState, title: &str) -> (Snapshot, i64) {
        let mut guard = self.store.write().await;
        let prior = guard.snapshot(id);

        let now = now_millis();
        let stamp = prior.stamp.map_or(now, |known| now.max(known + 1));
        let record = Record::new(id, state, title).with_updated_at(stamp);
        guard.apply_update(&self.config, id, Some(record));

        debug!("Applied local {} -> {} at {}", id, state, stamp);
        (prior, stamp)
    }

    /// Overwrite `id` only while its known stamp is still `expected`.
    /// Returns `false` and leaves the cache untouched otherwise.
    pub async fn replace_if_current(&self, id: &str, expected: i64, record: Option<Record>) -> bool {
        let mut state = self.store.write().await;
        if state.known_timestamp(id) != Some(expected) {
            return false;
        }
        state.apply_update(&self.config, id, record);
        true
    }

    /// Put a snapshot back while the known stamp for `id` is still
    /// `expected`. An `Unknown` snapshot forgets the id entirely.
    pub async fn restore_if_current(&self, id: &str, expected: i64, snapshot: &Snapshot) -> bool {
        let mut state = self.store.write().await;
        if state.known_timestamp(id) != Some(expected) {
            return false;
        }
        state.restore(&self.config, id, snapshot);
        true
    }

    /// Conditional write for results arriving from the authoritative side.
    /// Returns `false` if the result was older than (or as old as) what is
    /// already known for the id.
    pub async fn merge_fetched(&self, id: &str, record: Option<Record>) -> bool {
        let mut state = self.store.write().await;
        state.merge_fetched(&self.config, id, record)
    }

    /// Merge several fetch results under one lock acquisition
    pub async fn merge_fetched_many(
        &self,
        results: impl IntoIterator<Item = (String, Option<Record>)>,
    ) -> usize {
        let mut state = self.store.write().await;
        results
            .into_iter()
            .filter(|(id, record)| state.merge_fetched(&self.config, id, record.clone()))
            .count()
    }

    /// Get a record. Only a hit refreshes the access time.
    pub async fn get(&self, id: &str) -> Option<Record> {
        match self.lookup(id).await {
            Lookup::Hit(record) => Some(record),
            Lookup::KnownAbsent | Lookup::Unknown => None,
        }
    }

    /// Get a record, distinguishing known-absent ids from unknown ones
    pub async fn lookup(&self, id: &str) -> Lookup {
        let mut state = self.store.write().await;

        if let Some(record) = state.engine.peek(id).cloned() {
            state.engine.touch(id);
            if self.config.enable_metrics {
                state.stats.hits += 1;
            }
            debug!("Cache hit: {}", id);
            return Lookup::Hit(record);
        }

        if state.tombstones.contains_key(id) {
            if self.config.enable_metrics {
                state.stats.negative_hits += 1;
            }
            debug!("Cache hit (known absent): {}", id);
            Lookup::KnownAbsent
        } else {
            if self.config.enable_metrics {
                state.stats.misses += 1;
            }
            debug!("Cache miss: {}", id);
            Lookup::Unknown
        }
    }

    /// Read a record without refreshing its access time
    pub async fn peek(&self, id: &str) -> Option<Record> {
        let state = self.store.read().await;
        state.engine.peek(id).cloned()
    }

    /// Check if an id has a cached record (without updating access time)
    pub async fn has(&self, id: &str) -> bool {
        let state = self.store.read().await;
        state.engine.contains(id)
    }

    /// Last known `updatedAt` for an id, including deletion stamps
    pub async fn known_timestamp(&self, id: &str) -> Option<i64> {
        let state = self.store.read().await;
        state.known_timestamp(id)
    }

    /// Whether `id` currently has an access-order entry
    pub async fn is_tracked(&self, id: &str) -> bool {
        let state = self.store.read().await;
        state.engine.access_stamp(id).is_some()
    }

    /// Number of cached records
    pub async fn size(&self) -> usize {
        let state = self.store.read().await;
        state.engine.len()
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let state = self.store.read().await;
        state.stats.clone()
    }

    /// Audit the index invariants
    pub async fn validate(&self) -> ConsistencyReport {
        let state = self.store.read().await;
        state.engine.validate_consistency()
    }

    /// Repair every detected index inconsistency
    pub async fn repair(&self) -> Vec<RepairAction> {
        let mut state = self.store.write().await;
        let actions = state.engine.repair_consistency();
        state.refresh_counts();
        actions
    }

    /// Clear all records, stamps and counters
    pub async fn clear(&self) {
        let mut state = self.store.write().await;

        let count = state.engine.len();
        state.engine.clear();
        state.tombstones.clear();
        state.stats = CacheStats::default();

        info!("Cleared {} records from state cache", count);
    }
}
