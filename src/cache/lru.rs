//! Bounded least-recently-used eviction over co-indexed maps
//!
//! [`LruEngine`] owns one id-keyed value index, an access-order index used
//! only for ranking eviction victims, and any number of auxiliary indexes
//! registered with [`LruEngine::add_aux_index`]. All of them are mutated
//! together so that:
//!
//! - the access-order key set is always a subset of the value key set
//! - every auxiliary index has the same key set as the value index
//! - the value index never holds more than `capacity` entries once an
//!   insert and its eviction pass have completed
//!
//! Access times are taken from a per-engine monotonic counter rather than
//! the wall clock, so two touches in the same millisecond still rank.

use crate::record::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Handle to an auxiliary index registered on an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuxHandle(usize);

#[derive(Debug)]
struct AuxIndex {
    name: String,
    entries: HashMap<String, i64>,
}

/// One detected invariant violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsistencyViolation {
    /// An auxiliary index does not have as many entries as the value index
    SizeMismatch {
        index: String,
        expected: usize,
        actual: usize,
    },
    /// The access-order index is larger than the value index
    AccessOverflow { values: usize, access: usize },
    /// A cached id has no entry in an auxiliary index
    MissingFromAux { index: String, id: String },
    /// An auxiliary index holds an id that is not cached
    OrphanedAux { index: String, id: String },
    /// The access-order index holds an id that is not cached
    OrphanedAccess { id: String },
}

/// Result of [`LruEngine::validate_consistency`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub violations: Vec<ConsistencyViolation>,
    pub value_count: usize,
    pub access_count: usize,
    pub aux_counts: Vec<(String, usize)>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Corrective action taken by [`LruEngine::repair_consistency`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RepairAction {
    RemovedOrphanedAccess { id: String },
    RemovedOrphanedAux { index: String, id: String },
    BackfilledAux { index: String, id: String, value: i64 },
}

/// Holds the eviction flag for one pass and clears it on every exit path
struct EvictionGuard<'a>(&'a mut bool);

impl<'a> EvictionGuard<'a> {
    /// `None` if a pass already holds the flag
    fn engage(flag: &'a mut bool) -> Option<Self> {
        if *flag {
            return None;
        }
        *flag = true;
        Some(Self(flag))
    }
}

impl Drop for EvictionGuard<'_> {
    fn drop(&mut self) {
        *self.0 = false;
    }
}

/// Generic LRU eviction engine
#[derive(Debug)]
pub struct LruEngine<V> {
    capacity: usize,
    values: HashMap<String, V>,
    access: HashMap<String, u64>,
    aux: Vec<AuxIndex>,
    clock: u64,
    evicting: bool,
}

impl<V> LruEngine<V> {
    /// Create an engine holding at most `capacity` values
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            values: HashMap::new(),
            access: HashMap::new(),
            aux: Vec::new(),
            clock: 0,
            evicting: false,
        }
    }

    /// Register an auxiliary index kept same-keyed with the value index
    pub fn add_aux_index(&mut self, name: impl Into<String>) -> AuxHandle {
        self.aux.push(AuxIndex {
            name: name.into(),
            entries: HashMap::new(),
        });
        AuxHandle(self.aux.len() - 1)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.values.contains_key(id)
    }

    /// Read a value without refreshing its access time
    pub fn peek(&self, id: &str) -> Option<&V> {
        self.values.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    /// Access stamp of `id`, if it has one
    pub fn access_stamp(&self, id: &str) -> Option<u64> {
        self.access.get(id).copied()
    }

    pub fn access_len(&self) -> usize {
        self.access.len()
    }

    pub fn aux_value(&self, handle: AuxHandle, id: &str) -> Option<i64> {
        self.aux.get(handle.0).and_then(|a| a.entries.get(id).copied())
    }

    /// Write a value. Callers follow with the auxiliary writes, a touch and
    /// an eviction pass before releasing their critical section.
    pub fn insert(&mut self, id: impl Into<String>, value: V) -> Option<V> {
        self.values.insert(id.into(), value)
    }

    /// Set an auxiliary value for a cached id. Returns `false` (and writes
    /// nothing) if the id is not cached.
    pub fn set_aux(&mut self, handle: AuxHandle, id: &str, value: i64) -> bool {
        if !self.values.contains_key(id) {
            return false;
        }
        match self.aux.get_mut(handle.0) {
            Some(index) => {
                index.entries.insert(id.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Record an access for `id`. Ids that are not cached are ignored so the
    /// access-order index can never hold orphans.
    pub fn touch(&mut self, id: &str) -> bool {
        if !self.values.contains_key(id) {
            debug!("Ignoring touch for uncached id: {}", id);
            return false;
        }
        self.clock += 1;
        self.access.insert(id.to_string(), self.clock);
        true
    }

    /// Drop the access stamp of `id` without touching its value
    pub fn forget_access(&mut self, id: &str) {
        self.access.remove(id);
    }

    /// Remove `id` from every index
    pub fn remove(&mut self, id: &str) -> Option<V> {
        purge(&mut self.values, &mut self.access, &mut self.aux, id)
    }

    /// Evict least recently accessed entries until the value index fits in
    /// `capacity`. Returns the evicted ids, oldest first.
    pub fn evict_over_capacity(&mut self) -> Vec<String> {
        if self.values.len() <= self.capacity {
            return Vec::new();
        }
        let Some(_guard) = EvictionGuard::engage(&mut self.evicting) else {
            debug!("Eviction already in progress, skipping");
            return Vec::new();
        };

        let excess = self.values.len() - self.capacity;

        // Ids without an access stamp rank as oldest; ties break on id
        let mut ranked: Vec<(u64, &String)> = self
            .values
            .keys()
            .map(|id| (self.access.get(id).copied().unwrap_or(0), id))
            .collect();
        ranked.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));

        let victims: Vec<String> = ranked
            .into_iter()
            .take(excess)
            .map(|(_, id)| id.clone())
            .collect();

        for id in &victims {
            purge(&mut self.values, &mut self.access, &mut self.aux, id);
        }

        debug!(
            "Evicted {} entries (capacity {}, size now {})",
            victims.len(),
            self.capacity,
            self.values.len()
        );
        victims
    }

    /// Whether an eviction pass currently holds the guard
    pub fn is_evicting(&self) -> bool {
        self.evicting
    }

    /// Read-only audit of the index invariants
    pub fn validate_consistency(&self) -> ConsistencyReport {
        let mut violations = Vec::new();
        let value_count = self.values.len();

        if self.access.len() > value_count {
            violations.push(ConsistencyViolation::AccessOverflow {
                values: value_count,
                access: self.access.len(),
            });
        }

        for id in self.access.keys() {
            if !self.values.contains_key(id) {
                violations.push(ConsistencyViolation::OrphanedAccess { id: id.clone() });
            }
        }

        for index in &self.aux {
            if index.entries.len() != value_count {
                violations.push(ConsistencyViolation::SizeMismatch {
                    index: index.name.clone(),
                    expected: value_count,
                    actual: index.entries.len(),
                });
            }
            for id in self.values.keys() {
                if !index.entries.contains_key(id) {
                    violations.push(ConsistencyViolation::MissingFromAux {
                        index: index.name.clone(),
                        id: id.clone(),
                    });
                }
            }
            for id in index.entries.keys() {
                if !self.values.contains_key(id) {
                    violations.push(ConsistencyViolation::OrphanedAux {
                        index: index.name.clone(),
                        id: id.clone(),
                    });
                }
            }
        }

        ConsistencyReport {
            violations,
            value_count,
            access_count: self.access.len(),
            aux_counts: self
                .aux
                .iter()
                .map(|a| (a.name.clone(), a.entries.len()))
                .collect(),
        }
    }

    /// Fix every violation [`validate_consistency`](Self::validate_consistency)
    /// can report. Missing auxiliary entries are backfilled with the current
    /// time.
    pub fn repair_consistency(&mut self) -> Vec<RepairAction> {
        let mut actions = Vec::new();

        let orphaned: Vec<String> = self
            .access
            .keys()
            .filter(|id| !self.values.contains_key(*id))
            .cloned()
            .collect();
        for id in orphaned {
            self.access.remove(&id);
            actions.push(RepairAction::RemovedOrphanedAccess { id });
        }

        let now = now_millis();
        for index in &mut self.aux {
            let orphaned: Vec<String> = index
                .entries
                .keys()
                .filter(|id| !self.values.contains_key(*id))
                .cloned()
                .collect();
            for id in orphaned {
                index.entries.remove(&id);
                actions.push(RepairAction::RemovedOrphanedAux {
                    index: index.name.clone(),
                    id,
                });
            }

            for id in self.values.keys() {
                if !index.entries.contains_key(id) {
                    index.entries.insert(id.clone(), now);
                    actions.push(RepairAction::BackfilledAux {
                        index: index.name.clone(),
                        id: id.clone(),
                        value: now,
                    });
                }
            }
        }

        if !actions.is_empty() {
            warn!("Repaired {} cache index inconsistencies", actions.len());
        }
        actions
    }

    /// Empty every index and release the eviction guard
    pub fn clear(&mut self) {
        self.values.clear();
        self.access.clear();
        for index in &mut self.aux {
            index.entries.clear();
        }
        self.evicting = false;
    }

    #[cfg(test)]
    pub(crate) fn corrupt_for_test(&mut self, handle: AuxHandle, id: &str) {
        self.access.insert(id.to_string(), 0);
        if let Some(index) = self.aux.get_mut(handle.0) {
            index.entries.insert(id.to_string(), 0);
        }
    }
}

fn purge<V>(
    values: &mut HashMap<String, V>,
    access: &mut HashMap<String, u64>,
    aux: &mut [AuxIndex],
    id: &str,
) -> Option<V> {
    access.remove(id);
    for index in aux.iter_mut() {
        index.entries.remove(id);
    }
    values.remove(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(capacity: usize) -> (LruEngine<u32>, AuxHandle) {
        let mut engine = LruEngine::new(capacity);
        let handle = engine.add_aux_index("timestamps");
        (engine, handle)
    }

    fn put(engine: &mut LruEngine<u32>, handle: AuxHandle, id: &str, value: u32) -> Vec<String> {
        engine.insert(id, value);
        engine.set_aux(handle, id, value as i64);
        engine.touch(id);
        engine.evict_over_capacity()
    }

    #[test]
    fn test_evicts_least_recently_touched() {
        let (mut engine, ts) = engine(3);
        put(&mut engine, ts, "a", 1);
        put(&mut engine, ts, "b", 2);
        put(&mut engine, ts, "c", 3);
        engine.touch("a");

        let evicted = put(&mut engine, ts, "d", 4);
        assert_eq!(evicted, vec!["b".to_string()]);
        assert!(engine.contains("a"));
        assert!(engine.contains("c"));
        assert!(engine.contains("d"));
        assert_eq!(engine.aux_value(ts, "b"), None);
        assert_eq!(engine.access_stamp("b"), None);
    }

    #[test]
    fn test_evicts_exactly_excess() {
        let (mut engine, ts) = engine(10);
        for i in 0..10 {
            put(&mut engine, ts, &format!("id{}", i), i);
        }
        engine.capacity = 4;
        let evicted = engine.evict_over_capacity();

        assert_eq!(evicted.len(), 6);
        assert_eq!(engine.len(), 4);
        for i in 0..6 {
            assert!(evicted.contains(&format!("id{}", i)));
        }
        assert!(engine.validate_consistency().is_consistent());
    }

    #[test]
    fn test_touch_ignores_uncached_ids() {
        let (mut engine, _) = engine(3);
        assert!(!engine.touch("ghost"));
        assert_eq!(engine.access_len(), 0);
    }

    #[test]
    fn test_set_aux_requires_cached_id() {
        let (mut engine, ts) = engine(3);
        assert!(!engine.set_aux(ts, "ghost", 1));
        assert!(engine.validate_consistency().is_consistent());
    }

    #[test]
    fn test_guard_skips_reentrant_eviction() {
        let (mut engine, ts) = engine(1);
        put(&mut engine, ts, "a", 1);
        engine.insert("b", 2);
        engine.set_aux(ts, "b", 2);
        engine.touch("b");

        engine.evicting = true;
        assert!(engine.evict_over_capacity().is_empty());
        assert_eq!(engine.len(), 2);

        engine.evicting = false;
        assert_eq!(engine.evict_over_capacity(), vec!["a".to_string()]);
        assert!(!engine.is_evicting());
    }

    #[test]
    fn test_clear_releases_guard() {
        let (mut engine, ts) = engine(2);
        put(&mut engine, ts, "a", 1);
        engine.evicting = true;

        engine.clear();
        assert!(!engine.is_evicting());
        assert!(engine.is_empty());
        assert_eq!(engine.access_len(), 0);
        assert_eq!(engine.aux_value(ts, "a"), None);
    }

    #[test]
    fn test_validate_and_repair() {
        let (mut engine, ts) = engine(5);
        put(&mut engine, ts, "a", 1);
        engine.insert("b", 2); // no aux, no access
        engine.corrupt_for_test(ts, "ghost");

        let report = engine.validate_consistency();
        assert!(!report.is_consistent());
        assert!(report
            .violations
            .contains(&ConsistencyViolation::OrphanedAccess { id: "ghost".into() }));
        assert!(report.violations.contains(&ConsistencyViolation::MissingFromAux {
            index: "timestamps".into(),
            id: "b".into()
        }));
        assert!(report.violations.contains(&ConsistencyViolation::OrphanedAux {
            index: "timestamps".into(),
            id: "ghost".into()
        }));
        assert_eq!(report.value_count, 2);

        let actions = engine.repair_consistency();
        assert_eq!(actions.len(), 3);
        assert!(engine.validate_consistency().is_consistent());
        assert!(engine.aux_value(ts, "b").unwrap() > 0);
    }
}
