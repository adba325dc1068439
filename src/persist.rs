//! Persistent store interface and an in-memory implementation
//!
//! The authoritative side keeps records in a [`PersistentStore`]. Engines
//! provide their own atomicity; only the [`crate::batcher::WriteBatcher`]
//! writes to it.

use crate::error::{Result, SyncError};
use crate::protocol::{Page, PageRequest, StoreStats};
use crate::record::{ItemState, Record};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Authoritative record storage
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Write many records at once. A record in the normal state deletes
    /// any stored record for its id.
    async fn bulk_upsert(&self, records: Vec<Record>) -> Result<()>;

    /// Fetch stored records; unknown ids are missing from the map
    async fn get_by_ids(&self, ids: &[String]) -> Result<HashMap<String, Record>>;

    /// One page of records ordered by `updated_at` descending
    async fn get_page(&self, request: PageRequest) -> Result<Page>;

    /// Delete the `count` records with the oldest `updated_at`
    async fn delete_oldest(&self, count: usize) -> Result<usize>;

    /// Record counts per state
    async fn stats(&self) -> Result<StoreStats>;

    /// Delete everything
    async fn clear(&self) -> Result<()>;
}

/// Newest first; ties ordered by id so pages are stable
fn newest_first(a: &Record, b: &Record) -> Ordering {
    b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id))
}

fn encode_cursor(record: &Record) -> String {
    format!("{}:{}", record.updated_at, record.id)
}

fn decode_cursor(cursor: &str) -> Result<(i64, String)> {
    let (stamp, id) = cursor
        .split_once(':')
        .ok_or_else(|| SyncError::Protocol(format!("invalid cursor: {}", cursor)))?;
    let stamp = stamp
        .parse::<i64>()
        .map_err(|_| SyncError::Protocol(format!("invalid cursor: {}", cursor)))?;
    Ok((stamp, id.to_string()))
}

/// In-memory [`PersistentStore`]
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn bulk_upsert(&self, records: Vec<Record>) -> Result<()> {
        let mut stored = self.records.write().await;
        let count = records.len();
        for record in records {
            if record.state.is_stored() {
                stored.insert(record.id.clone(), record);
            } else {
                stored.remove(&record.id);
            }
        }
        debug!("Persisted {} records ({} stored)", count, stored.len());
        Ok(())
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<HashMap<String, Record>> {
        let stored = self.records.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| stored.get(id).map(|r| (id.clone(), r.clone())))
            .collect())
    }

    async fn get_page(&self, request: PageRequest) -> Result<Page> {
        let limit = request.limit.max(1);
        let after = request.cursor.as_deref().map(decode_cursor).transpose()?;

        let stored = self.records.read().await;
        let mut ordered: Vec<&Record> = stored.values().collect();
        ordered.sort_by(|a, b| newest_first(a, b));

        let remaining: Vec<&Record> = match &after {
            Some((stamp, id)) => ordered
                .into_iter()
                .filter(|r| r.updated_at < *stamp || (r.updated_at == *stamp && r.id > *id))
                .collect(),
            None => ordered,
        };

        let has_more = remaining.len() > limit;
        let items: Vec<Record> = remaining.into_iter().take(limit).cloned().collect();
        let next_cursor = if has_more {
            items.last().map(encode_cursor)
        } else {
            None
        };

        Ok(Page {
            items,
            has_more,
            next_cursor,
        })
    }

    async fn delete_oldest(&self, count: usize) -> Result<usize> {
        let mut stored = self.records.write().await;
        let mut ordered: Vec<(i64, String)> = stored
            .values()
            .map(|r| (r.updated_at, r.id.clone()))
            .collect();
        ordered.sort();

        let victims: Vec<String> = ordered.into_iter().take(count).map(|(_, id)| id).collect();
        for id in &victims {
            stored.remove(id);
        }
        info!("Deleted {} oldest records", victims.len());
        Ok(victims.len())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let stored = self.records.read().await;
        let mut stats = StoreStats {
            total: stored.len(),
            ..Default::default()
        };
        for record in stored.values() {
            match record.state {
                ItemState::Hidden => stats.hidden += 1,
                ItemState::Dimmed => stats.dimmed += 1,
                ItemState::Normal => {}
            }
        }
        Ok(stats)
    }

    async fn clear(&self) -> Result<()> {
        let mut stored = self.records.write().await;
        let count = stored.len();
        stored.clear();
        info!("Cleared {} records from store", count);
        Ok(())
    }
}
