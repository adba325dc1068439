//! Authoritative side of the boundary channel
//!
//! [`StateService`] answers boundary requests from the persistent store.
//! All writes go through the [`WriteBatcher`]; reads overlay writes that are
//! still pending so callers always see their own updates.

use crate::batcher::WriteBatcher;
use crate::classify::Failure;
use crate::error::Result;
use crate::messaging::Transport;
use crate::persist::PersistentStore;
use crate::protocol::{
    Envelope, GetManyResponse, HealthResponse, Page, PageRequest, Request, SetStateResponse,
    StoreStats,
};
use crate::record::{now_millis, ItemState, Record};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default cap on stored records
pub const DEFAULT_MAX_STORED_RECORDS: usize = 50_000;

/// Request handler for the authoritative side
#[derive(Clone)]
pub struct StateService {
    store: Arc<dyn PersistentStore>,
    batcher: WriteBatcher,
    max_records: usize,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl StateService {
    pub fn new(store: Arc<dyn PersistentStore>, batcher: WriteBatcher, max_records: usize) -> Self {
        Self {
            store,
            batcher,
            max_records,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn batcher(&self) -> &WriteBatcher {
        &self.batcher
    }

    /// Handle one request. Failures become `ok: false` envelopes.
    pub async fn handle(&self, request: Request) -> Envelope {
        let name = request.name();
        debug!("Handling {} request", name);

        let outcome = match request {
            Request::Health => Envelope::success(&self.health().await),
            Request::GetMany { ids } => match self.get_many(&ids).await {
                Ok(records) => Envelope::success(&GetManyResponse { records }),
                Err(e) => Err(e),
            },
            Request::SetState { id, state, title } => match self.set_state(&id, state, &title).await {
                Ok(record) => Envelope::success(&SetStateResponse { record }),
                Err(e) => Err(e),
            },
            Request::GetPage(page) => match self.get_page(page).await {
                Ok(page) => Envelope::success(&page),
                Err(e) => Err(e),
            },
            Request::Stats => match self.stats().await {
                Ok(stats) => Envelope::success(&stats),
                Err(e) => Err(e),
            },
            Request::Clear => match self.clear().await {
                Ok(()) => Envelope::success(&serde_json::Value::Null),
                Err(e) => Err(e),
            },
        };

        outcome.unwrap_or_else(|e| {
            warn!("{} request failed: {}", name, e);
            Envelope::failure(e.to_string())
        })
    }

    /// Readiness of the persistent store
    pub async fn health(&self) -> HealthResponse {
        match self.store.stats().await {
            Ok(_) => HealthResponse {
                ready: true,
                error: None,
            },
            Err(e) => HealthResponse {
                ready: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Stored records for `ids`, with pending writes applied on top
    pub async fn get_many(&self, ids: &[String]) -> Result<HashMap<String, Record>> {
        let mut records = self.store.get_by_ids(ids).await?;
        for id in ids {
            if let Some(pending) = self.batcher.pending_record(id) {
                if pending.state.is_stored() {
                    records.insert(id.clone(), pending);
                } else {
                    records.remove(id);
                }
            }
        }
        Ok(records)
    }

    /// Queue a state change. The record is stamped strictly after any
    /// earlier stamp seen for the id. Returns `None` for the normal state.
    pub async fn set_state(&self, id: &str, state: ItemState, title: &str) -> Result<Option<Record>> {
        let _serial = self.write_lock.lock().await;

        let previous = match self.batcher.pending_record(id) {
            Some(pending) => Some(pending.updated_at),
            None => self
                .store
                .get_by_ids(&[id.to_string()])
                .await?
                .get(id)
                .map(|r| r.updated_at),
        };
        let stamp = previous.map_or_else(now_millis, |prev| now_millis().max(prev + 1));

        let record = Record::new(id, state, title).with_updated_at(stamp);
        if let Err(e) = self.batcher.queue(id, record.clone()).await {
            // The write stays queued and the idle timer retries the flush
            warn!("Flush after queuing {} failed: {}", id, e);
        }

        debug!("Queued {} -> {} at {}", id, state, stamp);
        Ok(state.is_stored().then_some(record))
    }

    /// One page of records, newest first
    pub async fn get_page(&self, request: PageRequest) -> Result<Page> {
        self.batcher.force_flush().await?;
        self.store.get_page(request).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.batcher.force_flush().await?;
        self.store.stats().await
    }

    /// Persist pending writes, then drop every stored record
    pub async fn clear(&self) -> Result<()> {
        let _serial = self.write_lock.lock().await;
        self.batcher.force_flush().await?;
        self.store.clear().await?;
        info!("Cleared persistent store");
        Ok(())
    }

    /// Delete the oldest records beyond the configured cap
    pub async fn prune(&self) -> Result<usize> {
        let stats = self.stats().await?;
        if stats.total <= self.max_records {
            return Ok(0);
        }
        let excess = stats.total - self.max_records;
        let deleted = self.store.delete_oldest(excess).await?;
        info!("Pruned {} records (cap {})", deleted, self.max_records);
        Ok(deleted)
    }
}

/// Background task enforcing the record cap
pub async fn start_auto_prune(service: StateService, interval: Duration) {
    info!("Starting automatic prune task (interval: {:?})", interval);

    loop {
        tokio::time::sleep(interval).await;

        match service.prune().await {
            Ok(deleted) => {
                if deleted > 0 {
                    debug!("Auto prune: {} records", deleted);
                }
            }
            Err(e) => {
                warn!("Auto prune failed: {}", e);
            }
        }
    }
}

/// In-process [`Transport`] that serializes each message across the
/// boundary the way an inter-context channel would
#[derive(Clone)]
pub struct LocalTransport {
    service: StateService,
}

impl LocalTransport {
    pub fn new(service: StateService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, request: Request) -> std::result::Result<Envelope, Failure> {
        let wire = serde_json::to_string(&request)
            .map_err(|e| Failure::named("DataError", e.to_string()))?;
        let request: Request =
            serde_json::from_str(&wire).map_err(|e| Failure::named("DataError", e.to_string()))?;

        let envelope = self.service.handle(request).await;

        let wire = serde_json::to_string(&envelope)
            .map_err(|e| Failure::named("DataError", e.to_string()))?;
        serde_json::from_str(&wire).map_err(|e| Failure::named("DataError", e.to_string()))
    }
}
