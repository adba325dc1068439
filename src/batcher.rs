//! Write-coalescing batcher in front of the persistent store
//!
//! Writes are buffered per id (a later write replaces an earlier pending
//! one) and handed to [`PersistentStore::bulk_upsert`] in one call when the
//! buffer reaches `max_batch_size`, or once `flush_delay` has passed since
//! the last queued write. Flushes are serialized, so the store sees writes
//! for one id in the order they were queued.

use crate::error::Result;
use crate::persist::PersistentStore;
use crate::record::Record;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration for the write batcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Flush as soon as this many ids are pending
    pub max_batch_size: usize,
    /// Flush after this much idle time since the last queued write
    pub flush_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            flush_delay: Duration::from_millis(100),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[derive(Default)]
struct PendingBatch {
    records: HashMap<String, Record>,
    /// Records handed to the store by the flush currently running
    flushing: HashMap<String, Record>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

struct BatcherInner {
    store: Arc<dyn PersistentStore>,
    config: BatchConfig,
    pending: Mutex<PendingBatch>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl BatcherInner {
    fn lock(&self) -> MutexGuard<'_, PendingBatch> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// (Re)start the idle timer. Any previous timer is cancelled.
    fn arm_timer(self: &Arc<Self>, pending: &mut PendingBatch) {
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        pending.generation += 1;

        let generation = pending.generation;
        let delay = self.config.flush_delay;
        let weak = Arc::downgrade(self);

        pending.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.flush_from_timer(generation).await;
            }
        }));
    }

    async fn flush_from_timer(self: Arc<Self>, generation: u64) {
        {
            let mut pending = self.lock();
            if pending.generation != generation {
                return;
            }
            // Detach rather than abort: this is the running task
            pending.timer.take();
        }

        debug!("Idle delay elapsed, flushing pending writes");
        if self.flush().await.is_err() {
            let mut pending = self.lock();
            if pending.timer.is_none() && !pending.records.is_empty() {
                self.arm_timer(&mut pending);
            }
        }
    }

    async fn flush(&self) -> Result<usize> {
        let _serial = self.flush_lock.lock().await;

        let batch = {
            let mut pending = self.lock();
            let batch = std::mem::take(&mut pending.records);
            pending.flushing = batch.clone();
            batch
        };

        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        let records: Vec<Record> = batch.values().cloned().collect();

        match self.store.bulk_upsert(records).await {
            Ok(()) => {
                self.lock().flushing.clear();
                info!("Flushed {} pending writes", count);
                Ok(count)
            }
            Err(e) => {
                let mut pending = self.lock();
                pending.flushing.clear();
                // Writes queued during the failed flush are newer and win
                for (id, record) in batch {
                    pending.records.entry(id).or_insert(record);
                }
                error!(
                    "Flush of {} writes failed, {} writes pending: {}",
                    count,
                    pending.records.len(),
                    e
                );
                Err(e)
            }
        }
    }
}

/// Buffers writes and persists them in bulk
#[derive(Clone)]
pub struct WriteBatcher {
    inner: Arc<BatcherInner>,
}

impl WriteBatcher {
    pub fn new(store: Arc<dyn PersistentStore>, config: BatchConfig) -> Self {
        info!("Initializing write batcher with config: {:?}", config);
        Self {
            inner: Arc::new(BatcherInner {
                store,
                config,
                pending: Mutex::new(PendingBatch::default()),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Queue a write for `id`, replacing any pending write for it. Flushes
    /// immediately when the batch is full; otherwise restarts the idle timer.
    pub async fn queue(&self, id: impl Into<String>, mut record: Record) -> Result<()> {
        let id = id.into();
        record.id = id.clone();

        let full = {
            let mut pending = self.inner.lock();
            pending.records.insert(id, record);

            let full = pending.records.len() >= self.inner.config.max_batch_size;
            if full {
                if let Some(timer) = pending.timer.take() {
                    timer.abort();
                }
            } else {
                self.inner.arm_timer(&mut pending);
            }
            full
        };

        if full {
            debug!("Batch size threshold reached, flushing");
            if let Err(e) = self.inner.flush().await {
                let mut pending = self.inner.lock();
                if pending.timer.is_none() {
                    self.inner.arm_timer(&mut pending);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Cancel the idle timer and persist everything pending now. Returns the
    /// number of records written; an empty batch is a no-op.
    pub async fn force_flush(&self) -> Result<usize> {
        {
            let mut pending = self.inner.lock();
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
        }
        self.inner.flush().await
    }

    /// Number of ids waiting to be flushed
    pub fn pending_count(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Most recent unpersisted write for `id`, including one being flushed
    pub fn pending_record(&self, id: &str) -> Option<Record> {
        let pending = self.inner.lock();
        pending
            .records
            .get(id)
            .or_else(|| pending.flushing.get(id))
            .cloned()
    }

    /// Flush before the batcher goes away
    pub async fn shutdown(&self) -> Result<usize> {
        let flushed = self.force_flush().await?;
        if self.pending_count() > 0 {
            warn!("{} writes still pending at shutdown", self.pending_count());
        }
        Ok(flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::persist::MemoryStore;
    use crate::protocol::{Page, PageRequest, StoreStats};
    use crate::record::ItemState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts bulk writes and fails the first `failures` of them
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        batches: Mutex<Vec<Vec<Record>>>,
        failures: AtomicUsize,
    }

    impl RecordingStore {
        fn failing(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                ..Default::default()
            }
        }

        fn batches(&self) -> Vec<Vec<Record>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PersistentStore for RecordingStore {
        async fn bulk_upsert(&self, records: Vec<Record>) -> Result<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(SyncError::Storage("transaction aborted".to_string()));
            }
            self.batches.lock().unwrap().push(records.clone());
            self.inner.bulk_upsert(records).await
        }
        async fn get_by_ids(&self, ids: &[String]) -> Result<HashMap<String, Record>> {
            self.inner.get_by_ids(ids).await
        }
        async fn get_page(&self, request: PageRequest) -> Result<Page> {
            self.inner.get_page(request).await
        }
        async fn delete_oldest(&self, count: usize) -> Result<usize> {
            self.inner.delete_oldest(count).await
        }
        async fn stats(&self) -> Result<StoreStats> {
            self.inner.stats().await
        }
        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }
    }

    fn record(id: &str, title: &str) -> Record {
        Record::new(id, ItemState::Hidden, title)
    }

    fn batcher(store: Arc<RecordingStore>, size: usize) -> WriteBatcher {
        WriteBatcher::new(
            store,
            BatchConfig {
                max_batch_size: size,
                flush_delay: Duration::from_millis(100),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_queued_write_wins() {
        let store = Arc::new(RecordingStore::default());
        let batcher = batcher(store.clone(), 10);

        batcher.queue("v1", record("v1", "first")).await.unwrap();
        batcher.queue("v1", record("v1", "second")).await.unwrap();
        assert_eq!(batcher.pending_count(), 1);

        assert_eq!(batcher.force_flush().await.unwrap(), 1);

        let batches = store.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].title, "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_flushes_immediately() {
        let store = Arc::new(RecordingStore::default());
        let batcher = batcher(store.clone(), 3);

        batcher.queue("a", record("a", "a")).await.unwrap();
        batcher.queue("b", record("b", "b")).await.unwrap();
        assert!(store.batches().is_empty());

        batcher.queue("c", record("c", "c")).await.unwrap();
        assert_eq!(batcher.pending_count(), 0);
        assert_eq!(store.batches().len(), 1);
        assert_eq!(store.batches()[0].len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_flushes() {
        let store = Arc::new(RecordingStore::default());
        let batcher = batcher(store.clone(), 10);

        batcher.queue("a", record("a", "a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.batches().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.batches().len(), 1);
        assert_eq!(batcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_restarts_idle_timer() {
        let store = Arc::new(RecordingStore::default());
        let batcher = batcher(store.clone(), 10);

        batcher.queue("a", record("a", "a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        batcher.queue("b", record("b", "b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.batches().is_empty());
        assert_eq!(batcher.pending_count(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.batches().len(), 1);
        assert_eq!(store.batches()[0].len(), 2);
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let store = Arc::new(RecordingStore::default());
        let batcher = batcher(store.clone(), 10);

        assert_eq!(batcher.force_flush().await.unwrap(), 0);
        assert!(store.batches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_keeps_data() {
        let store = Arc::new(RecordingStore::failing(1));
        let batcher = batcher(store.clone(), 10);

        batcher.queue("v1", record("v1", "first")).await.unwrap();
        assert!(batcher.force_flush().await.is_err());
        assert_eq!(batcher.pending_count(), 1);
        assert_eq!(batcher.pending_record("v1").unwrap().title, "first");

        batcher.queue("v1", record("v1", "second")).await.unwrap();
        assert_eq!(batcher.force_flush().await.unwrap(), 1);

        let stored = store.get_by_ids(&["v1".to_string()]).await.unwrap();
        assert_eq!(stored["v1"].title, "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_timer_flush_is_retried() {
        let store = Arc::new(RecordingStore::failing(1));
        let batcher = batcher(store.clone(), 10);

        batcher.queue("a", record("a", "a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(batcher.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(batcher.pending_count(), 0);
        assert_eq!(store.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_queue_uses_given_id() {
        let store = Arc::new(RecordingStore::default());
        let batcher = batcher(store.clone(), 10);

        batcher.queue("real", record("other", "t")).await.unwrap();
        assert!(batcher.pending_record("real").is_some());
        assert!(batcher.pending_record("other").is_none());
        batcher.shutdown().await.unwrap();
    }
}
