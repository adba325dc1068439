//! Front-end synchronization context
//!
//! [`SyncClient`] owns the state cache, the request coalescer and the
//! messaging client for one context. Reads go through the coalescer; state
//! changes are applied optimistically and then confirmed or rolled back
//! once the authoritative side answers.

use crate::cache::{Lookup, Snapshot, StateCache};
use crate::coalescer::RequestCoalescer;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::error_log::ErrorLog;
use crate::messaging::{MessagingClient, Transport};
use crate::record::{ItemState, Record};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Whether the authoritative side is usable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Readiness {
    Ready,
    /// Keep running with reduced functionality
    Degraded(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Ready => write!(f, "ready"),
            Readiness::Degraded(reason) => write!(f, "degraded: {}", reason),
        }
    }
}

/// Lifecycle of one optimistic mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    AppliedOptimistically,
    Confirmed,
    RolledBack,
}

/// A local state change awaiting confirmation
///
/// Created by [`OptimisticUpdate::apply`], which writes the new state to the
/// cache right away and remembers what the cache knew before. Exactly one of
/// [`confirm`](Self::confirm) or [`rollback`](Self::rollback) then settles it.
/// Neither touches the cache if a later write for the same id has replaced
/// the optimistic one.
#[derive(Debug, Clone)]
pub struct OptimisticUpdate {
    id: String,
    prior: Snapshot,
    applied_stamp: i64,
    state: MutationState,
}

impl OptimisticUpdate {
    /// Apply `state` for `id` to the cache. The normal state is applied as
    /// a deletion.
    pub async fn apply(cache: &StateCache, id: &str, state: ItemState, title: &str) -> Self {
        let (prior, applied_stamp) = cache.apply_local(id, state, title).await;

        debug!("Applied {} -> {} optimistically", id, state);
        Self {
            id: id.to_string(),
            prior,
            applied_stamp,
            state: MutationState::AppliedOptimistically,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> MutationState {
        self.state
    }

    /// What the cache knew about the id before the mutation
    pub fn prior(&self) -> &Lookup {
        &self.prior.lookup
    }

    /// Replace the optimistic value with the authoritative record
    pub async fn confirm(&mut self, cache: &StateCache, confirmed: Option<Record>) -> bool {
        if self.state != MutationState::AppliedOptimistically {
            return false;
        }
        if !cache
            .replace_if_current(&self.id, self.applied_stamp, confirmed)
            .await
        {
            debug!("Mutation of {} superseded before confirmation", self.id);
        }
        self.state = MutationState::Confirmed;
        true
    }

    /// Restore the prior snapshot
    pub async fn rollback(&mut self, cache: &StateCache) -> bool {
        if self.state != MutationState::AppliedOptimistically {
            return false;
        }
        if !cache
            .restore_if_current(&self.id, self.applied_stamp, &self.prior)
            .await
        {
            debug!("Mutation of {} superseded before rollback", self.id);
        }
        self.state = MutationState::RolledBack;
        true
    }
}

/// Synchronization context for one front end
#[derive(Clone)]
pub struct SyncClient {
    cache: StateCache,
    coalescer: RequestCoalescer,
    messaging: MessagingClient,
    error_log: Arc<ErrorLog>,
}

impl SyncClient {
    pub fn new(config: &SyncConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate().map_err(SyncError::ConfigError)?;

        let cache = StateCache::new(config.cache.clone());
        let error_log = Arc::new(ErrorLog::new(config.error_log_capacity));
        let messaging = MessagingClient::new(transport, config.retry.clone(), Arc::clone(&error_log));
        let coalescer = RequestCoalescer::new(cache.clone(), messaging.clone());

        info!(
            "Sync client ready (cache capacity {}, {} attempts per call)",
            config.cache.capacity, config.retry.max_attempts
        );

        Ok(Self {
            cache,
            coalescer,
            messaging,
            error_log,
        })
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    pub fn coalescer(&self) -> &RequestCoalescer {
        &self.coalescer
    }

    pub fn messaging(&self) -> &MessagingClient {
        &self.messaging
    }

    pub fn error_log(&self) -> &Arc<ErrorLog> {
        &self.error_log
    }

    /// Ask the authoritative side whether it is ready. Never fails.
    pub async fn health_check(&self) -> Readiness {
        let readiness = match self.messaging.health().await {
            Ok(response) if response.ready => Readiness::Ready,
            Ok(response) => Readiness::Degraded(
                response
                    .error
                    .unwrap_or_else(|| "authoritative side not ready".to_string()),
            ),
            Err(e) => Readiness::Degraded(e.to_string()),
        };

        if let Readiness::Degraded(reason) = &readiness {
            warn!("Continuing with reduced functionality: {}", reason);
        }
        readiness
    }

    /// Records for `ids`, `None` where the id has no stored state
    pub async fn fetch_many(&self, ids: &[String]) -> HashMap<String, Option<Record>> {
        self.coalescer.fetch_many(ids).await
    }

    pub async fn get(&self, id: &str) -> Option<Record> {
        self.coalescer
            .fetch_many(&[id.to_string()])
            .await
            .remove(id)
            .flatten()
    }

    /// Change the state of `id`. The cache reflects the change right away;
    /// if the authoritative side rejects it or cannot be reached the prior
    /// value is restored and the error returned.
    pub async fn set_state(&self, id: &str, state: ItemState, title: &str) -> Result<Option<Record>> {
        let mut update = OptimisticUpdate::apply(&self.cache, id, state, title).await;

        match self.messaging.set_state(id, state, title).await {
            Ok(confirmed) => {
                update.confirm(&self.cache, confirmed.clone()).await;
                Ok(confirmed)
            }
            Err(e) => {
                warn!("Rolling back {} after {} failure: {}", id, e.kind(), e);
                update.rollback(&self.cache).await;
                Err(e)
            }
        }
    }

    /// Drop all context state: cached records, in-flight fetches and the
    /// error log
    pub async fn reset(&self) {
        self.cache.clear().await;
        self.coalescer.clear_pending();
        self.error_log.clear();
        info!("Sync context reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::classify::{ErrorKind, Failure};
    use crate::messaging::RetryPolicy;
    use crate::protocol::{Envelope, HealthResponse, Request, SetStateResponse};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers from a script; unscripted requests fail permanently
    struct ScriptedTransport {
        replies: Mutex<Vec<std::result::Result<Envelope, Failure>>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<std::result::Result<Envelope, Failure>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn call(&self, _request: Request) -> std::result::Result<Envelope, Failure> {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(Failure::new("no scripted reply"));
            }
            replies.remove(0)
        }
    }

    fn client(transport: Arc<ScriptedTransport>) -> SyncClient {
        let config = SyncConfig {
            retry: RetryPolicy::no_retry(),
            ..Default::default()
        };
        SyncClient::new(&config, transport).unwrap()
    }

    fn cache() -> StateCache {
        StateCache::new(CacheConfig::builder().capacity(10).build())
    }

    #[tokio::test]
    async fn test_rollback_restores_prior() {
        let cache = cache();
        let prior = Record::new("v1", ItemState::Dimmed, "").with_updated_at(100);
        cache.apply_update("v1", Some(prior.clone())).await;

        let mut update = OptimisticUpdate::apply(&cache, "v1", ItemState::Hidden, "").await;
        assert_eq!(update.state(), MutationState::AppliedOptimistically);
        assert_eq!(cache.peek("v1").await.unwrap().state, ItemState::Hidden);
        assert!(cache.known_timestamp("v1").await.unwrap() > 100);

        assert_eq!(update.prior(), &Lookup::Hit(prior.clone()));

        assert!(update.rollback(&cache).await);
        assert_eq!(update.state(), MutationState::RolledBack);
        assert_eq!(cache.peek("v1").await, Some(prior));
        assert_eq!(cache.known_timestamp("v1").await, Some(100));

        // Settled mutations do not transition again
        assert!(!update.confirm(&cache, None).await);
        assert_eq!(update.state(), MutationState::RolledBack);
    }

    #[tokio::test]
    async fn test_rollback_of_unseen_id_forgets_it() {
        let cache = cache();
        let mut update = OptimisticUpdate::apply(&cache, "v1", ItemState::Hidden, "").await;
        assert_eq!(update.prior(), &Lookup::Unknown);

        update.rollback(&cache).await;
        // Nothing was known before, so the next read must fetch
        assert_eq!(cache.lookup("v1").await, Lookup::Unknown);
        assert_eq!(cache.known_timestamp("v1").await, None);
    }

    #[tokio::test]
    async fn test_rollback_of_known_absent_id_keeps_it_absent() {
        let cache = cache();
        cache.merge_fetched("v1", None).await;

        let mut update = OptimisticUpdate::apply(&cache, "v1", ItemState::Dimmed, "").await;
        assert_eq!(update.prior(), &Lookup::KnownAbsent);

        update.rollback(&cache).await;
        assert_eq!(cache.lookup("v1").await, Lookup::KnownAbsent);
    }

    #[tokio::test]
    async fn test_fetch_landing_after_apply_survives_rollback() {
        let cache = cache();
        let mut update = OptimisticUpdate::apply(&cache, "v1", ItemState::Hidden, "").await;

        // An authoritative result newer than the optimistic write arrives
        let fetched = Record::new("v1", ItemState::Dimmed, "").with_updated_at(i64::MAX / 2);
        assert!(cache.merge_fetched("v1", Some(fetched.clone())).await);

        update.rollback(&cache).await;
        assert_eq!(cache.peek("v1").await, Some(fetched));
    }

    #[tokio::test]
    async fn test_normal_state_applies_as_delete() {
        let cache = cache();
        cache
            .apply_update("v1", Some(Record::new("v1", ItemState::Hidden, "")))
            .await;

        let mut update = OptimisticUpdate::apply(&cache, "v1", ItemState::Normal, "").await;
        assert!(!cache.has("v1").await);

        update.confirm(&cache, None).await;
        assert_eq!(update.state(), MutationState::Confirmed);
        assert_eq!(cache.lookup("v1").await, Lookup::KnownAbsent);
    }

    #[tokio::test]
    async fn test_superseded_rollback_leaves_newer_write() {
        let cache = cache();
        let mut first = OptimisticUpdate::apply(&cache, "v1", ItemState::Hidden, "").await;
        let _second = OptimisticUpdate::apply(&cache, "v1", ItemState::Dimmed, "").await;

        first.rollback(&cache).await;
        assert_eq!(first.state(), MutationState::RolledBack);
        assert_eq!(cache.peek("v1").await.unwrap().state, ItemState::Dimmed);
    }

    #[tokio::test]
    async fn test_set_state_confirms_with_authoritative_record() {
        let confirmed = Record::new("v1", ItemState::Hidden, "Clip").with_updated_at(42);
        let transport = ScriptedTransport::new(vec![Ok(Envelope::success(&SetStateResponse {
            record: Some(confirmed.clone()),
        })
        .unwrap())]);
        let client = client(transport);

        let result = client.set_state("v1", ItemState::Hidden, "Clip").await.unwrap();
        assert_eq!(result, Some(confirmed.clone()));
        assert_eq!(client.cache().peek("v1").await, Some(confirmed));
    }

    #[tokio::test]
    async fn test_set_state_rolls_back_on_rejection() {
        let transport = ScriptedTransport::new(vec![Ok(Envelope::failure("store unavailable"))]);
        let client = client(transport);

        let result = client.set_state("v1", ItemState::Dimmed, "").await;
        assert!(matches!(result, Err(SyncError::Rejected(_))));
        assert!(!client.cache().has("v1").await);
        assert_eq!(client.cache().lookup("v1").await, Lookup::Unknown);
        assert_eq!(client.error_log().latest().unwrap().kind, ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_health_check_degrades() {
        let transport = ScriptedTransport::new(vec![
            Ok(Envelope::success(&HealthResponse {
                ready: true,
                error: None,
            })
            .unwrap()),
            Ok(Envelope::success(&HealthResponse {
                ready: false,
                error: Some("store opening".into()),
            })
            .unwrap()),
        ]);
        let client = client(transport);

        assert_eq!(client.health_check().await, Readiness::Ready);
        assert_eq!(
            client.health_check().await,
            Readiness::Degraded("store opening".into())
        );
        // Transport failure
        assert!(!client.health_check().await.is_ready());
    }

    #[tokio::test]
    async fn test_reset_clears_context() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client(transport);
        client
            .cache()
            .apply_update("v1", Some(Record::new("v1", ItemState::Hidden, "")))
            .await;
        client.health_check().await;
        assert!(!client.error_log().is_empty());

        client.reset().await;
        assert_eq!(client.cache().size().await, 0);
        assert_eq!(client.cache().lookup("v1").await, Lookup::Unknown);
        assert!(client.error_log().is_empty());
    }
}
