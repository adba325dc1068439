//! Request coalescing for record fetches
//!
//! [`RequestCoalescer::fetch_many`] answers what it can from the
//! [`StateCache`], attaches to fetches already in flight for other ids, and
//! sends one batched get-many call for the rest. At most one boundary call
//! is in flight per id at any time.

use crate::cache::{Lookup, StateCache};
use crate::messaging::MessagingClient;
use crate::record::Record;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Current value of every requested id once the fetch has been merged
type FetchOutcome = Arc<HashMap<String, Option<Record>>>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

struct PendingFetch {
    token: u64,
    fetch: SharedFetch,
}

type PendingTable = Arc<Mutex<HashMap<String, PendingFetch>>>;

fn lock_table(table: &PendingTable) -> MutexGuard<'_, HashMap<String, PendingFetch>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drop the entries `token` registered; entries re-registered since by
/// another fetch stay
fn release(table: &PendingTable, ids: &[String], token: u64) {
    let mut table = lock_table(table);
    for id in ids {
        if table.get(id).is_some_and(|pending| pending.token == token) {
            table.remove(id);
        }
    }
}

/// Releases a fetch's entries if its caller goes away before it settles
struct PendingGuard {
    table: PendingTable,
    ids: Vec<String>,
    token: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        release(&self.table, &self.ids, self.token);
    }
}

/// Deduplicating fetcher in front of the messaging client
#[derive(Clone)]
pub struct RequestCoalescer {
    cache: StateCache,
    messaging: MessagingClient,
    pending: PendingTable,
    next_token: Arc<AtomicU64>,
}

impl RequestCoalescer {
    pub fn new(cache: StateCache, messaging: MessagingClient) -> Self {
        Self {
            cache,
            messaging,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_token: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of ids with a fetch in flight
    pub fn in_flight(&self) -> usize {
        lock_table(&self.pending).len()
    }

    /// Whether a fetch is in flight for `id`
    pub fn is_pending(&self, id: &str) -> bool {
        lock_table(&self.pending).contains_key(id)
    }

    /// Forget every in-flight fetch. Callers already waiting keep their
    /// futures; new callers will issue fresh requests.
    pub fn clear_pending(&self) {
        lock_table(&self.pending).clear();
    }

    /// One get-many call for `ids`, merged into the cache before its pending
    /// entries are released. The outcome holds the cache's view after the
    /// merge, so a newer local write wins for every waiter.
    fn start_fetch(&self, ids: Vec<String>, token: u64) -> SharedFetch {
        let cache = self.cache.clone();
        let messaging = self.messaging.clone();
        let table = Arc::clone(&self.pending);

        async move {
            let mut fetched = match messaging.get_many(ids.clone()).await {
                Ok(records) => {
                    debug!("Fetched {} of {} requested records", records.len(), ids.len());
                    records
                }
                Err(e) => {
                    warn!("Fetching {} records failed, caching as absent: {}", ids.len(), e);
                    HashMap::new()
                }
            };

            let mut resolved = HashMap::with_capacity(ids.len());
            for id in &ids {
                let record = fetched.remove(id);
                let current = if cache.merge_fetched(id, record.clone()).await {
                    record.filter(|r| r.state.is_stored())
                } else {
                    cache.peek(id).await
                };
                resolved.insert(id.clone(), current);
            }

            release(&table, &ids, token);
            Arc::new(resolved)
        }
        .boxed()
        .shared()
    }

    /// Resolve every requested id to its record or `None`. Never fails:
    /// boundary failures degrade to cached absent results.
    pub async fn fetch_many(&self, ids: &[String]) -> HashMap<String, Option<Record>> {
        let mut results = HashMap::with_capacity(ids.len());
        let mut seen = HashSet::with_capacity(ids.len());
        let mut unresolved = Vec::new();

        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            match self.cache.lookup(id).await {
                Lookup::Hit(record) => {
                    results.insert(id.clone(), Some(record));
                }
                Lookup::KnownAbsent => {
                    results.insert(id.clone(), None);
                }
                Lookup::Unknown => unresolved.push(id.clone()),
            }
        }

        if unresolved.is_empty() {
            return results;
        }

        // Partition and register in one critical section so that concurrent
        // callers for the same ids coalesce onto this fetch
        let (waits, attached, guard) = {
            let mut pending = lock_table(&self.pending);
            let mut waits = Vec::with_capacity(unresolved.len());
            let mut fresh = Vec::new();
            for id in unresolved {
                match pending.get(&id) {
                    Some(existing) => {
                        let fetch = existing.fetch.clone();
                        waits.push((id, fetch));
                    }
                    None => fresh.push(id),
                }
            }
            let attached = waits.len();

            let guard = if fresh.is_empty() {
                None
            } else {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                let fetch = self.start_fetch(fresh.clone(), token);
                for id in &fresh {
                    pending.insert(
                        id.clone(),
                        PendingFetch {
                            token,
                            fetch: fetch.clone(),
                        },
                    );
                    waits.push((id.clone(), fetch.clone()));
                }
                Some(PendingGuard {
                    table: Arc::clone(&self.pending),
                    ids: fresh,
                    token,
                })
            };
            (waits, attached, guard)
        };

        debug!(
            "fetch_many: {} cached, {} attached, {} fetched",
            results.len(),
            attached,
            waits.len() - attached
        );

        let settled = join_all(waits.into_iter().map(|(id, fetch)| async move {
            let record = fetch.await.get(&id).cloned().flatten();
            (id, record)
        }))
        .await;
        drop(guard);

        results.extend(settled);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::classify::Failure;
    use crate::error_log::ErrorLog;
    use crate::messaging::{RetryPolicy, Transport};
    use crate::protocol::{Envelope, GetManyResponse, Request};
    use crate::record::ItemState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Serves hidden records for ids starting with "h", after a delay
    struct FakeBackend {
        requested: Mutex<Vec<Vec<String>>>,
        fail: AtomicBool,
    }

    impl FakeBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requested: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for FakeBackend {
        async fn call(&self, request: Request) -> std::result::Result<Envelope, Failure> {
            let Request::GetMany { ids } = request else {
                return Ok(Envelope::failure("unsupported"));
            };
            self.requested.lock().unwrap().push(ids.clone());
            tokio::time::sleep(Duration::from_millis(50)).await;

            if self.fail.load(Ordering::SeqCst) {
                return Err(Failure::new("Extension context invalidated"));
            }
            let records = ids
                .iter()
                .filter(|id| id.starts_with('h'))
                .map(|id| {
                    let record = Record::new(id.clone(), ItemState::Hidden, "").with_updated_at(10);
                    (id.clone(), record)
                })
                .collect();
            Ok(Envelope::success(&GetManyResponse { records }).unwrap())
        }
    }

    fn coalescer(backend: Arc<FakeBackend>) -> (RequestCoalescer, StateCache) {
        let cache = StateCache::new(CacheConfig::builder().capacity(100).build());
        let messaging = MessagingClient::new(
            backend,
            RetryPolicy::default(),
            Arc::new(ErrorLog::default()),
        );
        (RequestCoalescer::new(cache.clone(), messaging), cache)
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_and_caches() {
        let backend = FakeBackend::new();
        let (coalescer, cache) = coalescer(backend.clone());

        let results = coalescer.fetch_many(&ids(&["h1", "n1"])).await;
        assert_eq!(results["h1"].as_ref().unwrap().state, ItemState::Hidden);
        assert_eq!(results["n1"], None);
        assert!(cache.has("h1").await);
        assert_eq!(cache.lookup("n1").await, Lookup::KnownAbsent);
        assert_eq!(coalescer.in_flight(), 0);

        // Everything is now cached, positively or negatively
        coalescer.fetch_many(&ids(&["h1", "n1"])).await;
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_coalesce() {
        let backend = FakeBackend::new();
        let (coalescer, _) = coalescer(backend.clone());

        let requests = vec![
            ids(&["h1", "h2", "n1"]),
            ids(&["h2", "h3"]),
            ids(&["h1", "h3", "n1", "n2"]),
            ids(&["h1"]),
        ];
        let all = join_all(requests.iter().map(|r| coalescer.fetch_many(r))).await;

        let mut requested: Vec<String> = backend.calls().into_iter().flatten().collect();
        let total = requested.len();
        requested.sort();
        requested.dedup();
        assert_eq!(total, requested.len(), "an id was requested twice");
        assert_eq!(requested, ids(&["h1", "h2", "h3", "n1", "n2"]));

        assert!(all[1]["h2"].is_some());
        assert!(all[2]["h3"].is_some());
        assert_eq!(all[2]["n2"], None);
        assert!(all[3]["h1"].is_some());
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_degrades_to_cached_absent() {
        let backend = FakeBackend::new();
        backend.fail.store(true, Ordering::SeqCst);
        let (coalescer, cache) = coalescer(backend.clone());

        let results = coalescer.fetch_many(&ids(&["h1", "h2"])).await;
        assert_eq!(results.len(), 2);
        assert!(results.values().all(Option::is_none));
        assert_eq!(cache.lookup("h1").await, Lookup::KnownAbsent);
        assert_eq!(coalescer.in_flight(), 0);

        coalescer.fetch_many(&ids(&["h1", "h2"])).await;
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_local_write_wins_over_fetch() {
        let backend = FakeBackend::new();
        let (coalescer, cache) = coalescer(backend.clone());

        let h1 = ids(&["h1"]);
        let fetch = coalescer.fetch_many(&h1);
        let local = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let record = Record::new("h1", ItemState::Dimmed, "").with_updated_at(1_000);
            cache.apply_update("h1", Some(record)).await;
        };
        let (results, _) = futures::join!(fetch, local);

        assert_eq!(results["h1"].as_ref().unwrap().state, ItemState::Dimmed);
        assert_eq!(cache.peek("h1").await.unwrap().state, ItemState::Dimmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attached_caller_sees_newer_local_write() {
        let backend = FakeBackend::new();
        let (coalescer, cache) = coalescer(backend.clone());

        let h1 = ids(&["h1"]);
        let first = coalescer.fetch_many(&h1);
        let second = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(coalescer.is_pending("h1"));
            coalescer.fetch_many(&ids(&["h1"])).await
        };
        let local = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let record = Record::new("h1", ItemState::Dimmed, "").with_updated_at(1_000);
            cache.apply_update("h1", Some(record)).await;
        };
        let (first, second, _) = futures::join!(first, second, local);

        assert_eq!(first["h1"].as_ref().unwrap().state, ItemState::Dimmed);
        assert_eq!(second["h1"].as_ref().unwrap().state, ItemState::Dimmed);
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_entry_outlives_uncached_result() {
        let backend = FakeBackend::new();
        let (coalescer, cache) = coalescer(backend.clone());

        let h1_n1 = ids(&["h1", "n1"]);
        let fetch = coalescer.fetch_many(&h1_n1);
        let watch = async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            while coalescer.is_pending("h1") || coalescer.is_pending("n1") {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            // Once released, the cache answers without another fetch
            assert!(cache.has("h1").await);
            assert_eq!(cache.lookup("n1").await, Lookup::KnownAbsent);
        };
        futures::join!(fetch, watch);

        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fetch_keeps_newer_registration() {
        let backend = FakeBackend::new();
        let (coalescer, _) = coalescer(backend.clone());

        let h1 = ids(&["h1"]);
        let first = coalescer.fetch_many(&h1);
        let second = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            coalescer.clear_pending();
            let h1_again = ids(&["h1"]);
            let refetch = coalescer.fetch_many(&h1_again);
            let check = async {
                // The first fetch has settled, the second is still out
                tokio::time::sleep(Duration::from_millis(47)).await;
                assert!(coalescer.is_pending("h1"));
            };
            futures::join!(refetch, check)
        };
        futures::join!(first, second);

        assert_eq!(coalescer.in_flight(), 0);
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_ids_in_one_call() {
        let backend = FakeBackend::new();
        let (coalescer, _) = coalescer(backend.clone());

        let results = coalescer.fetch_many(&ids(&["h1", "h1", "h1"])).await;
        assert_eq!(results.len(), 1);
        assert_eq!(backend.calls(), vec![ids(&["h1"])]);
    }

    #[tokio::test]
    async fn test_empty_request() {
        let backend = FakeBackend::new();
        let (coalescer, _) = coalescer(backend.clone());
        assert!(coalescer.fetch_many(&[]).await.is_empty());
        assert!(backend.calls().is_empty());
    }
}
