//! The cache engine: keyed store, fetch lifecycle, invalidation and GC.
//!
//! [`QueryCache`] owns the state and is configured once; [`QueryClient`]
//! wraps it in an `Arc` so it can be cloned into every adapter, task and
//! provider scope.
//!
//! Uses DashMap for concurrent access with per-key sharding; each entry
//! guards its own metadata, so work on one key never blocks another.

use crate::envelope::FetchError;
use crate::error::{Error, Result};
use crate::key::CacheKey;
use crate::observability::{NoOpMetrics, QueryMetrics};
use crate::options::{ClientConfig, QueryOptions, RetryPolicy};
use crate::request::Response;
use dashmap::DashMap;
use futures::future::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

pub(crate) mod entry;

use entry::{
    downcast_value, erase, typed_attempt, Attempt, ErasedFetch, Failure, QueryEntry, SharedFetch,
};

/// Engine state and configuration.
///
/// # Example
///
/// ```
/// use query_kit::{QueryCache, QueryClient};
/// use query_kit::options::ClientConfig;
///
/// let client: QueryClient = QueryCache::new()
///     .with_config(ClientConfig::default())
///     .into();
/// ```
pub struct QueryCache {
    store: DashMap<CacheKey, Arc<QueryEntry>>,
    config: ClientConfig,
    metrics: Box<dyn QueryMetrics>,
}

impl QueryCache {
    pub fn new() -> Self {
        QueryCache {
            store: DashMap::new(),
            config: ClientConfig::default(),
            metrics: Box::new(NoOpMetrics),
        }
    }

    /// Set client-wide defaults.
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Box<dyn QueryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to one cache engine instance.
///
/// Clone is cheap (an `Arc` increment) and every clone sees the same store.
/// Separate `QueryClient::new()` calls produce fully isolated engines.
#[derive(Clone)]
pub struct QueryClient {
    cache: Arc<QueryCache>,
}

impl From<QueryCache> for QueryClient {
    fn from(cache: QueryCache) -> Self {
        QueryClient {
            cache: Arc::new(cache),
        }
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("entries", &self.cache.store.len())
            .field("config", &self.cache.config)
            .finish()
    }
}

impl QueryClient {
    /// Create a client with default configuration.
    pub fn new() -> Self {
        QueryCache::new().into()
    }

    /// Create a client with custom defaults.
    pub fn with_config(config: ClientConfig) -> Self {
        QueryCache::new().with_config(config).into()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.cache.config
    }

    pub(crate) fn metrics(&self) -> &dyn QueryMetrics {
        self.cache.metrics.as_ref()
    }

    /// Number of entries currently in the store.
    pub fn len(&self) -> usize {
        self.cache.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.store.is_empty()
    }

    /// Whether both handles point at the same engine.
    pub fn ptr_eq(&self, other: &QueryClient) -> bool {
        Arc::ptr_eq(&self.cache, &other.cache)
    }

    pub(crate) fn entry(&self, key: &CacheKey) -> Arc<QueryEntry> {
        self.cache
            .store
            .entry(key.clone())
            .or_insert_with(|| Arc::new(QueryEntry::new(key.clone(), self.cache.config.gc_time())))
            .clone()
    }

    fn matching(&self, prefix: &CacheKey) -> Vec<Arc<QueryEntry>> {
        self.cache
            .store
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.value().clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Fetch lifecycle
    // ------------------------------------------------------------------

    /// Start a fetch for `entry`, or join the one already running.
    ///
    /// The request runs on a spawned task and settles into the entry even
    /// if nobody awaits the returned future.
    ///
    /// # Errors
    /// Returns `Error::NoRuntime` when called outside a tokio runtime.
    pub(crate) fn start_fetch(
        &self,
        entry: &Arc<QueryEntry>,
        fetcher: ErasedFetch,
        retry: RetryPolicy,
    ) -> Result<SharedFetch> {
        let mut inner = entry.lock();
        if let Some(in_flight) = &inner.in_flight {
            self.metrics().record_dedup(entry.key());
            debug!("» Joining in-flight fetch for {}", entry.key());
            return Ok(in_flight.clone());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        debug!("» Fetch started for {}", entry.key());

        let client = self.clone();
        let task_entry = entry.clone();
        let handle =
            runtime.spawn(async move { client.run_fetch(task_entry, fetcher, retry).await });
        let shared = async move {
            match handle.await {
                Ok(attempt) => attempt,
                Err(e) => Err(Failure::engine(Error::from(e))),
            }
        }
        .boxed()
        .shared();

        inner.in_flight = Some(shared.clone());
        inner.fetch_status = crate::state::FetchStatus::Fetching;
        inner.failure_count = 0;
        drop(inner);
        entry.notify();

        Ok(shared)
    }

    /// Run the request with retries until a result settles into the entry.
    ///
    /// A result that raced an invalidation is discarded and the request is
    /// run again with the entry's newest request function, so the settled
    /// data is never older than the last invalidation.
    async fn run_fetch(
        &self,
        entry: Arc<QueryEntry>,
        mut fetcher: ErasedFetch,
        mut retry: RetryPolicy,
    ) -> Attempt {
        let timer = Instant::now();
        let outcome = loop {
            let epoch = entry.lock().invalidate_epoch;
            let outcome = self.attempt_with_retry(&entry, &fetcher, retry).await;
            if entry.settle_if_current(&outcome, epoch) {
                break outcome;
            }

            debug!("» Fetch for {} superseded by invalidation, refetching", entry.key());
            if let Some((latest, latest_retry)) = entry.lock().fetcher.clone() {
                fetcher = latest;
                retry = latest_retry;
            }
        };

        self.metrics()
            .record_fetch(entry.key(), timer.elapsed(), outcome.is_ok());
        match &outcome {
            Ok(_) => debug!("✓ Fetch for {} settled in {:?}", entry.key(), timer.elapsed()),
            Err(f) => warn!("✗ Fetch for {} failed: {}", entry.key(), f.message),
        }
        // Covers callers that stopped awaiting before the fetch finished.
        self.schedule_gc(&entry);
        outcome
    }

    async fn attempt_with_retry(
        &self,
        entry: &Arc<QueryEntry>,
        fetcher: &ErasedFetch,
        retry: RetryPolicy,
    ) -> Attempt {
        let mut attempts = 0;
        let max_attempts = retry.retries + 1;

        loop {
            attempts += 1;
            match fetcher().await {
                Ok(value) => return Ok(value),
                Err(failure) => {
                    self.metrics().record_error(entry.key(), &failure.message);
                    entry.record_failure();
                    if attempts >= max_attempts {
                        return Err(failure);
                    }

                    let delay = retry.delay(attempts - 1);
                    debug!(
                        "Fetch for {} failed (attempt {}/{}), retrying in {:?}",
                        entry.key(),
                        attempts,
                        max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Remove `entry` after its GC window unless it regains observers.
    ///
    /// Best effort: without a runtime the entry simply stays cached.
    pub(crate) fn schedule_gc(&self, entry: &Arc<QueryEntry>) {
        let (epoch, gc_time) = {
            let mut inner = entry.lock();
            if inner.observers > 0 {
                return;
            }
            inner.gc_epoch = inner.gc_epoch.wrapping_add(1);
            (inner.gc_epoch, inner.gc_time)
        };
        if gc_time == Duration::MAX {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime, skipping GC for {}", entry.key());
            return;
        };

        let cache: Weak<QueryCache> = Arc::downgrade(&self.cache);
        let entry = entry.clone();
        runtime.spawn(async move {
            tokio::time::sleep(gc_time).await;
            let Some(cache) = cache.upgrade() else {
                return;
            };
            let removed = cache
                .store
                .remove_if(entry.key(), |_, current| {
                    if !Arc::ptr_eq(current, &entry) {
                        return false;
                    }
                    let inner = entry.lock();
                    inner.observers == 0 && inner.gc_epoch == epoch && inner.in_flight.is_none()
                })
                .is_some();
            if removed {
                cache.metrics.record_gc(entry.key());
            }
        });
    }

    // ------------------------------------------------------------------
    // Imperative cache operations
    // ------------------------------------------------------------------

    /// Synchronous read of the cached value; creates no subscription.
    ///
    /// # Errors
    /// Returns `Error::TypeMismatch` if the key holds a value of another type.
    pub fn get_query_data<T>(&self, key: impl Into<CacheKey>) -> Result<Option<T>>
    where
        T: Clone + 'static,
    {
        let key = key.into();
        let Some(entry) = self.cache.store.get(&key).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let inner = entry.lock();
        match &inner.data {
            Some(value) => downcast_value::<T>(&key, value).map(Some),
            None => Ok(None),
        }
    }

    /// Typed snapshot of an entry's full state, if the entry exists.
    ///
    /// # Errors
    /// Returns `Error::TypeMismatch` if the stored value or error has another type.
    pub fn get_query_state<T, E>(
        &self,
        key: impl Into<CacheKey>,
    ) -> Result<Option<crate::state::QueryState<T, E>>>
    where
        T: Clone + 'static,
        E: Clone + 'static,
    {
        let key = key.into();
        match self.cache.store.get(&key).map(|e| e.value().clone()) {
            Some(entry) => entry.snapshot::<T, E>().map(Some),
            None => Ok(None),
        }
    }

    /// Overwrite the cached value for `key` and notify observers.
    ///
    /// No request function runs. The entry counts as fresh from now on.
    pub fn set_query_data<T>(&self, key: impl Into<CacheKey>, value: T)
    where
        T: Send + Sync + 'static,
    {
        let key = key.into();
        let entry = self.entry(&key);
        entry.put(Arc::new(value));
        debug!("✓ SET {}", key);
        self.schedule_gc(&entry);
    }

    /// Replace the cached value with `f(current)`.
    ///
    /// # Errors
    /// Returns `Error::TypeMismatch` if the current value has another type.
    pub fn update_query_data<T, F>(&self, key: impl Into<CacheKey>, f: F) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Option<T>) -> T,
    {
        let key = key.into();
        let current = self.get_query_data::<T>(key.clone())?;
        self.set_query_data(key, f(current));
        Ok(())
    }

    /// Mark every entry under `prefix` stale and refetch the observed ones.
    ///
    /// Returns the number of entries marked once marking is done; refetches
    /// continue in the background.
    ///
    /// # Errors
    /// Returns `Error::NoRuntime` if a refetch had to start without a runtime.
    pub fn invalidate_queries(&self, prefix: impl Into<CacheKey>) -> Result<usize> {
        let prefix = prefix.into();
        let entries = self.matching(&prefix);
        info!("Invalidating {} entries under {}", entries.len(), prefix);

        for entry in &entries {
            self.invalidate_entry(entry)?;
        }
        Ok(entries.len())
    }

    fn invalidate_entry(&self, entry: &Arc<QueryEntry>) -> Result<Option<SharedFetch>> {
        entry.invalidate();
        let refetch = {
            let inner = entry.lock();
            match &inner.fetcher {
                Some((fetcher, retry)) if inner.active > 0 => Some((fetcher.clone(), *retry)),
                _ => None,
            }
        };
        self.metrics().record_invalidate(entry.key());

        match refetch {
            Some((fetcher, retry)) => self.start_fetch(entry, fetcher, retry).map(Some),
            None => Ok(None),
        }
    }

    /// Invalidate like [`invalidate_queries`](Self::invalidate_queries), then
    /// wait until every triggered refetch has settled.
    ///
    /// # Errors
    /// Returns `Error::NoRuntime` if a refetch had to start without a runtime.
    pub async fn refetch_queries(&self, prefix: impl Into<CacheKey>) -> Result<usize> {
        let prefix = prefix.into();
        let entries = self.matching(&prefix);
        let mut pending = Vec::new();
        for entry in &entries {
            if let Some(fetch) = self.invalidate_entry(entry)? {
                pending.push(fetch);
            }
        }
        let refetched = pending.len();
        futures::future::join_all(pending).await;
        Ok(refetched)
    }

    /// Drop every entry under `prefix` without refetching.
    ///
    /// Entries that still have observers stay in the store, reset to
    /// `Pending` with no data, so those observers keep sharing the entry
    /// that later writes and fetches go to. Returns the number of entries
    /// dropped or reset.
    pub fn remove_queries(&self, prefix: impl Into<CacheKey>) -> usize {
        let prefix = prefix.into();
        let mut removed = 0;
        self.cache.store.retain(|key, entry| {
            if !key.starts_with(&prefix) {
                return true;
            }
            removed += 1;
            if entry.lock().observers > 0 {
                entry.reset();
                return true;
            }
            false
        });
        debug!("✓ REMOVE {} ({} entries)", prefix, removed);
        removed
    }

    /// Drop all entries. Observed entries are reset in place.
    pub fn clear(&self) {
        self.remove_queries(CacheKey::new());
        warn!("⚠ QueryClient CLEAR executed - all queries removed!");
    }

    /// Return cached data if fresh, otherwise fetch it (joining any
    /// in-flight request) and return the settled result.
    ///
    /// # Errors
    /// Returns the normalized request error, or `FetchError::Transport` for
    /// engine failures such as `Error::NoRuntime` or `Error::TypeMismatch`.
    pub async fn fetch_query<T, E, F, Fut>(
        &self,
        key: impl Into<CacheKey>,
        query_fn: F,
        options: QueryOptions,
    ) -> std::result::Result<T, FetchError<E>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response<T, E>> + Send + 'static,
        T: Clone + Send + Sync + 'static,
        E: Clone + fmt::Debug + Send + Sync + 'static,
    {
        let key = key.into();
        let resolved = options.resolve(&self.cache.config);
        let entry = self.entry(&key);

        let fetch = {
            let mut inner = entry.lock();
            if !inner.is_stale(resolved.stale_time) {
                if let Some(value) = &inner.data {
                    self.metrics().record_hit(&key);
                    return downcast_value::<T>(&key, value).map_err(FetchError::Transport);
                }
            }
            let fetcher = erase(query_fn);
            inner.fetcher = Some((fetcher.clone(), resolved.retry));
            inner.gc_time = inner.gc_time.max(resolved.gc_time);
            fetcher
        };

        let attempt = self.start_fetch(&entry, fetch, resolved.retry)?.await;
        typed_attempt::<T, E>(&key, &attempt)
    }

    /// Warm the cache for `key` without mounting an observer.
    ///
    /// Failures are logged, not returned; the entry records them.
    pub async fn prefetch_query<T, E, F, Fut>(
        &self,
        key: impl Into<CacheKey>,
        query_fn: F,
        options: QueryOptions,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response<T, E>> + Send + 'static,
        T: Clone + Send + Sync + 'static,
        E: Clone + fmt::Debug + Send + Sync + 'static,
    {
        let key = key.into();
        if let Err(e) = self.fetch_query(key.clone(), query_fn, options).await {
            debug!("Prefetch for {} failed: {:?}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key;
    use crate::envelope::Envelope;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_fn(
        calls: Arc<AtomicUsize>,
        value: u32,
    ) -> impl Fn() -> futures::future::BoxFuture<'static, Response<u32, String>> + Send + Sync {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(Envelope::Ok(value)) }.boxed()
        }
    }

    #[test]
    fn test_client_clone_shares_store() {
        let client = QueryClient::new();
        let other = client.clone();
        client.set_query_data(cache_key!["k"], 1u32);

        assert!(client.ptr_eq(&other));
        assert_eq!(other.get_query_data::<u32>(cache_key!["k"]), Ok(Some(1)));
    }

    #[test]
    fn test_clients_are_isolated() {
        let a = QueryClient::new();
        let b = QueryClient::new();
        a.set_query_data(cache_key!["k"], 1u32);

        assert_eq!(b.get_query_data::<u32>(cache_key!["k"]), Ok(None));
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn test_get_query_data_type_mismatch() {
        let client = QueryClient::new();
        client.set_query_data(cache_key!["k"], 1u32);
        let err = client
            .get_query_data::<String>(cache_key!["k"])
            .expect_err("mismatch");
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_update_query_data() {
        let client = QueryClient::new();
        client
            .update_query_data::<Vec<u32>, _>(cache_key!["list"], |old| {
                let mut v = old.unwrap_or_default();
                v.push(1);
                v
            })
            .expect("update");
        client
            .update_query_data::<Vec<u32>, _>(cache_key!["list"], |old| {
                let mut v = old.unwrap_or_default();
                v.push(2);
                v
            })
            .expect("update");

        assert_eq!(
            client.get_query_data::<Vec<u32>>(cache_key!["list"]),
            Ok(Some(vec![1, 2]))
        );
    }

    #[test]
    fn test_remove_queries_by_prefix() {
        let client = QueryClient::new();
        client.set_query_data(cache_key!["todos", 1], 1u32);
        client.set_query_data(cache_key!["todos", 2], 2u32);
        client.set_query_data(cache_key!["users", 1], 3u32);

        assert_eq!(client.remove_queries(cache_key!["todos"]), 2);
        assert_eq!(client.len(), 1);

        client.clear();
        assert!(client.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_query_serves_fresh_data_without_refetch() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let opts = QueryOptions::default().stale_forever().with_retry(0);

        let first = client
            .fetch_query(cache_key!["n"], counting_fn(calls.clone(), 4), opts.clone())
            .await;
        let second = client
            .fetch_query(cache_key!["n"], counting_fn(calls.clone(), 9), opts)
            .await;

        assert_eq!(first, Ok(4));
        assert_eq!(second, Ok(4));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_query_dedups_concurrent_calls() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let opts = QueryOptions::default().with_retry(0);

        let (a, b) = tokio::join!(
            client.fetch_query(cache_key!["d"], counting_fn(calls.clone(), 1), opts.clone()),
            client.fetch_query(cache_key!["d"], counting_fn(calls.clone(), 2), opts.clone()),
        );

        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_query_retries_with_backoff() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let query_fn = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Ok::<_, Error>(Envelope::Err("flaky".to_string()))
                } else {
                    Ok(Envelope::Ok(n as u32))
                }
            }
        };

        let started = tokio::time::Instant::now();
        let out = client
            .fetch_query(cache_key!["retry"], query_fn, QueryOptions::default())
            .await;

        assert_eq!(out, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_prefetch_populates_cache() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        client
            .prefetch_query(
                cache_key!["warm"],
                counting_fn(calls.clone(), 11),
                QueryOptions::default(),
            )
            .await;

        assert_eq!(client.get_query_data::<u32>(cache_key!["warm"]), Ok(Some(11)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unobserved_entry_is_garbage_collected() {
        let client = QueryClient::with_config(ClientConfig {
            gc_time_ms: 10_000,
            ..ClientConfig::default()
        });
        client
            .prefetch_query(
                cache_key!["gc"],
                counting_fn(Arc::new(AtomicUsize::new(0)), 1),
                QueryOptions::default(),
            )
            .await;
        assert_eq!(client.len(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(client.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_fetch_is_still_collected() {
        let client = QueryClient::new();
        let slow = || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, Error>(Envelope::<u32, String>::Ok(1))
        };

        let abandoned = tokio::time::timeout(
            Duration::from_millis(1),
            client.fetch_query(cache_key!["abandoned"], slow, QueryOptions::default()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(client.len(), 1);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(client.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_during_fetch_refetches() {
        let client = QueryClient::new();
        let version = Arc::new(AtomicUsize::new(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let (source, counter) = (version.clone(), calls.clone());
        let query_fn = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let seen = source.load(Ordering::SeqCst) as u32;
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, Error>(Envelope::<u32, String>::Ok(seen))
            }
        };

        let pending = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .fetch_query(cache_key!["v"], query_fn, QueryOptions::default())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        version.store(2, Ordering::SeqCst);
        client.invalidate_queries(cache_key!["v"]).expect("invalidate");

        assert_eq!(pending.await.expect("task"), Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let state = client
            .get_query_state::<u32, String>(cache_key!["v"])
            .expect("typed")
            .expect("exists");
        assert!(!state.is_invalidated);
    }

    #[test]
    fn test_invalidate_without_observers_only_marks() {
        let client = QueryClient::new();
        client.set_query_data(cache_key!["user", 1], 1u32);
        client.set_query_data(cache_key!["user", "1"], 2u32);

        assert_eq!(client.invalidate_queries(cache_key!["user", 1]), Ok(1));
        let state = client
            .get_query_state::<u32, ()>(cache_key!["user", 1])
            .expect("typed")
            .expect("exists");
        assert!(state.is_invalidated);
        let other = client
            .get_query_state::<u32, ()>(cache_key!["user", "1"])
            .expect("typed")
            .expect("exists");
        assert!(!other.is_invalidated);
    }
}
