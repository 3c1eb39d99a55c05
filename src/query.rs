//! Read adapter: a live subscription to one cache key.
//!
//! Mounting a [`Query`] registers an observer on the key's entry and, when
//! the cached data is missing or stale, triggers one fetch. Observers of the
//! same key share the entry and the in-flight request. Dropping the handle
//! unsubscribes; the entry is collected after its GC window.
//!
//! ```no_run
//! use query_kit::{cache_key, use_api_query, Envelope, QueryClient};
//!
//! # async fn run() -> query_kit::Result<()> {
//! let client = QueryClient::new();
//! let mut todos = use_api_query(&client, cache_key!["todos"], || async {
//!     Ok::<_, query_kit::Error>(Envelope::<Vec<String>, String>::Ok(vec!["write docs".to_string()]))
//! })?;
//!
//! let state = todos.settled().await;
//! assert_eq!(state.data.map(|t| t.len()), Some(1));
//! # Ok(())
//! # }
//! ```

use crate::client::entry::{erase, ErasedFetch, QueryEntry};
use crate::client::QueryClient;
use crate::envelope::FetchError;
use crate::error::Result;
use crate::key::CacheKey;
use crate::options::{QueryOptions, ResolvedQueryOptions};
use crate::request::{RequestOptions, Response};
use crate::state::{FetchStatus, QueryState, QueryStatus};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::watch;

/// Observer handle returned by [`use_api_query`].
pub struct Query<T, E> {
    client: QueryClient,
    key: CacheKey,
    entry: Arc<QueryEntry>,
    fetcher: ErasedFetch,
    options: ResolvedQueryOptions,
    enabled: bool,
    changes: watch::Receiver<u64>,
    _types: PhantomData<fn() -> (T, E)>,
}

/// Subscribe to `key`, fetching with `query_fn` when needed.
///
/// # Errors
/// Returns `Error::NoRuntime` if a fetch must start outside a tokio runtime.
pub fn use_api_query<T, E, F, Fut>(
    client: &QueryClient,
    key: impl Into<CacheKey>,
    query_fn: F,
) -> Result<Query<T, E>>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<T, E>> + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + fmt::Debug + Send + Sync + 'static,
{
    Query::mount(client, key.into(), erase(query_fn), QueryOptions::default())
}

/// [`use_api_query`] with engine options and request options.
///
/// `query_fn` receives a clone of `request_options` on every call.
///
/// # Errors
/// Returns `Error::NoRuntime` if a fetch must start outside a tokio runtime.
pub fn use_api_query_with<T, E, F, Fut>(
    client: &QueryClient,
    key: impl Into<CacheKey>,
    query_fn: F,
    options: QueryOptions,
    request_options: RequestOptions,
) -> Result<Query<T, E>>
where
    F: Fn(RequestOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<T, E>> + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + fmt::Debug + Send + Sync + 'static,
{
    let fetcher = erase(move || query_fn(request_options.clone()));
    Query::mount(client, key.into(), fetcher, options)
}

impl<T, E> Query<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + fmt::Debug + Send + Sync + 'static,
{
    fn mount(
        client: &QueryClient,
        key: CacheKey,
        fetcher: ErasedFetch,
        options: QueryOptions,
    ) -> Result<Self> {
        let resolved = options.resolve(client.config());
        let entry = client.entry(&key);
        {
            let mut inner = entry.lock();
            inner.observers += 1;
            if options.enabled {
                inner.active += 1;
            }
            inner.fetcher = Some((fetcher.clone(), resolved.retry));
            inner.gc_time = inner.gc_time.max(resolved.gc_time);
        }
        debug!("» Observer mounted for {} (enabled: {})", key, options.enabled);

        let query = Query {
            client: client.clone(),
            changes: entry.subscribe(),
            key,
            entry,
            fetcher,
            options: resolved,
            enabled: options.enabled,
            _types: PhantomData,
        };
        if query.enabled {
            query.fetch_if_stale()?;
        }
        Ok(query)
    }

    fn fetch_if_stale(&self) -> Result<()> {
        let stale = self.entry.lock().is_stale(self.options.stale_time);
        if stale {
            self.client
                .start_fetch(&self.entry, self.fetcher.clone(), self.options.retry)?;
        } else {
            self.client.metrics().record_hit(&self.key);
        }
        Ok(())
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current snapshot of the entry.
    ///
    /// A value of another type under the same key is reported as a
    /// transport error rather than a panic.
    pub fn state(&self) -> QueryState<T, E> {
        match self.entry.snapshot::<T, E>() {
            Ok(state) => state,
            Err(e) => QueryState {
                error: Some(FetchError::Transport(e)),
                status: QueryStatus::Error,
                ..QueryState::default()
            },
        }
    }

    pub fn data(&self) -> Option<T> {
        self.state().data
    }

    pub fn error(&self) -> Option<FetchError<E>> {
        self.state().error
    }

    pub fn status(&self) -> QueryStatus {
        self.entry.lock().status
    }

    pub fn fetch_status(&self) -> FetchStatus {
        self.entry.lock().fetch_status
    }

    pub fn is_pending(&self) -> bool {
        self.status() == QueryStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status() == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status() == QueryStatus::Error
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_status() == FetchStatus::Fetching
    }

    /// Enable or disable automatic fetching.
    ///
    /// Enabling a query whose data is missing or stale triggers a fetch.
    ///
    /// # Errors
    /// Returns `Error::NoRuntime` if a fetch must start outside a tokio runtime.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        if self.enabled == enabled {
            return Ok(());
        }
        self.enabled = enabled;
        {
            let mut inner = self.entry.lock();
            if enabled {
                inner.active += 1;
            } else {
                inner.active = inner.active.saturating_sub(1);
            }
        }
        if enabled {
            self.fetch_if_stale()?;
        }
        Ok(())
    }

    /// Fetch now, regardless of staleness or `enabled`, and wait for the
    /// result. Joins a request that is already running.
    ///
    /// # Errors
    /// Returns `Error::NoRuntime` outside a tokio runtime.
    pub async fn refetch(&self) -> Result<QueryState<T, E>> {
        let fetch = self
            .client
            .start_fetch(&self.entry, self.fetcher.clone(), self.options.retry)?;
        fetch.await;
        Ok(self.state())
    }

    /// Wait until the entry changes.
    pub async fn changed(&mut self) -> QueryState<T, E> {
        // The sender lives in the entry this handle keeps alive.
        let _ = self.changes.changed().await;
        self.state()
    }

    /// Wait until no request is in flight and the query has settled.
    ///
    /// Returns immediately for a disabled query that has nothing to wait for.
    pub async fn settled(&mut self) -> QueryState<T, E> {
        loop {
            let _ = self.changes.borrow_and_update();
            let state = self.state();
            let idle = state.fetch_status == FetchStatus::Idle;
            if idle && (state.status != QueryStatus::Pending || !self.enabled) {
                return state;
            }
            if self.changes.changed().await.is_err() {
                return self.state();
            }
        }
    }
}

impl<T, E> fmt::Debug for Query<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.key)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl<T, E> Drop for Query<T, E> {
    fn drop(&mut self) {
        {
            let mut inner = self.entry.lock();
            inner.observers = inner.observers.saturating_sub(1);
            if self.enabled {
                inner.active = inner.active.saturating_sub(1);
            }
        }
        debug!("» Observer dropped for {}", self.key);
        self.client.schedule_gc(&self.entry);
    }
}
