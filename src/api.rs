//! Facade handle binding the adapters and cache utilities to one client.
//!
//! Provides a convenient wrapper around [`QueryClient`] so call sites need
//! a single handle for reads, writes and manual cache management.
//!
//! # Scoping
//!
//! A client is made ambient for a future with [`QueryClient::provide`];
//! [`use_api`] inside that future returns a handle to it. Outside any scope
//! `use_api` fails with `Error::NoProvider`. Nothing is global: each client
//! is its own isolated engine.
//!
//! ```no_run
//! use query_kit::{cache_key, use_api, QueryClient};
//!
//! # async fn run() -> query_kit::Result<()> {
//! let client = QueryClient::new();
//! client
//!     .provide(async {
//!         let api = use_api()?;
//!         api.set_data(cache_key!["greeting"], "hello".to_string());
//!         assert_eq!(api.get_data::<String>(cache_key!["greeting"])?.as_deref(), Some("hello"));
//!         Ok::<(), query_kit::Error>(())
//!     })
//!     .await
//! # }
//! ```

use crate::client::QueryClient;
use crate::envelope::FetchError;
use crate::error::{Error, Result};
use crate::key::CacheKey;
use crate::mutation::{use_api_mutation, use_api_mutation_with, Mutation};
use crate::options::{MutationOptions, QueryOptions};
use crate::query::{use_api_query, use_api_query_with, Query};
use crate::request::{RequestOptions, Response};
use std::fmt;
use std::future::Future;

tokio::task_local! {
    static CURRENT_CLIENT: QueryClient;
}

impl QueryClient {
    /// Run `fut` with this client as the ambient one for [`use_api`].
    pub async fn provide<F: Future>(&self, fut: F) -> F::Output {
        CURRENT_CLIENT.scope(self.clone(), fut).await
    }

    /// The ambient client of the current provider scope.
    ///
    /// # Errors
    /// Returns `Error::NoProvider` outside a [`provide`](Self::provide) scope.
    pub fn current() -> Result<QueryClient> {
        CURRENT_CLIENT
            .try_with(QueryClient::clone)
            .map_err(|_| Error::NoProvider)
    }

    /// Facade handle over this client.
    pub fn api(&self) -> Api {
        Api::new(self.clone())
    }
}

/// Facade over the ambient client.
///
/// # Errors
/// Returns `Error::NoProvider` outside a [`QueryClient::provide`] scope.
pub fn use_api() -> Result<Api> {
    QueryClient::current().map(Api::new)
}

/// Reads, writes and cache utilities bound to one [`QueryClient`].
///
/// Clone is cheap; every clone forwards to the same engine.
#[derive(Clone)]
pub struct Api {
    client: QueryClient,
}

impl Api {
    pub fn new(client: QueryClient) -> Self {
        Api { client }
    }

    /// Subscribe to `key`. See [`use_api_query`].
    ///
    /// # Errors
    /// Returns `Error::NoRuntime` if a fetch must start outside a tokio runtime.
    pub fn query<T, E, F, Fut>(&self, key: impl Into<CacheKey>, query_fn: F) -> Result<Query<T, E>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response<T, E>> + Send + 'static,
        T: Clone + Send + Sync + 'static,
        E: Clone + fmt::Debug + Send + Sync + 'static,
    {
        use_api_query(&self.client, key, query_fn)
    }

    /// Subscribe with options. See [`use_api_query_with`].
    ///
    /// # Errors
    /// Returns `Error::NoRuntime` if a fetch must start outside a tokio runtime.
    pub fn query_with<T, E, F, Fut>(
        &self,
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
        use_api_query_with(&self.client, key, query_fn, options, request_options)
    }

    /// Create a mutation handle. See [`use_api_mutation`].
    pub fn mutation<B, T, E, F, Fut>(&self, mutation_fn: F) -> Mutation<B, T, E>
    where
        F: Fn(B) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response<T, E>> + Send + 'static,
        B: Clone + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
        E: Clone + fmt::Debug + Send + Sync + 'static,
    {
        use_api_mutation(&self.client, mutation_fn)
    }

    /// Create a mutation handle with options. See [`use_api_mutation_with`].
    pub fn mutation_with<B, T, E, F, Fut>(
        &self,
        mutation_fn: F,
        options: MutationOptions<B, T, E>,
        request_options: RequestOptions,
    ) -> Mutation<B, T, E>
    where
        F: Fn(B, RequestOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response<T, E>> + Send + 'static,
        B: Clone + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
        E: Clone + fmt::Debug + Send + Sync + 'static,
    {
        use_api_mutation_with(&self.client, mutation_fn, options, request_options)
    }

    /// Mark `key` (and every key it prefixes) stale; observed entries
    /// refetch in the background. Returns once marking is done.
    ///
    /// # Errors
    /// Returns `Error::NoRuntime` if a refetch had to start without a runtime.
    pub fn invalidate(&self, key: impl Into<CacheKey>) -> Result<usize> {
        self.client.invalidate_queries(key)
    }

    /// Overwrite the cached value, e.g. for optimistic updates.
    pub fn set_data<T: Send + Sync + 'static>(&self, key: impl Into<CacheKey>, value: T) {
        self.client.set_query_data(key, value)
    }

    /// Read the cached value without subscribing.
    ///
    /// # Errors
    /// Returns `Error::TypeMismatch` if the key holds a value of another type.
    pub fn get_data<T: Clone + 'static>(&self, key: impl Into<CacheKey>) -> Result<Option<T>> {
        self.client.get_query_data(key)
    }

    /// Warm the cache for `key` without mounting an observer.
    pub async fn prefetch<T, E, F, Fut>(&self, key: impl Into<CacheKey>, query_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response<T, E>> + Send + 'static,
        T: Clone + Send + Sync + 'static,
        E: Clone + fmt::Debug + Send + Sync + 'static,
    {
        self.client
            .prefetch_query(key, query_fn, QueryOptions::default())
            .await
    }

    /// Fetch through the cache and return the result.
    ///
    /// # Errors
    /// Returns the normalized request error.
    pub async fn fetch<T, E, F, Fut>(
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
        self.client.fetch_query(key, query_fn, options).await
    }

    /// The underlying engine handle.
    pub fn client(&self) -> &QueryClient {
        &self.client
    }
}

impl fmt::Debug for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api").field("client", &self.client).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key;

    #[test]
    fn test_use_api_outside_provider_fails() {
        let err = use_api().expect_err("no provider");
        assert_eq!(err, Error::NoProvider);
    }

    #[tokio::test]
    async fn test_use_api_inside_provider() {
        let client = QueryClient::new();
        let api = client
            .provide(async { use_api() })
            .await
            .expect("provided");
        assert!(api.client().ptr_eq(&client));
    }

    #[tokio::test]
    async fn test_nested_providers_use_innermost() {
        let outer = QueryClient::new();
        let inner = QueryClient::new();
        let seen = outer
            .provide(async { inner.provide(async { QueryClient::current() }).await })
            .await
            .expect("provided");
        assert!(seen.ptr_eq(&inner));
    }

    #[test]
    fn test_set_then_get_is_synchronous() {
        let api = QueryClient::new().api();
        api.set_data(cache_key!["k"], 42u32);
        assert_eq!(api.get_data::<u32>(cache_key!["k"]), Ok(Some(42)));
        assert_eq!(api.get_data::<u32>(cache_key!["other"]), Ok(None));
    }
}
