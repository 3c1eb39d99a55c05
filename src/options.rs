//! Engine configuration: client-wide defaults and per-call overrides.
//!
//! # Setup-Time vs Per-Call Configuration
//!
//! - **Setup-time**: [`ClientConfig`] is given once to
//!   [`QueryClient::with_config`](crate::QueryClient::with_config) and applies to every
//!   query and mutation on that client.
//! - **Per-call**: [`QueryOptions`] / [`MutationOptions`] override single
//!   fields; anything left `None` falls back to the client default.
//!
//! ```
//! use query_kit::options::{ClientConfig, QueryOptions};
//! use std::time::Duration;
//!
//! let config = ClientConfig::from_json(r#"{ "stale_time_ms": 30000 }"#).unwrap();
//! assert_eq!(config.stale_time(), Duration::from_secs(30));
//!
//! let opts = QueryOptions::default()
//!     .with_stale_time(Duration::from_secs(60))
//!     .with_retry(0);
//! assert_eq!(opts.retry, Some(0));
//! ```

use crate::envelope::FetchError;
use crate::error::Result;
use crate::mutation::MutationContext;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Client-wide defaults. Loadable from JSON; every field is optional.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long fetched data counts as fresh. `null` means forever.
    pub stale_time_ms: Option<u64>,
    /// How long an unobserved entry is kept before removal.
    pub gc_time_ms: u64,
    pub query_retries: u32,
    pub mutation_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            stale_time_ms: Some(0),
            gc_time_ms: 5 * 60 * 1000,
            query_retries: 3,
            mutation_retries: 0,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
        }
    }
}

impl ClientConfig {
    /// Parse a JSON configuration document.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if the document is malformed or the
    /// retry delays are inconsistent.
    pub fn from_json(s: &str) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` when `retry_max_delay_ms < retry_base_delay_ms`.
    pub fn validate(&self) -> Result<()> {
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(crate::error::Error::ConfigError(format!(
                "retry_max_delay_ms ({}) is below retry_base_delay_ms ({})",
                self.retry_max_delay_ms, self.retry_base_delay_ms
            )));
        }
        Ok(())
    }

    pub fn stale_time(&self) -> Duration {
        self.stale_time_ms
            .map_or(Duration::MAX, Duration::from_millis)
    }

    pub fn gc_time(&self) -> Duration {
        Duration::from_millis(self.gc_time_ms)
    }

    pub fn query_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.query_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn mutation_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.mutation_retries,
            ..self.query_retry_policy()
        }
    }
}

/// Retry with exponential backoff: `min(base * 2^attempt, max)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one (0 = no retry).
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn never() -> Self {
        RetryPolicy {
            retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Per-query overrides of [`ClientConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryOptions {
    pub stale_time: Option<Duration>,
    pub gc_time: Option<Duration>,
    /// Retry count; delays follow the client's backoff.
    pub retry: Option<u32>,
    /// `false` keeps the query idle: it never fetches on its own.
    pub enabled: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            stale_time: None,
            gc_time: None,
            retry: None,
            enabled: true,
        }
    }
}

impl QueryOptions {
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Fetched data never goes stale on its own; only invalidation refetches.
    pub fn stale_forever(mut self) -> Self {
        self.stale_time = Some(Duration::MAX);
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    pub fn with_retry(mut self, count: u32) -> Self {
        self.retry = Some(count);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub(crate) fn resolve(&self, config: &ClientConfig) -> ResolvedQueryOptions {
        let mut retry = config.query_retry_policy();
        if let Some(count) = self.retry {
            retry.retries = count;
        }
        ResolvedQueryOptions {
            stale_time: self.stale_time.unwrap_or_else(|| config.stale_time()),
            gc_time: self.gc_time.unwrap_or_else(|| config.gc_time()),
            retry,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ResolvedQueryOptions {
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub retry: RetryPolicy,
}

type SuccessFn<B, T> = dyn Fn(&T, &B, &MutationContext) + Send + Sync;
type ErrorFn<B, E> = dyn Fn(&FetchError<E>, &B, &MutationContext) + Send + Sync;
type SettledFn<B, T, E> =
    dyn Fn(Option<&T>, Option<&FetchError<E>>, &B, &MutationContext) + Send + Sync;

/// Per-mutation options and lifecycle callbacks.
///
/// Callbacks run once per settlement, after `MutationState` has moved.
pub struct MutationOptions<B, T, E> {
    pub retry: Option<u32>,
    pub(crate) on_success: Option<Arc<SuccessFn<B, T>>>,
    pub(crate) on_error: Option<Arc<ErrorFn<B, E>>>,
    pub(crate) on_settled: Option<Arc<SettledFn<B, T, E>>>,
}

impl<B, T, E> Default for MutationOptions<B, T, E> {
    fn default() -> Self {
        MutationOptions {
            retry: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<B, T, E> Clone for MutationOptions<B, T, E> {
    fn clone(&self) -> Self {
        MutationOptions {
            retry: self.retry,
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

impl<B, T, E> fmt::Debug for MutationOptions<B, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("retry", &self.retry)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_settled", &self.on_settled.is_some())
            .finish()
    }
}

impl<B, T, E> MutationOptions<B, T, E> {
    pub fn with_retry(mut self, count: u32) -> Self {
        self.retry = Some(count);
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&T, &B, &MutationContext) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&FetchError<E>, &B, &MutationContext) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_settled<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&T>, Option<&FetchError<E>>, &B, &MutationContext) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(f));
        self
    }

    pub(crate) fn retry_policy(&self, config: &ClientConfig) -> RetryPolicy {
        let mut retry = config.mutation_retry_policy();
        if let Some(count) = self.retry {
            retry.retries = count;
        }
        retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.stale_time(), Duration::ZERO);
        assert_eq!(config.gc_time(), Duration::from_secs(300));
        assert_eq!(config.query_retry_policy().retries, 3);
        assert_eq!(config.mutation_retry_policy().retries, 0);
    }

    #[test]
    fn test_client_config_from_json() {
        let config = ClientConfig::from_json(r#"{"stale_time_ms": null, "query_retries": 1}"#)
            .expect("valid config");
        assert_eq!(config.stale_time(), Duration::MAX);
        assert_eq!(config.query_retries, 1);
        assert_eq!(config.gc_time_ms, 300_000);
    }

    #[test]
    fn test_client_config_rejects_inverted_delays() {
        let err = ClientConfig::from_json(
            r#"{"retry_base_delay_ms": 5000, "retry_max_delay_ms": 100}"#,
        )
        .expect_err("should be rejected");
        assert!(matches!(err, crate::error::Error::ConfigError(_)));
    }

    #[test]
    fn test_retry_policy_backoff_is_capped() {
        let policy = ClientConfig::default().query_retry_policy();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(16));
        assert_eq!(policy.delay(5), Duration::from_secs(30));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_query_options_override_client_defaults() {
        let config = ClientConfig::default();
        let resolved = QueryOptions::default()
            .stale_forever()
            .with_retry(0)
            .resolve(&config);
        assert_eq!(resolved.stale_time, Duration::MAX);
        assert_eq!(resolved.retry.retries, 0);
        assert_eq!(resolved.gc_time, config.gc_time());
    }
}
