//! Observability hooks for engine activity.
//!
//! Implement [`QueryMetrics`] to feed fetch, hit and invalidation counts
//! into your monitoring system:
//!
//! ```
//! use query_kit::observability::QueryMetrics;
//! use query_kit::{CacheKey, QueryCache, QueryClient};
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl QueryMetrics for PrometheusMetrics {
//!     fn record_fetch(&self, _key: &CacheKey, _duration: Duration, _ok: bool) {
//!         // histogram!("query_fetch_latency").record(duration);
//!     }
//! }
//!
//! let client: QueryClient = QueryCache::new()
//!     .with_metrics(Box::new(PrometheusMetrics))
//!     .into();
//! ```
//!
//! Methods you don't override fall back to `log` output. The client uses
//! [`NoOpMetrics`] unless told otherwise.

use crate::key::CacheKey;
use std::time::Duration;

/// Trait for engine metrics collection.
pub trait QueryMetrics: Send + Sync {
    /// A fetch settled (after retries). `ok` is false for error settlements.
    fn record_fetch(&self, key: &CacheKey, duration: Duration, ok: bool) {
        debug!("Query FETCH: {} took {:?} (ok: {})", key, duration, ok);
    }

    /// An observer was served fresh cached data without a request.
    fn record_hit(&self, key: &CacheKey) {
        debug!("Query HIT: {}", key);
    }

    /// A fetch trigger joined an already running request.
    fn record_dedup(&self, key: &CacheKey) {
        debug!("Query DEDUP: {}", key);
    }

    /// One attempt failed.
    fn record_error(&self, key: &CacheKey, error: &str) {
        warn!("Query ERROR for {}: {}", key, error);
    }

    fn record_invalidate(&self, key: &CacheKey) {
        debug!("Query INVALIDATE: {}", key);
    }

    /// An unobserved entry was garbage-collected.
    fn record_gc(&self, key: &CacheKey) {
        debug!("Query GC: {}", key);
    }
}

/// Default metrics implementation (no-op).
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl QueryMetrics for NoOpMetrics {
    fn record_fetch(&self, _key: &CacheKey, _duration: Duration, _ok: bool) {}
    fn record_hit(&self, _key: &CacheKey) {}
    fn record_dedup(&self, _key: &CacheKey) {}
    fn record_error(&self, _key: &CacheKey, _error: &str) {}
    fn record_invalidate(&self, _key: &CacheKey) {}
    fn record_gc(&self, _key: &CacheKey) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LoggingMetrics;
    impl QueryMetrics for LoggingMetrics {}

    #[test]
    fn test_noop_metrics() {
        let metrics = NoOpMetrics;
        let key = CacheKey::new().push("k");
        metrics.record_fetch(&key, Duration::from_millis(3), true);
        metrics.record_hit(&key);
    }

    #[derive(Clone, Default)]
    struct CountingMetrics {
        invalidations: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl QueryMetrics for CountingMetrics {
        fn record_invalidate(&self, _key: &CacheKey) {
            self.invalidations
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_metrics_installed_through_cache_builder() {
        let metrics = CountingMetrics::default();
        let client: crate::QueryClient = crate::QueryCache::new()
            .with_metrics(Box::new(metrics.clone()))
            .into();
        client.set_query_data(CacheKey::new().push("k"), 1u32);

        assert_eq!(client.invalidate_queries(CacheKey::new().push("k")), Ok(1));
        assert_eq!(
            metrics
                .invalidations
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[test]
    fn test_default_methods_log() {
        let metrics = LoggingMetrics;
        let key = CacheKey::new().push("k");
        metrics.record_error(&key, "boom");
        metrics.record_gc(&key);
    }
}
