//! Metrics hooks and statistics for query cache operations.
//!
//! Implement [`CacheMetrics`] to forward cache events to your monitoring
//! system:
//!
//! ```ignore
//! use query_cache::observability::CacheMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl CacheMetrics for PrometheusMetrics {
//!     fn record_fresh_hit(&self, _key: &str) {
//!         // counter!("query_cache_fresh_hits").inc();
//!     }
//!
//!     fn record_fetch_settled(&self, _key: &str, duration: Duration, _ok: bool) {
//!         // histogram!("query_cache_fetch_latency").record(duration);
//!     }
//! }
//!
//! // let cache = QueryCache::with_metrics(CacheConfig::default(), Box::new(PrometheusMetrics));
//! ```
//!
//! The default sink is [`NoOpMetrics`]. The trait's own default methods log
//! through the `log` crate, so an implementation only overrides what it needs.

use std::time::Duration;

/// Trait for query cache metrics collection.
pub trait CacheMetrics: Send + Sync {
    /// Cached data was served without fetching.
    fn record_fresh_hit(&self, key: &str) {
        debug!("Query FRESH HIT: {}", key);
    }

    /// A caller joined a fetch that was already running.
    fn record_coalesced(&self, key: &str) {
        debug!("Query COALESCED: {}", key);
    }

    /// A new fetch was started.
    fn record_fetch_started(&self, key: &str) {
        debug!("Query FETCH: {}", key);
    }

    /// A fetch this caller started or joined has settled.
    fn record_fetch_settled(&self, key: &str, duration: Duration, ok: bool) {
        if ok {
            debug!("Query SETTLED: {} took {:?}", key, duration);
        } else {
            warn!("Query FAILED: {} after {:?}", key, duration);
        }
    }

    /// An entry was marked stale.
    fn record_invalidate(&self, key: &str) {
        debug!("Query INVALIDATE: {}", key);
    }

    /// Data was written directly, bypassing a fetch.
    fn record_optimistic_write(&self, key: &str) {
        debug!("Query SET DATA: {}", key);
    }
}

/// Default metrics implementation (no-op).
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {
    fn record_fresh_hit(&self, _key: &str) {}
    fn record_coalesced(&self, _key: &str) {}
    fn record_fetch_started(&self, _key: &str) {}
    fn record_fetch_settled(&self, _key: &str, _duration: Duration, _ok: bool) {}
    fn record_invalidate(&self, _key: &str) {}
    fn record_optimistic_write(&self, _key: &str) {}
}

/// Point-in-time statistics for a cache.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries in the store.
    pub total_entries: usize,
    /// Entries with no freshness timestamp (never settled, or invalidated).
    pub stale_entries: usize,
    /// Entries with a fetch running.
    pub in_flight_entries: usize,
    /// Keys with at least one subscriber.
    pub subscribed_keys: usize,
    /// Subscribers across all keys.
    pub subscribers: usize,
}
