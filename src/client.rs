//! The query cache: an explicitly constructed, shareable store plus the
//! read, write and invalidation surface used around remote mutations.

use crate::binding::{QueryBinding, QueryOptions};
use crate::config::CacheConfig;
use crate::error::failure_message;
use crate::key::QueryKey;
use crate::mutation::OptimisticUpdate;
use crate::observability::{CacheMetrics, CacheStats, NoOpMetrics};
use crate::registry::Subscription;
use crate::store::{Acquired, AnyData, CacheStore, EntryPatch, EntryRecord};
use crate::task::{FetchTask, Settlement};
use futures::future::{BoxFuture, FutureExt};
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Message stored when a fetch function panics.
pub const PANIC_MESSAGE: &str = "fetch task panicked";

/// Type-erased fetch function; failures are already rendered to messages.
pub(crate) type FetchFn<T> =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<T, String>> + Send + Sync>;

/// Typed snapshot of one entry.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry<T> {
    pub data: Option<T>,
    pub error: Option<String>,
    /// `None` when the entry is stale.
    pub updated_at: Option<Instant>,
    pub is_fetching: bool,
}

/// Shared in-memory query cache.
///
/// `QueryCache` is `Clone`; clones share one store. Separate `QueryCache::new()`
/// calls give fully isolated stores.
///
/// # Example
///
/// ```no_run
/// use query_cache::{QueryCache, QueryKey, QueryOptions};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let cache = QueryCache::new();
///     let key = QueryKey::builder("admin-clients").build()?;
///
///     let clients = cache.bind(QueryOptions::new(key.clone()), || async {
///         Ok::<_, std::io::Error>(vec!["Ada".to_string()])
///     });
///     clients.activate().await;
///     assert_eq!(clients.data(), Some(vec!["Ada".to_string()]));
///
///     // After a remote write elsewhere
///     cache.invalidate_prefix(&QueryKey::builder("admin-clients").build()?);
///     clients.refetch().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    store: CacheStore,
    config: CacheConfig,
    metrics: Box<dyn CacheMetrics>,
}

impl QueryCache {
    /// Create an empty cache with default configuration.
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Create an empty cache with the given configuration.
    pub fn with_config(config: CacheConfig) -> Self {
        Self::with_metrics(config, Box::new(NoOpMetrics))
    }

    /// Create an empty cache with custom metrics.
    pub fn with_metrics(config: CacheConfig, metrics: Box<dyn CacheMetrics>) -> Self {
        QueryCache {
            inner: Arc::new(CacheInner {
                store: CacheStore::new(),
                config,
                metrics,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Get a reference to the underlying store (for advanced use).
    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    /// Attach a query binding for `options.key`.
    ///
    /// The binding subscribes immediately (when enabled); call
    /// [`QueryBinding::activate`] to run the first fetch decision.
    pub fn bind<T, F, Fut, E>(&self, options: QueryOptions, fetch: F) -> QueryBinding<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Display,
    {
        let fallback = self.inner.config.fallback_error_message.clone();
        let fetch: FetchFn<T> = Arc::new(move || {
            let pending = fetch();
            let fallback = fallback.clone();
            async move { pending.await.map_err(|e| failure_message(&e, &fallback)) }.boxed()
        });

        let stale_time = options
            .stale_time
            .unwrap_or(self.inner.config.default_stale_time);
        QueryBinding::attach(self.clone(), options.key, fetch, stale_time, options.enabled)
    }

    /// Serve fresh data, join the running fetch, or start one.
    ///
    /// Returns `None` on a fresh hit. `stale_time` of `None` forces past the
    /// freshness check.
    pub(crate) fn begin<T>(
        &self,
        key: &QueryKey,
        fetch: &FetchFn<T>,
        stale_time: Option<Duration>,
    ) -> Option<FetchTask>
    where
        T: Send + Sync + 'static,
    {
        let acquired = self.inner.store.acquire(key, stale_time, || {
            let inner = Arc::clone(&self.inner);
            let key = key.clone();
            let fetch = Arc::clone(fetch);
            FetchTask::spawn(move |task_id| run_fetch(inner, key, fetch, task_id))
        });

        match acquired {
            Acquired::Fresh => {
                self.inner.metrics.record_fresh_hit(key.canonical());
                None
            }
            Acquired::Joined(task) => {
                debug!("» Joining fetch #{} for {}", task.id(), key);
                self.inner.metrics.record_coalesced(key.canonical());
                Some(task)
            }
            Acquired::Started(task) => {
                debug!("» Started fetch #{} for {}", task.id(), key);
                self.inner.metrics.record_fetch_started(key.canonical());
                Some(task)
            }
        }
    }

    /// Typed snapshot of the entry for `key`.
    pub fn entry<T: Clone + 'static>(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
        self.inner.store.read(key).map(|record| CacheEntry {
            data: record.data_as::<T>(),
            error: record.error.clone(),
            updated_at: record.updated_at,
            is_fetching: record.in_flight.is_some(),
        })
    }

    /// Cached data for `key`, if any.
    pub fn get_query_data<T: Clone + 'static>(&self, key: &QueryKey) -> Option<T> {
        self.inner.store.read(key)?.data_as::<T>()
    }

    /// Write `value` as fresh data, clearing the error and in-flight marker.
    ///
    /// A fetch still running for `key` no longer owns the entry afterwards;
    /// its result is dropped and its waiters see `Settlement::Cancelled`.
    pub fn set_query_data<T: Send + Sync + 'static>(&self, key: &QueryKey, value: T) {
        let data: AnyData = Arc::new(value);
        self.inner.store.write(
            key,
            EntryPatch::new()
                .data(data)
                .clear_error()
                .fresh()
                .clear_in_flight(),
        );
        self.inner.metrics.record_optimistic_write(key.canonical());
    }

    /// Derive new data from the current value.
    ///
    /// `updater` sees `None` when there is no entry, no data, or data of
    /// another type. Returning `None` leaves the entry untouched. Returns
    /// whether a write happened.
    ///
    /// ```
    /// use query_cache::{QueryCache, QueryKey};
    ///
    /// let cache = QueryCache::new();
    /// let counter = QueryKey::builder("counter").build().unwrap();
    ///
    /// // Nothing to increment yet.
    /// assert!(!cache.update_query_data(&counter, |prev: Option<&u32>| prev.map(|n| n + 1)));
    ///
    /// // Seeding must be explicit.
    /// cache.update_query_data(&counter, |prev: Option<&u32>| Some(prev.copied().unwrap_or(0) + 1));
    /// assert_eq!(cache.get_query_data::<u32>(&counter), Some(1));
    /// ```
    pub fn update_query_data<T, F>(&self, key: &QueryKey, updater: F) -> bool
    where
        T: Send + Sync + 'static,
        F: FnOnce(Option<&T>) -> Option<T>,
    {
        let record = self.inner.store.read(key);
        let current = record.as_ref().and_then(typed_ref::<T>);

        match updater(current) {
            Some(next) => {
                self.set_query_data(key, next);
                true
            }
            None => {
                debug!("Update for {} produced nothing; entry unchanged", key);
                false
            }
        }
    }

    /// Mark the entry for `key` stale, keeping its data.
    ///
    /// Returns `false` (and does nothing) if there is no entry.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        let invalidated = self.inner.store.invalidate(key);
        if invalidated {
            self.inner.metrics.record_invalidate(key.canonical());
        }
        invalidated
    }

    /// Invalidate every entry covered by `prefix`; see
    /// [`QueryKey::is_prefix_of`]. Returns the number of entries invalidated.
    pub fn invalidate_prefix(&self, prefix: &QueryKey) -> usize {
        let keys = self.inner.store.keys_matching(prefix);
        let count = keys.iter().filter(|key| self.invalidate(key)).count();
        debug!("✓ Invalidated {} entries under {}", count, prefix);
        count
    }

    /// Abort the fetch running for `key`. Returns `false` if none was.
    pub fn cancel(&self, key: &QueryKey) -> bool {
        self.inner.store.cancel(key)
    }

    /// Register a raw listener for writes to `key`.
    pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .store
            .registry()
            .subscribe(key.canonical(), Arc::new(listener))
    }

    /// Run the optimistic mutation protocol against `key`.
    ///
    /// 1. Snapshot the current data.
    /// 2. Write `updater`'s result so observers update immediately.
    /// 3. Await `effect`.
    /// 4. On failure restore the snapshot and return the effect's error; on
    ///    success invalidate `key` so the next read reconciles with the remote.
    ///
    /// # Errors
    ///
    /// Returns the effect's own error unchanged, after rolling back.
    pub async fn mutate<T, U, Fx, Fut, R, E>(
        &self,
        key: &QueryKey,
        updater: U,
        effect: Fx,
    ) -> std::result::Result<R, E>
    where
        T: Clone + Send + Sync + 'static,
        U: FnOnce(Option<&T>) -> Option<T>,
        Fx: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
    {
        let update = OptimisticUpdate::apply(self, key, updater);
        match effect().await {
            Ok(value) => {
                update.confirm();
                Ok(value)
            }
            Err(e) => {
                update.rollback();
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.store.stats()
    }

    /// Cancel every running fetch and drop all entries and subscribers.
    ///
    /// The cache stays usable afterwards, starting empty.
    pub fn teardown(&self) {
        let stats = self.inner.store.stats();
        self.inner.store.clear();
        warn!(
            "⚠ Query cache torn down ({} entries, {} in flight)",
            stats.total_entries, stats.in_flight_entries
        );
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

fn typed_ref<T: 'static>(record: &EntryRecord) -> Option<&T> {
    let data = record.data.as_ref()?;
    let typed = data.downcast_ref::<T>();
    if typed.is_none() {
        warn!(
            "⚠ Entry {} holds a different type than {}",
            record.key,
            std::any::type_name::<T>()
        );
    }
    typed
}

/// Body of a spawned fetch: run it, write the outcome, report it.
async fn run_fetch<T>(
    inner: Arc<CacheInner>,
    key: QueryKey,
    fetch: FetchFn<T>,
    task_id: u64,
) -> Settlement
where
    T: Send + Sync + 'static,
{
    let timer = std::time::Instant::now();
    let outcome = AssertUnwindSafe(async { fetch().await })
        .catch_unwind()
        .await;

    let (patch, settlement) = match outcome {
        Ok(Ok(value)) => {
            let data: AnyData = Arc::new(value);
            (
                EntryPatch::new().data(data).clear_error().fresh(),
                Settlement::Succeeded,
            )
        }
        Ok(Err(message)) => (
            EntryPatch::new().error(message.clone()).fresh(),
            Settlement::Failed(message),
        ),
        Err(_) => (
            EntryPatch::new().error(PANIC_MESSAGE).fresh(),
            Settlement::Failed(PANIC_MESSAGE.to_string()),
        ),
    };

    if !inner.store.settle(&key, task_id, patch) {
        debug!("Fetch #{} for {} no longer owns its entry; result dropped", task_id, key);
        return Settlement::Cancelled;
    }

    inner.metrics.record_fetch_settled(
        key.canonical(),
        timer.elapsed(),
        settlement.is_success(),
    );
    settlement
}
