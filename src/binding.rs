//! Per-consumer query bindings.
//!
//! A binding is a consumer's live handle to one key. It owns no copy of the
//! data: `data()` and `error()` always read the shared entry. What a binding
//! does own is its fetching state and its subscription.
//!
//! # Fetch decision
//!
//! [`activate`](QueryBinding::activate) and [`refetch`](QueryBinding::refetch)
//! run the same steps:
//!
//! ```text
//! enabled?            no  -> nothing
//! fresh data?         yes -> serve it (activate only; refetch skips this)
//! fetch running?      yes -> wait on it
//! otherwise               -> start a fetch, wait on it
//! ```
//!
//! Failures never escape: they land in the entry's `error`, which the binding
//! exposes.

use crate::client::{FetchFn, QueryCache};
use crate::key::QueryKey;
use crate::registry::Subscription;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// Options for a query binding.
///
/// ```
/// use query_cache::{QueryKey, QueryOptions};
/// use std::time::Duration;
///
/// let key = QueryKey::builder("pending-coverage-claims").build().unwrap();
/// let options = QueryOptions::new(key)
///     .stale_time(Duration::from_secs(30))
///     .enabled(true);
/// assert_eq!(options.stale_time, Some(Duration::from_secs(30)));
/// ```
#[derive(Clone, Debug)]
pub struct QueryOptions {
    pub key: QueryKey,
    /// `None` uses the cache's configured default.
    pub stale_time: Option<Duration>,
    pub enabled: bool,
}

impl QueryOptions {
    pub fn new(key: QueryKey) -> Self {
        QueryOptions {
            key,
            stale_time: None,
            enabled: true,
        }
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Everything a consumer renders from a binding.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub error: Option<String>,
    /// No data yet and a fetch is outstanding.
    pub is_loading: bool,
    /// This binding is waiting on a fetch.
    pub is_fetching: bool,
}

struct BindingInner<T> {
    cache: QueryCache,
    key: QueryKey,
    fetch: FetchFn<T>,
    stale_time: Duration,
    enabled: bool,
    fetching: AtomicUsize,
    version: Arc<watch::Sender<u64>>,
}

impl<T> BindingInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn execute(&self, force: bool) {
        if !self.enabled {
            return;
        }

        let stale_time = if force { None } else { Some(self.stale_time) };
        let Some(task) = self.cache.begin(&self.key, &self.fetch, stale_time) else {
            return;
        };

        let _fetching = FetchingGuard::enter(self);
        let settlement = task.join().await;
        debug!("Binding for {} settled: {:?}", self.key, settlement);
    }

    fn bump(&self) {
        self.version.send_modify(|version| *version = version.wrapping_add(1));
    }
}

/// Holds the binding's fetching flag up for the duration of one wait, even if
/// the waiting future is dropped.
struct FetchingGuard<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: &'a BindingInner<T>,
}

impl<'a, T> FetchingGuard<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    fn enter(inner: &'a BindingInner<T>) -> Self {
        inner.fetching.fetch_add(1, Ordering::SeqCst);
        inner.bump();
        FetchingGuard { inner }
    }
}

impl<T> Drop for FetchingGuard<'_, T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.fetching.fetch_sub(1, Ordering::SeqCst);
        self.inner.bump();
    }
}

/// A consumer's handle to one query.
///
/// Dropping the binding unsubscribes it and cancels any scheduled refresh.
/// It does not cancel a running fetch, which still writes its result for
/// other consumers.
pub struct QueryBinding<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<BindingInner<T>>,
    _subscription: Option<Subscription>,
    scheduled_refresh: Mutex<Option<AbortHandle>>,
}

impl<T> QueryBinding<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn attach(
        cache: QueryCache,
        key: QueryKey,
        fetch: FetchFn<T>,
        stale_time: Duration,
        enabled: bool,
    ) -> Self {
        let (version, _) = watch::channel(0u64);
        let version = Arc::new(version);

        let subscription = enabled.then(|| {
            let version = Arc::clone(&version);
            cache.subscribe(&key, move || {
                version.send_modify(|version| *version = version.wrapping_add(1));
            })
        });

        QueryBinding {
            inner: Arc::new(BindingInner {
                cache,
                key,
                fetch,
                stale_time,
                enabled,
                fetching: AtomicUsize::new(0),
                version,
            }),
            _subscription: subscription,
            scheduled_refresh: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    pub fn stale_time(&self) -> Duration {
        self.inner.stale_time
    }

    /// Run the fetch decision as on attach: serve fresh data, join a running
    /// fetch, or start one. Returns once any fetch it waited on has settled.
    ///
    /// # Panics
    ///
    /// Panics if a fetch must be started outside a tokio runtime.
    pub async fn activate(&self) {
        self.inner.execute(false).await;
    }

    /// Fetch regardless of freshness (still joining a running fetch) and
    /// return once it settles. Inspect [`error`](Self::error) afterwards.
    ///
    /// # Panics
    ///
    /// Panics if a fetch must be started outside a tokio runtime.
    pub async fn refetch(&self) {
        self.inner.execute(true).await;
    }

    /// Current data of the shared entry.
    pub fn data(&self) -> Option<T> {
        self.inner.cache.get_query_data::<T>(&self.inner.key)
    }

    /// Last fetch failure recorded on the shared entry.
    pub fn error(&self) -> Option<String> {
        self.inner
            .cache
            .store()
            .read(&self.inner.key)
            .and_then(|record| record.error)
    }

    pub fn is_fetching(&self) -> bool {
        self.inner.fetching.load(Ordering::SeqCst) > 0
    }

    /// First load: no data to show yet while a fetch is outstanding.
    pub fn is_loading(&self) -> bool {
        self.inner.enabled && self.is_fetching() && self.data().is_none()
    }

    pub fn state(&self) -> QueryState<T> {
        let data = self.data();
        let is_fetching = self.is_fetching();
        QueryState {
            is_loading: self.inner.enabled && is_fetching && data.is_none(),
            error: self.error(),
            data,
            is_fetching,
        }
    }

    /// Receiver bumped on every write to the key and on every change of this
    /// binding's fetching state.
    pub fn changed(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    /// Invalidate and refetch after `delay`. A call made while a refresh is
    /// pending replaces it.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn schedule_refresh(&self, delay: Duration) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.cache.invalidate(&inner.key);
            inner.execute(false).await;
        });

        let previous = self
            .scheduled_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
            debug!("Replaced pending refresh for {}", self.inner.key);
        }
    }

    /// Optimistic mutation against this binding's key: write `updater`'s
    /// value, run `effect`, roll back on failure, and on success invalidate
    /// and refetch so the entry reconciles with the remote.
    ///
    /// # Errors
    ///
    /// Returns the effect's own error unchanged, after rolling back.
    pub async fn mutate<U, Fx, Fut, R, E>(&self, updater: U, effect: Fx) -> std::result::Result<R, E>
    where
        U: FnOnce(Option<&T>) -> Option<T>,
        Fx: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
    {
        let result = self
            .inner
            .cache
            .mutate(&self.inner.key, updater, effect)
            .await;
        if result.is_ok() {
            self.refetch().await;
        }
        result
    }
}

impl<T> Drop for QueryBinding<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let pending = self
            .scheduled_refresh
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pending) = pending {
            pending.abort();
        }
    }
}
