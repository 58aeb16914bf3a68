//! In-memory entry store.
//!
//! Uses DashMap for concurrent access with per-key sharding. Every write merges
//! a [`EntryPatch`] into the key's entry and then notifies the key's
//! subscribers. Entries live until [`CacheStore::clear`]; there is no eviction.

use crate::key::QueryKey;
use crate::observability::CacheStats;
use crate::registry::SubscriberRegistry;
use crate::task::FetchTask;
use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Type-erased cached value.
pub type AnyData = Arc<dyn Any + Send + Sync>;

/// Message stored when a fetch is cancelled.
pub const CANCELLED_MESSAGE: &str = "fetch cancelled";

/// One stored entry.
#[derive(Clone)]
pub struct EntryRecord {
    pub key: QueryKey,
    pub data: Option<AnyData>,
    pub error: Option<String>,
    /// `None` marks the entry stale.
    pub updated_at: Option<Instant>,
    pub in_flight: Option<FetchTask>,
}

impl EntryRecord {
    fn empty(key: QueryKey) -> Self {
        EntryRecord {
            key,
            data: None,
            error: None,
            updated_at: None,
            in_flight: None,
        }
    }

    /// Whether data is present and younger than `stale_time`.
    pub fn is_fresh(&self, stale_time: Duration) -> bool {
        self.data.is_some()
            && self
                .updated_at
                .is_some_and(|at| Instant::now().duration_since(at) < stale_time)
    }

    /// Clone the data out as `T`. A value of another type reads as absent.
    pub fn data_as<T: Clone + 'static>(&self) -> Option<T> {
        let data = self.data.as_ref()?;
        match data.downcast_ref::<T>() {
            Some(value) => Some(value.clone()),
            None => {
                warn!(
                    "⚠ Entry {} holds a different type than {}",
                    self.key,
                    std::any::type_name::<T>()
                );
                None
            }
        }
    }
}

#[derive(Clone, Debug, Default)]
enum InFlightPatch {
    #[default]
    Keep,
    Set(FetchTask),
    Clear,
}

/// Partial update for an entry. Unset fields keep their previous value.
#[derive(Clone, Default)]
pub struct EntryPatch {
    data: Option<AnyData>,
    error: Option<Option<String>>,
    updated_at: Option<Option<Instant>>,
    in_flight: InFlightPatch,
}

impl EntryPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(mut self, data: AnyData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(Some(message.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    /// Stamp the entry fresh as of now.
    pub fn fresh(mut self) -> Self {
        self.updated_at = Some(Some(Instant::now()));
        self
    }

    /// Mark the entry stale.
    pub fn stale(mut self) -> Self {
        self.updated_at = Some(None);
        self
    }

    pub fn in_flight(mut self, task: FetchTask) -> Self {
        self.in_flight = InFlightPatch::Set(task);
        self
    }

    pub fn clear_in_flight(mut self) -> Self {
        self.in_flight = InFlightPatch::Clear;
        self
    }

    fn apply(self, record: &mut EntryRecord) {
        if let Some(data) = self.data {
            record.data = Some(data);
        }
        if let Some(error) = self.error {
            record.error = error;
        }
        if let Some(updated_at) = self.updated_at {
            record.updated_at = updated_at;
        }
        match self.in_flight {
            InFlightPatch::Keep => {}
            InFlightPatch::Set(task) => record.in_flight = Some(task),
            InFlightPatch::Clear => record.in_flight = None,
        }
    }
}

/// Outcome of [`CacheStore::acquire`].
pub enum Acquired {
    /// Data is fresh; nothing to fetch.
    Fresh,
    /// A fetch is already running; wait on it.
    Joined(FetchTask),
    /// A new fetch was started by this caller.
    Started(FetchTask),
}

/// Thread-safe entry store with subscriber notification.
#[derive(Clone, Default)]
pub struct CacheStore {
    entries: Arc<DashMap<String, EntryRecord>>,
    registry: SubscriberRegistry,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    /// Snapshot of the entry for `key`.
    pub fn read(&self, key: &QueryKey) -> Option<EntryRecord> {
        self.entries.get(key.canonical()).map(|entry| entry.clone())
    }

    /// Merge `patch` into the entry for `key`, creating it if needed, then
    /// notify subscribers. Notifies even when nothing changed.
    pub fn write(&self, key: &QueryKey, patch: EntryPatch) {
        {
            let mut entry = self
                .entries
                .entry(key.canonical().to_string())
                .or_insert_with(|| EntryRecord::empty(key.clone()));
            patch.apply(&mut entry);
        }
        self.registry.notify(key.canonical());
    }

    /// Apply a fetch outcome, but only while the entry's in-flight marker is
    /// still `task_id`. The marker is cleared along with the write.
    ///
    /// Returns `false` without writing if the entry is gone or its marker was
    /// taken by a cancel, a direct write or a newer fetch.
    pub fn settle(&self, key: &QueryKey, task_id: u64, patch: EntryPatch) -> bool {
        let settled = match self.entries.get_mut(key.canonical()) {
            Some(mut entry) if entry.in_flight.as_ref().is_some_and(|t| t.id() == task_id) => {
                patch.clear_in_flight().apply(&mut entry);
                true
            }
            _ => false,
        };

        if settled {
            self.registry.notify(key.canonical());
        }
        settled
    }

    /// Mark an existing entry stale. Returns `false` if there is no entry.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        let existed = match self.entries.get_mut(key.canonical()) {
            Some(mut entry) => {
                entry.updated_at = None;
                true
            }
            None => false,
        };

        if existed {
            self.registry.notify(key.canonical());
        }
        existed
    }

    /// Keys of every entry covered by `prefix`.
    pub fn keys_matching(&self, prefix: &QueryKey) -> Vec<QueryKey> {
        self.entries
            .iter()
            .filter(|entry| prefix.is_prefix_of(&entry.key))
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Decide, atomically per key, whether to serve fresh data, join the
    /// running fetch, or start a new one with `start`.
    ///
    /// `stale_time` of `None` skips the freshness check.
    pub fn acquire<F>(&self, key: &QueryKey, stale_time: Option<Duration>, start: F) -> Acquired
    where
        F: FnOnce() -> FetchTask,
    {
        let started = {
            let mut entry = self
                .entries
                .entry(key.canonical().to_string())
                .or_insert_with(|| EntryRecord::empty(key.clone()));

            if stale_time.is_some_and(|stale_time| entry.is_fresh(stale_time)) {
                return Acquired::Fresh;
            }
            if let Some(task) = &entry.in_flight {
                return Acquired::Joined(task.clone());
            }

            let task = start();
            entry.in_flight = Some(task.clone());
            task
        };

        self.registry.notify(key.canonical());
        Acquired::Started(started)
    }

    /// Abort the running fetch for `key`. Data is kept; the entry records
    /// a cancellation error. Returns `false` if nothing was running.
    pub fn cancel(&self, key: &QueryKey) -> bool {
        let task = match self.entries.get_mut(key.canonical()) {
            Some(mut entry) => entry.in_flight.take(),
            None => None,
        };

        match task {
            Some(task) => {
                task.cancel();
                self.write(key, EntryPatch::new().error(CANCELLED_MESSAGE));
                warn!("⚠ Fetch for {} cancelled", key);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Abort all running fetches and drop every entry and subscriber.
    pub fn clear(&self) {
        for entry in self.entries.iter() {
            if let Some(task) = &entry.in_flight {
                task.cancel();
            }
        }
        self.entries.clear();
        self.registry.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            total_entries: self.entries.len(),
            subscribed_keys: self.registry.key_count(),
            subscribers: self.registry.total_subscribers(),
            ..CacheStats::default()
        };
        for entry in self.entries.iter() {
            if entry.updated_at.is_none() {
                stats.stale_entries += 1;
            }
            if entry.in_flight.is_some() {
                stats.in_flight_entries += 1;
            }
        }
        stats
    }
}
