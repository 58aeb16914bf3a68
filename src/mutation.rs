//! Optimistic updates with rollback.
//!
//! The protocol every mutation site follows:
//!
//! ```text
//! snapshot = current data
//! write optimistic value          -> observers update now
//! run the remote effect
//!   failed    -> restore snapshot, surface the error
//!   succeeded -> invalidate, refetch to reconcile with the remote
//! ```
//!
//! [`QueryCache::mutate`] and [`QueryBinding::mutate`](crate::QueryBinding::mutate)
//! run the whole sequence. [`OptimisticUpdate`] exposes the steps for callers
//! whose effect does not fit a single future, such as a mutation that must
//! also invalidate a family of related queries.

use crate::client::QueryCache;
use crate::key::QueryKey;

/// An optimistic write that has been applied and awaits confirmation.
///
/// ```
/// use query_cache::{OptimisticUpdate, QueryCache, QueryKey};
///
/// let cache = QueryCache::new();
/// let visits = QueryKey::builder("calendar-dashboard").push("unlocked").build().unwrap();
/// cache.set_query_data(&visits, vec!["09:00".to_string()]);
///
/// let update = OptimisticUpdate::apply(&cache, &visits, |prev: Option<&Vec<String>>| {
///     prev.map(|slots| slots.iter().map(|_| "10:00".to_string()).collect())
/// });
/// assert_eq!(cache.get_query_data::<Vec<String>>(&visits), Some(vec!["10:00".to_string()]));
///
/// // The remote update failed.
/// update.rollback();
/// assert_eq!(cache.get_query_data::<Vec<String>>(&visits), Some(vec!["09:00".to_string()]));
/// ```
#[must_use = "an applied update should be confirmed or rolled back"]
pub struct OptimisticUpdate<T>
where
    T: Clone + Send + Sync + 'static,
{
    cache: QueryCache,
    key: QueryKey,
    snapshot: Option<T>,
    applied: bool,
}

impl<T> OptimisticUpdate<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Snapshot the entry and write `updater`'s result.
    ///
    /// If `updater` returns `None` nothing is written and
    /// [`rollback`](Self::rollback) does nothing.
    pub fn apply<U>(cache: &QueryCache, key: &QueryKey, updater: U) -> Self
    where
        U: FnOnce(Option<&T>) -> Option<T>,
    {
        let snapshot = cache.get_query_data::<T>(key);
        let applied = cache.update_query_data(key, updater);

        OptimisticUpdate {
            cache: cache.clone(),
            key: key.clone(),
            snapshot,
            applied,
        }
    }

    /// Data as it was before the optimistic write.
    pub fn snapshot(&self) -> Option<&T> {
        self.snapshot.as_ref()
    }

    /// Whether the optimistic write happened.
    pub fn is_applied(&self) -> bool {
        self.applied
    }

    /// The remote effect failed: put the snapshot back.
    ///
    /// With no snapshot to restore, the entry is invalidated instead so its
    /// next read refetches; cached data is never removed.
    pub fn rollback(self) {
        if !self.applied {
            return;
        }

        match self.snapshot {
            Some(snapshot) => {
                self.cache.set_query_data(&self.key, snapshot);
                debug!("↺ Rolled back optimistic write to {}", self.key);
            }
            None => {
                self.cache.invalidate(&self.key);
                debug!(
                    "↺ No snapshot for {}; invalidated optimistic write",
                    self.key
                );
            }
        }
    }

    /// The remote effect succeeded: mark the entry stale so it reconciles.
    pub fn confirm(self) {
        self.cache.invalidate(&self.key);
    }

    /// Like [`confirm`](Self::confirm), also invalidating every entry under
    /// `prefix`. Returns how many entries the prefix covered.
    pub fn confirm_with_prefix(self, prefix: &QueryKey) -> usize {
        let count = self.cache.invalidate_prefix(prefix);
        self.cache.invalidate(&self.key);
        count
    }
}
