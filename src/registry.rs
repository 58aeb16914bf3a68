//! Per-key subscriber registry.
//!
//! Every write to a key's entry calls each of the key's listeners once, on the
//! writer's thread, before the write returns. Notifications are neither
//! batched nor ordered across listeners.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Notification callback.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Registry of listeners keyed by canonical key.
///
/// Cloning is cheap; clones share the same listener sets.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    listeners: DashMap<String, Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `key`.
    ///
    /// Registrations are independent: subscribing the same callback twice
    /// yields two notifications per write and needs two unsubscribes.
    pub fn subscribe(&self, key: &str, listener: Listener) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .entry(key.to_string())
            .or_default()
            .push((id, listener));
        debug!("✓ Subscribed #{} to {}", id, key);

        Subscription {
            registry: self.clone(),
            key: key.to_string(),
            id,
            active: true,
        }
    }

    /// Call every listener registered for `key`.
    ///
    /// Listeners run after the registry lock is released, so they may read the
    /// cache or (un)subscribe.
    pub fn notify(&self, key: &str) {
        let listeners: Vec<Listener> = match self.inner.listeners.get(key) {
            Some(list) => list.iter().map(|(_, listener)| Arc::clone(listener)).collect(),
            None => return,
        };

        for listener in listeners {
            listener();
        }
    }

    /// Number of listeners for `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner.listeners.get(key).map_or(0, |list| list.len())
    }

    /// Number of keys with at least one listener.
    pub fn key_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Total listeners across all keys.
    pub fn total_subscribers(&self) -> usize {
        self.inner.listeners.iter().map(|list| list.len()).sum()
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.inner.listeners.clear();
    }

    fn unsubscribe(&self, key: &str, id: u64) {
        let now_empty = match self.inner.listeners.get_mut(key) {
            Some(mut list) => {
                list.retain(|(listener_id, _)| *listener_id != id);
                list.is_empty()
            }
            None => return,
        };

        if now_empty {
            self.inner.listeners.remove_if(key, |_, list| list.is_empty());
        }
        debug!("✓ Unsubscribed #{} from {}", id, key);
    }
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("keys", &self.key_count())
            .field("subscribers", &self.total_subscribers())
            .finish()
    }
}

/// A single registration. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: SubscriberRegistry,
    key: String,
    id: u64,
    active: bool,
}

impl Subscription {
    /// Canonical key this registration listens to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remove exactly this registration.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.active {
            self.active = false;
            self.registry.unsubscribe(&self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}
