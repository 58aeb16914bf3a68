//! # query-cache
//!
//! An in-memory cached-query and optimistic-mutation engine for UI sessions.
//!
//! ## Features
//!
//! - **Request coalescing:** concurrent requests for one key share a single fetch
//! - **Stale-while-revalidate:** cached data stays visible while it refetches
//! - **Multiple consumers:** every binding on a key is notified of each write
//! - **Optimistic writes:** update locally, roll back if the remote effect fails
//! - **Structural invalidation:** invalidate a whole family of keys by prefix
//! - **Isolated stores:** each [`QueryCache`] is its own store; nothing is global
//!
//! ## Quick Start
//!
//! ```no_run
//! use query_cache::{QueryCache, QueryKey, QueryOptions};
//! use std::time::Duration;
//!
//! #[derive(Clone, Debug)]
//! struct Client {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 1. Create the cache (clone it freely; clones share the store)
//!     let cache = QueryCache::new();
//!
//!     // 2. Describe the query
//!     let key = QueryKey::builder("admin-clients").build()?;
//!     let options = QueryOptions::new(key).stale_time(Duration::from_secs(60));
//!
//!     // 3. Bind and activate
//!     let clients = cache.bind(options, || async {
//!         Ok::<_, std::io::Error>(vec![Client { id: "1".to_string() }])
//!     });
//!     clients.activate().await;
//!
//!     // 4. Optimistic mutation with rollback
//!     let added = clients
//!         .mutate(
//!             |prev: Option<&Vec<Client>>| {
//!                 prev.map(|list| {
//!                     let mut list = list.clone();
//!                     list.push(Client { id: "2".to_string() });
//!                     list
//!                 })
//!             },
//!             || async { Ok::<_, std::io::Error>(()) },
//!         )
//!         .await;
//!     assert!(added.is_ok());
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate log;

pub mod binding;
pub mod client;
pub mod config;
pub mod error;
pub mod key;
pub mod mutation;
pub mod observability;
pub mod registry;
pub mod store;
pub mod task;

// Re-exports for convenience
pub use binding::{QueryBinding, QueryOptions, QueryState};
pub use client::{CacheEntry, QueryCache};
pub use config::CacheConfig;
pub use error::{Error, Result};
pub use key::{KeyBuilder, QueryKey};
pub use mutation::OptimisticUpdate;
pub use observability::{CacheMetrics, CacheStats, NoOpMetrics};
pub use registry::Subscription;
pub use task::{FetchTask, Settlement};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
