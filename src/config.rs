//! Cache-wide configuration.
//!
//! Per-query overrides live on [`QueryOptions`](crate::binding::QueryOptions);
//! anything a query leaves unset falls back to the values here.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

/// Staleness threshold applied when a query does not supply one.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_millis(60_000);

/// Message stored on an entry when a fetch fails with an empty message.
pub const DEFAULT_FALLBACK_ERROR_MESSAGE: &str = "An unexpected error occurred.";

/// Configuration for a [`QueryCache`](crate::QueryCache).
///
/// # Example
///
/// ```
/// use query_cache::CacheConfig;
/// use std::time::Duration;
///
/// let config = CacheConfig::default()
///     .with_stale_time(Duration::from_secs(30))
///     .with_fallback_error_message("Something went wrong.");
///
/// assert_eq!(config.default_stale_time, Duration::from_secs(30));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Staleness threshold for queries that do not set their own.
    pub default_stale_time: Duration,

    /// Stored in place of a fetch failure whose message is blank.
    pub fallback_error_message: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            default_stale_time: DEFAULT_STALE_TIME,
            fallback_error_message: DEFAULT_FALLBACK_ERROR_MESSAGE.to_string(),
        }
    }
}

/// On-disk/wire shape of [`CacheConfig`]; every field is optional.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    stale_time_ms: Option<u64>,
    fallback_error_message: Option<String>,
}

impl CacheConfig {
    /// Override the default staleness threshold.
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.default_stale_time = stale_time;
        self
    }

    /// Override the fallback error message.
    pub fn with_fallback_error_message(mut self, message: impl Into<String>) -> Self {
        self.fallback_error_message = message.into();
        self
    }

    /// Parse a configuration from JSON.
    ///
    /// ```
    /// use query_cache::CacheConfig;
    /// use std::time::Duration;
    ///
    /// let config = CacheConfig::from_json(r#"{ "stale_time_ms": 1500 }"#).unwrap();
    /// assert_eq!(config.default_stale_time, Duration::from_millis(1500));
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` on malformed JSON, unknown fields, or a blank
    /// fallback message.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(json)?;
        let mut config = CacheConfig::default();

        if let Some(ms) = raw.stale_time_ms {
            config.default_stale_time = Duration::from_millis(ms);
        }
        if let Some(message) = raw.fallback_error_message {
            config.fallback_error_message = message;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the cache cannot use.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the fallback message is blank.
    pub fn validate(&self) -> Result<()> {
        if self.fallback_error_message.trim().is_empty() {
            return Err(Error::ConfigError(
                "fallback_error_message must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}
