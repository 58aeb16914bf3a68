//! Error types for the query cache.
//!
//! The query and invalidation surface never returns errors: fetch failures are
//! captured into the cache entry and surfaced through a binding's `error()`.
//! `Error` is returned only where construction can be rejected (keys, config)
//! and where a settled fetch is reported as a value.

use std::fmt;

/// Result type for query cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the query cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A query key was rejected at construction.
    ///
    /// Returned when:
    /// - A text key is empty
    /// - A text key begins with `[` and would collide with structured keys
    /// - A structured key has no segments
    InvalidKey(String),

    /// A key segment could not be serialized into its canonical form.
    SerializationError(String),

    /// Configuration could not be parsed or failed validation.
    ///
    /// **Recovery:** Fix configuration and rebuild the cache.
    ConfigError(String),

    /// A fetch settled with a failure.
    ///
    /// Carries the message stored on the cache entry.
    FetchError(String),

    /// The fetch task was cancelled before it settled.
    Cancelled,

    /// Generic error with custom message.
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidKey(msg) => write!(f, "Invalid query key: {}", msg),
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::FetchError(msg) => write!(f, "Fetch error: {}", msg),
            Error::Cancelled => write!(f, "Fetch cancelled"),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_syntax() || e.is_data() || e.is_eof() {
            Error::ConfigError(e.to_string())
        } else {
            Error::SerializationError(e.to_string())
        }
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

/// Render a fetch failure as the message stored on a cache entry.
///
/// Falls back to `fallback` when the failure renders as an empty string.
pub(crate) fn failure_message<E: fmt::Display>(error: &E, fallback: &str) -> String {
    let message = error.to_string();
    if message.trim().is_empty() {
        fallback.to_string()
    } else {
        message
    }
}
