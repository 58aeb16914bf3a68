//! Query keys and their canonical serialization.
//!
//! A key is either an opaque string or an ordered list of JSON segments. The
//! canonical form is computed once at construction and is the only notion of
//! "same query" the cache has.

use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Clone, Debug, PartialEq, Eq)]
enum KeyShape {
    Text,
    Segments(Vec<Value>),
}

/// A validated query key with its canonical form.
///
/// # Example
///
/// ```
/// use query_cache::QueryKey;
///
/// let week = QueryKey::builder("calendar-dashboard")
///     .push("unlocked")
///     .push("all")
///     .build()
///     .unwrap();
///
/// assert_eq!(week.canonical(), r#"["calendar-dashboard","unlocked","all"]"#);
///
/// let family = QueryKey::builder("calendar-dashboard").build().unwrap();
/// assert!(family.is_prefix_of(&week));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryKey {
    shape: KeyShape,
    canonical: String,
}

impl QueryKey {
    /// Build an opaque string key. The canonical form is the string itself.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKey` if the string is empty or begins with `[`.
    pub fn text(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::InvalidKey("text key must not be empty".to_string()));
        }
        if key.starts_with('[') {
            return Err(Error::InvalidKey(format!(
                "text key {:?} collides with structured keys",
                key
            )));
        }

        Ok(QueryKey {
            shape: KeyShape::Text,
            canonical: key,
        })
    }

    /// Build a structured key from already-converted segments.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKey` if `segments` is empty.
    pub fn segments<I>(segments: I) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let segments: Vec<Value> = segments
            .into_iter()
            .map(|segment| sorted(segment.into()))
            .collect();
        if segments.is_empty() {
            return Err(Error::InvalidKey(
                "structured key needs at least one segment".to_string(),
            ));
        }

        let canonical = serde_json::to_string(&segments)?;
        Ok(QueryKey {
            shape: KeyShape::Segments(segments),
            canonical,
        })
    }

    /// Start a structured key whose first segment names the query family.
    pub fn builder(family: impl Into<String>) -> KeyBuilder {
        KeyBuilder {
            segments: vec![Value::String(family.into())],
            error: None,
        }
    }

    /// Canonical string used for lookup.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Whether this is a structured (segment list) key.
    pub fn is_structured(&self) -> bool {
        matches!(self.shape, KeyShape::Segments(_))
    }

    /// Whether `self`, used as an invalidation prefix, covers `other`.
    ///
    /// Structured prefixes match at element boundaries: `["dash","a"]` covers
    /// `["dash","a"]` and `["dash","a","b"]` but not `["dash","ab"]`. Text
    /// prefixes match text keys by plain string prefix. The two shapes never
    /// match each other.
    pub fn is_prefix_of(&self, other: &QueryKey) -> bool {
        match (&self.shape, &other.shape) {
            (KeyShape::Segments(prefix), KeyShape::Segments(segments)) => {
                segments.starts_with(prefix)
            }
            (KeyShape::Text, KeyShape::Text) => other.canonical.starts_with(&self.canonical),
            _ => false,
        }
    }
}

// Equal keys always share a canonical form.
impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Rebuild objects with their fields in sorted order so the canonical form
/// does not depend on serde_json's map implementation.
fn sorted(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(String, Value)> = map.into_iter().collect();
            fields.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(fields.into_iter().map(|(k, v)| (k, sorted(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

/// Builder for structured keys.
///
/// Errors from [`push_serialized`](KeyBuilder::push_serialized) are held until
/// [`build`](KeyBuilder::build).
#[derive(Debug)]
pub struct KeyBuilder {
    segments: Vec<Value>,
    error: Option<Error>,
}

impl KeyBuilder {
    /// Append a primitive segment.
    pub fn push(mut self, segment: impl Into<Value>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// Append an optional segment, using `fallback` when absent.
    ///
    /// Mirrors keys such as `[family, perspective or "unlocked", id or "all"]`.
    pub fn push_or(self, segment: Option<impl Into<Value>>, fallback: impl Into<Value>) -> Self {
        match segment {
            Some(segment) => self.push(segment),
            None => self.push(fallback),
        }
    }

    /// Append any serializable value as a segment.
    pub fn push_serialized<S: Serialize + ?Sized>(mut self, segment: &S) -> Self {
        if self.error.is_none() {
            match serde_json::to_value(segment) {
                Ok(value) => self.segments.push(value),
                Err(e) => self.error = Some(Error::SerializationError(e.to_string())),
            }
        }
        self
    }

    /// Finish the key.
    ///
    /// # Errors
    ///
    /// Returns the first segment serialization error, or `Error::InvalidKey`
    /// if the family name is empty.
    pub fn build(self) -> Result<QueryKey> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if matches!(self.segments.first(), Some(Value::String(family)) if family.is_empty()) {
            return Err(Error::InvalidKey("key family must not be empty".to_string()));
        }
        QueryKey::segments(self.segments)
    }
}
