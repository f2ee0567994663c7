//! Query key codec.
//!
//! A [`QueryKey`] is an ordered list of segments. Its serialized form is the string the
//! [`CacheStore`](crate::store::CacheStore) is keyed by: a compact JSON array when every
//! segment is JSON-representable, otherwise a `:`-joined rendering of each segment with
//! explicit markers for values that have no plain textual form.
//!
//! ```
//! use query_kit::query_key;
//!
//! let key = query_key!["repo", "r1", 7];
//! assert_eq!(key.to_cache_key(), r#"["repo","r1",7]"#);
//!
//! // Prefix matching works on whole segments.
//! let parent = query_key!["repo"];
//! assert!(parent.matches(&key.to_cache_key()));
//! assert!(!parent.matches(&query_key!["repository"].to_cache_key()));
//! ```

use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Separator used by the fallback rendering.
pub const FALLBACK_SEPARATOR: &str = ":";

/// One element of a query key.
#[derive(Clone, Debug, PartialEq)]
pub enum KeySegment {
    /// JSON-representable value.
    Value(Value),

    /// Value that could not be turned into JSON; holds a descriptive label.
    Opaque(String),
}

/// Structured identifier of a cacheable resource.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryKey {
    segments: Vec<KeySegment>,
}

impl QueryKey {
    pub fn new() -> Self {
        QueryKey {
            segments: Vec::new(),
        }
    }

    /// Append a segment, builder style.
    pub fn with<S: Serialize>(mut self, part: S) -> Self {
        self.push(part);
        self
    }

    /// Append a segment.
    ///
    /// Values that fail to serialize (for example maps with non-string keys) are kept as
    /// [`KeySegment::Opaque`] labelled with their type name, which switches the whole key to
    /// the fallback rendering.
    pub fn push<S: Serialize>(&mut self, part: S) {
        let segment = match serde_json::to_value(&part) {
            Ok(value) => KeySegment::Value(value),
            Err(e) => {
                debug!(
                    "Key segment of type {} is not serializable ({}), using opaque marker",
                    std::any::type_name::<S>(),
                    e
                );
                KeySegment::Opaque(std::any::type_name::<S>().to_string())
            }
        };
        self.segments.push(segment);
    }

    /// Append an opaque segment with a caller-chosen label.
    pub fn push_opaque(&mut self, label: impl Into<String>) {
        self.segments.push(KeySegment::Opaque(label.into()));
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Serialized form used as the store key.
    pub fn to_cache_key(&self) -> String {
        serialize_key(self)
    }

    /// Whether `serialized` (a store key) is this key or lies under it.
    ///
    /// `["repo"]` matches `["repo"]` and `["repo","r1"]`, but not `["repository"]`.
    pub fn matches(&self, serialized: &str) -> bool {
        if self.segments.is_empty() {
            return true;
        }

        let full = self.to_cache_key();
        if serialized == full {
            return true;
        }

        if self.uses_fallback() || !full.ends_with(']') {
            return serialized.starts_with(&format!("{}{}", full, FALLBACK_SEPARATOR));
        }

        // Children holding an opaque segment are stored in the fallback form.
        serialized.starts_with(&format!("{},", &full[..full.len() - 1]))
            || serialized.starts_with(&format!(
                "{}{}",
                fallback_key(&self.segments),
                FALLBACK_SEPARATOR
            ))
    }

    fn uses_fallback(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| matches!(segment, KeySegment::Opaque(_)))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cache_key())
    }
}

impl From<&str> for QueryKey {
    fn from(part: &str) -> Self {
        QueryKey::new().with(part)
    }
}

impl From<String> for QueryKey {
    fn from(part: String) -> Self {
        QueryKey::new().with(part)
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        QueryKey {
            segments: parts.into_iter().map(KeySegment::Value).collect(),
        }
    }
}

/// Build a [`QueryKey`] from a list of serializable values.
///
/// ```
/// use query_kit::query_key;
///
/// let key = query_key!["user", 42, true];
/// assert_eq!(key.len(), 3);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($part:expr),* $(,)?) => {
        $crate::key::QueryKey::new()$(.with($part))*
    };
}

/// Deterministically serialize a key. Never fails.
pub fn serialize_key(key: &QueryKey) -> String {
    let mut values = Vec::with_capacity(key.segments.len());
    for segment in &key.segments {
        match segment {
            KeySegment::Value(value) => values.push(value),
            KeySegment::Opaque(_) => return fallback_key(&key.segments),
        }
    }

    match serde_json::to_string(&values) {
        Ok(serialized) => serialized,
        Err(e) => {
            warn!("Query key serialization failed ({}), using fallback", e);
            fallback_key(&key.segments)
        }
    }
}

/// Render each segment on its own and join them.
fn fallback_key(segments: &[KeySegment]) -> String {
    segments
        .iter()
        .map(render_segment)
        .collect::<Vec<_>>()
        .join(FALLBACK_SEPARATOR)
}

fn render_segment(segment: &KeySegment) -> String {
    match segment {
        KeySegment::Value(Value::Null) => "[null]".to_string(),
        // Quoted, so "1" stays distinct from 1 and "[null]" from null.
        KeySegment::Value(string @ Value::String(_)) => string.to_string(),
        KeySegment::Value(Value::Bool(b)) => b.to_string(),
        KeySegment::Value(Value::Number(n)) => n.to_string(),
        KeySegment::Value(nested @ (Value::Array(_) | Value::Object(_))) => {
            format!("[object:{}]", nested)
        }
        KeySegment::Opaque(label) => format!("[opaque:{}]", label),
    }
}
