//! Structural query keys.
//!
//! A [`QueryKey`] is an ordered sequence of JSON segments — strings,
//! numbers, nested records — identifying one cached result. Two keys are
//! equal iff their canonical serializations are equal: object keys are
//! sorted recursively, so `{a:1, b:2}` and `{b:2, a:1}` name the same
//! entry. Prefix matching ([`QueryKey::starts_with`]) is what powers
//! hierarchical invalidation (`["orders"]` invalidates
//! `["orders", "list", {...}]` and `["orders", "detail", "7"]` alike).

use std::fmt;
use std::hash::{Hash, Hasher};

use serde_json::Value;

/// Ordered, structurally comparable cache key.
#[derive(Clone)]
pub struct QueryKey {
    segments: Vec<Value>,
    canon: String,
}

impl QueryKey {
    pub fn new(segments: Vec<Value>) -> Self {
        let canon = canonical_segments(&segments);
        Self { segments, canon }
    }

    /// Build a key from anything convertible to JSON segments.
    ///
    /// ```rust
    /// # use skjold::cache::QueryKey;
    /// let k = QueryKey::from_parts(["orders", "detail", "7"]);
    /// assert_eq!(k.segments().len(), 3);
    /// ```
    pub fn from_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Value>,
    {
        Self::new(parts.into_iter().map(Into::into).collect())
    }

    /// Append a segment, returning the extended key.
    pub fn push(mut self, segment: impl Into<Value>) -> Self {
        self.segments.push(segment.into());
        self.canon = canonical_segments(&self.segments);
        self
    }

    pub fn segments(&self) -> &[Value] {
        &self.segments
    }

    /// The canonical serialization deciding equality and hashing.
    pub fn canonical(&self) -> &str {
        &self.canon
    }

    /// Whether this key begins with every segment of `prefix`.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self
                .segments
                .iter()
                .zip(&prefix.segments)
                .all(|(a, b)| canonical_value(a) == canonical_value(b))
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.canon == other.canon
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canon.hash(state);
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({})", self.canon)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canon)
    }
}

/// Convenience constructor for [`QueryKey`].
///
/// ```rust
/// # use skjold::key;
/// # use serde_json::json;
/// let k = key!["orders", "list", json!({"page": 1})];
/// ```
#[macro_export]
macro_rules! key {
    ($($seg:expr),+ $(,)?) => {
        $crate::cache::QueryKey::new(vec![$(::core::convert::Into::into($seg)),+])
    };
}

fn canonical_segments(segments: &[Value]) -> String {
    let mut out = String::from("[");
    for (i, seg) in segments.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_canonical(seg, &mut out);
    }
    out.push(']');
    out
}

fn canonical_value(v: &Value) -> String {
    let mut out = String::new();
    write_canonical(v, &mut out);
    out
}

/// Serialize with object keys sorted recursively, so equality does not
/// depend on insertion order.
fn write_canonical(v: &Value, out: &mut String) {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*k).clone()).to_string());
                out.push(':');
                write_canonical(&map[*k], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
