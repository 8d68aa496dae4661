//! Immutable workflow context with path-based reads.
//!
//! A [`WorkflowContext`] wraps a tree of string-keyed maps, lists and scalars. The
//! root map is shared and never mutated. Iteration-scoped contexts are derived by
//! layering a small overlay map over the root: overlay keys shadow root keys at the
//! first path segment, and the root stays untouched.

use std::sync::Arc;

use serde_json::{Map, Value};

/// Immutable nested data exposed to stage iterations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowContext {
    root: Arc<Map<String, Value>>,
    overlay: Arc<Map<String, Value>>,
}

impl WorkflowContext {
    /// Create a context from a map of workflow variables.
    pub fn new(variables: Map<String, Value>) -> Self {
        Self {
            root: Arc::new(variables),
            overlay: Arc::new(Map::new()),
        }
    }

    /// Create a context from an arbitrary JSON value.
    ///
    /// Non-object values produce an empty context.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::new(map),
            _ => Self::default(),
        }
    }

    /// Derive a context with one additional top-level key.
    pub fn with_variable(&self, name: impl Into<String>, value: Value) -> Self {
        let mut overlay = (*self.overlay).clone();
        overlay.insert(name.into(), value);
        Self {
            root: Arc::clone(&self.root),
            overlay: Arc::new(overlay),
        }
    }

    /// Derive a context with every key of `variables` layered on top.
    pub fn with_overlay(&self, variables: &Map<String, Value>) -> Self {
        if variables.is_empty() {
            return self.clone();
        }
        let mut overlay = (*self.overlay).clone();
        for (key, value) in variables {
            overlay.insert(key.clone(), value.clone());
        }
        Self {
            root: Arc::clone(&self.root),
            overlay: Arc::new(overlay),
        }
    }

    /// The underlying root map, without any overlay.
    pub fn root(&self) -> &Map<String, Value> {
        &self.root
    }

    /// Returns true if neither the root nor the overlay holds any key.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty() && self.overlay.is_empty()
    }

    /// Look up a top-level key, overlay first.
    pub fn lookup(&self, key: &str) -> Option<&Value> {
        self.overlay.get(key).or_else(|| self.root.get(key))
    }

    /// Resolve a dotted path such as `a.b.c`.
    ///
    /// Returns `None` for an empty or blank path, a missing segment, an
    /// intermediate value that is not a map, or a `null` leaf. Lists are never
    /// navigated.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let first = path.split('.').next()?;
        if self.overlay.contains_key(first) {
            lookup_path(&self.overlay, path)
        } else {
            lookup_path(&self.root, path)
        }
    }

    /// Returns true if `path` resolves to a non-null value.
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Read a scalar as a string.
    ///
    /// Strings are returned as-is, numbers and booleans by their display form.
    pub fn get_string(&self, path: &str) -> Option<String> {
        match self.get(path)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Read a string, falling back to `default`.
    pub fn get_string_or(&self, path: &str, default: &str) -> String {
        self.get_string(path).unwrap_or_else(|| default.to_string())
    }

    /// Read an integer.
    ///
    /// Floats truncate toward zero. Strings are accepted only when they parse as an
    /// integer exactly (no surrounding whitespace, no fraction).
    pub fn get_integer(&self, path: &str) -> Option<i64> {
        self.get(path).and_then(value_as_integer)
    }

    /// Read an integer, falling back to `default`.
    pub fn get_integer_or(&self, path: &str, default: i64) -> i64 {
        self.get_integer(path).unwrap_or(default)
    }

    /// Read a boolean.
    ///
    /// Strings follow `parseBoolean` rules: `"true"` in any case is `true` and every
    /// other string (including `"yes"`) is `false`.
    pub fn get_boolean(&self, path: &str) -> Option<bool> {
        match self.get(path)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => Some(parse_boolean(s)),
            _ => None,
        }
    }

    /// Read a boolean, falling back to `default`.
    pub fn get_boolean_or(&self, path: &str, default: bool) -> bool {
        self.get_boolean(path).unwrap_or(default)
    }

    /// Materialize the merged view (root with overlay applied) as one map.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut merged = (*self.root).clone();
        for (key, value) in self.overlay.iter() {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Materialize the merged view as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.to_map())
    }
}

impl From<Map<String, Value>> for WorkflowContext {
    fn from(variables: Map<String, Value>) -> Self {
        Self::new(variables)
    }
}

/// Walk a dotted path through nested maps, starting at `map`.
///
/// A `null` leaf reads as absent.
pub(crate) fn lookup_path<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if path.trim().is_empty() {
        return None;
    }
    let mut segments = path.split('.');
    let mut current = map.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(inner) => inner.get(segment)?,
            _ => return None,
        };
    }
    (!current.is_null()).then_some(current)
}

/// `parseBoolean` semantics: only a case-insensitive `"true"` is true.
pub fn parse_boolean(text: &str) -> bool {
    text.eq_ignore_ascii_case("true")
}

/// Convert a JSON value to an integer using the accessor's narrow rules.
pub(crate) fn value_as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i)
            } else if let Some(u) = n.as_u64() {
                i64::try_from(u).ok()
            } else {
                let f = n.as_f64()?.trunc();
                if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                    Some(f as i64)
                } else {
                    None
                }
            }
        }
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }
}
