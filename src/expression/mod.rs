//! Expression resolution against a workflow context.
//!
//! The resolver understands three kinds of input:
//!
//! - templates containing `${name}` or `${name:-default}` tokens ([`ExpressionResolver::substitute`])
//! - iteration sources: plain dotted paths, `$.`-prefixed JSON-path-like paths, or a
//!   single `${path}` token ([`ExpressionResolver::resolve_source`])
//! - count expressions: a literal non-negative integer or a single `${path}` token
//!   ([`ExpressionResolver::resolve_count`])
//!
//! Every call takes the immutable context plus an optional per-call overlay map.
//! The resolver keeps no state between calls.

mod condition;
mod path;

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::context::{lookup_path, WorkflowContext};
use crate::error::EngineError;

/// Names resolved by the resolver itself when neither the overlay nor the
/// context define them.
pub const BUILTIN_VARIABLES: [&str; 3] = ["timestamp", "uuid", "user"];

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]*)\}").expect("Invalid regex pattern"))
}

fn whole_token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\$\{([^}]+)\}$").expect("Invalid regex pattern"))
}

/// Split the inside of a `${...}` token into its name and optional default.
fn split_token(inner: &str) -> (&str, Option<&str>) {
    match inner.find(":-") {
        Some(pos) => (inner[..pos].trim(), Some(&inner[pos + 2..])),
        None => (inner.trim(), None),
    }
}

/// If `text` is exactly one `${...}` token, return its name and default.
pub(crate) fn whole_token(text: &str) -> Option<(&str, Option<&str>)> {
    whole_token_pattern()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|inner| split_token(inner.as_str()))
}

/// Render a value as substitution text: strings raw, everything else as JSON.
pub(crate) fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Value of a built-in variable, computed fresh on every lookup.
fn builtin(name: &str) -> Option<Value> {
    match name {
        "timestamp" => Some(Value::String(chrono::Utc::now().to_rfc3339())),
        "uuid" => Some(Value::String(uuid::Uuid::new_v4().to_string())),
        "user" => std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .ok()
            .map(Value::String),
        _ => None,
    }
}

fn invalid_count(expression: &str, reason: impl Into<String>) -> EngineError {
    EngineError::InvalidCount {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

/// Coerce a resolved value into a count.
fn coerce_count(expression: &str, value: &Value) -> Result<u64, EngineError> {
    match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                return Ok(u);
            }
            if n.as_i64().is_some() {
                return Err(invalid_count(expression, "count must not be negative"));
            }
            match n.as_f64().map(f64::trunc) {
                Some(f) if f.is_finite() && f >= 0.0 && f <= u64::MAX as f64 => Ok(f as u64),
                Some(f) if f < 0.0 => Err(invalid_count(expression, "count must not be negative")),
                _ => Err(invalid_count(expression, "count is out of range")),
            }
        }
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(i) if i >= 0 => Ok(i as u64),
            Ok(_) => Err(invalid_count(expression, "count must not be negative")),
            Err(_) => Err(invalid_count(
                expression,
                format!("'{}' is not an integer", s),
            )),
        },
        other => Err(invalid_count(
            expression,
            format!("expected a number, found {}", type_name(other)),
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a map",
    }
}

/// Stateless resolver for templates, sources, counts and conditions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionResolver;

impl ExpressionResolver {
    /// Create a resolver.
    pub fn new() -> Self {
        Self
    }

    /// Replace every `${name}` / `${name:-default}` token in `text`.
    ///
    /// Lookup order is the overlay, then built-ins (`timestamp`, `uuid`, `user`),
    /// then the context. A token that resolves nowhere and has no default is left
    /// in the output unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use iterflow::context::WorkflowContext;
    /// use iterflow::expression::ExpressionResolver;
    ///
    /// let resolver = ExpressionResolver::new();
    /// let out = resolver.substitute("Value: ${missing:-fallback}", &WorkflowContext::default(), None);
    /// assert_eq!(out, "Value: fallback");
    /// ```
    pub fn substitute(
        &self,
        text: &str,
        context: &WorkflowContext,
        overlay: Option<&Map<String, Value>>,
    ) -> String {
        token_pattern()
            .replace_all(text, |caps: &Captures| {
                let (name, default) = split_token(&caps[1]);
                match self.lookup(name, context, overlay) {
                    Some(value) => render(&value),
                    None => default
                        .map(str::to_string)
                        .unwrap_or_else(|| caps[0].to_string()),
                }
            })
            .into_owned()
    }

    /// Resolve an iteration source to a value.
    ///
    /// - `$` selects the whole (merged) context
    /// - `$.a.b[*].c` uses JSON-path-like navigation with list index/projection
    /// - `${a.b}` resolves the inner path
    /// - anything else is a plain dotted path
    pub fn resolve_source(
        &self,
        source: &str,
        context: &WorkflowContext,
        overlay: Option<&Map<String, Value>>,
    ) -> Option<Value> {
        let source = source.trim();
        if source == "$" {
            let merged = match overlay {
                Some(extra) => context.with_overlay(extra),
                None => context.clone(),
            };
            return Some(merged.to_value());
        }
        if let Some(rest) = source.strip_prefix("$.") {
            return path::select(|key| first_segment(context, overlay, key), rest);
        }
        if let Some((name, _)) = whole_token(source) {
            return self.lookup(name, context, overlay);
        }
        self.lookup_path(source, context, overlay).cloned()
    }

    /// Resolve a count expression to a non-negative integer.
    ///
    /// Accepts a literal (`"5"`) or exactly one `${path}` token whose value is an
    /// integer, a float (truncated) or an integer string. Anything else is a
    /// configuration error.
    pub fn resolve_count(
        &self,
        expr: &str,
        context: &WorkflowContext,
        overlay: Option<&Map<String, Value>>,
    ) -> Result<u64, EngineError> {
        let trimmed = expr.trim();
        if let Ok(count) = trimmed.parse::<u64>() {
            return Ok(count);
        }
        if trimmed.parse::<i64>().is_ok() {
            return Err(invalid_count(expr, "count must not be negative"));
        }
        let (name, default) = whole_token(trimmed).ok_or_else(|| {
            invalid_count(expr, "expected a non-negative integer or a ${...} reference")
        })?;
        match self.lookup_path(name, context, overlay) {
            Some(value) => coerce_count(expr, value),
            None => match default {
                Some(default) => coerce_count(expr, &Value::String(default.to_string())),
                None => Err(invalid_count(
                    expr,
                    format!("'{}' did not resolve to a value", name),
                )),
            },
        }
    }

    /// Look up a name: overlay, then built-ins, then context.
    ///
    /// An overlay key shadows the rest at its first path segment. `null` values
    /// count as unresolved.
    pub(crate) fn lookup(
        &self,
        name: &str,
        context: &WorkflowContext,
        overlay: Option<&Map<String, Value>>,
    ) -> Option<Value> {
        let first = name.split('.').next().unwrap_or(name);
        if let Some(extra) = overlay.filter(|extra| extra.contains_key(first)) {
            return lookup_path(extra, name).cloned();
        }
        builtin(name).or_else(|| context.get(name).cloned())
    }

    /// Look up a dotted path in the overlay, then the context. No built-ins.
    pub(crate) fn lookup_path<'a>(
        &self,
        path: &str,
        context: &'a WorkflowContext,
        overlay: Option<&'a Map<String, Value>>,
    ) -> Option<&'a Value> {
        let first = path.split('.').next()?;
        match overlay {
            Some(extra) if extra.contains_key(first) => lookup_path(extra, path),
            _ => context.get(path),
        }
    }
}

fn first_segment<'a>(
    context: &'a WorkflowContext,
    overlay: Option<&'a Map<String, Value>>,
    key: &str,
) -> Option<&'a Value> {
    overlay
        .and_then(|extra| extra.get(key))
        .or_else(|| context.lookup(key))
}
