//! Boolean conditions and update expressions for conditional loops.
//!
//! Conditions are small boolean expressions such as
//! `${remaining} > 0 && status != 'done'`. Supported forms:
//!
//! - `||` and `&&` (no precedence beyond `&&` binding tighter than `||`)
//! - unary `!` and parenthesised groups
//! - comparisons `==`, `!=`, `>=`, `<=`, `>`, `<`
//! - operands: `${path}` tokens, bare dotted paths, quoted strings, numbers,
//!   `true`/`false`/`null`
//!
//! Update expressions produce a value instead of a boolean and accept a chain of
//! whitespace-separated `+ - * /` operators, evaluated left to right.

use serde_json::{Map, Number, Value};
use tracing::warn;

use super::{render, ExpressionResolver};
use crate::context::{parse_boolean, WorkflowContext};

const COMPARISON_OPERATORS: [&str; 6] = ["==", "!=", ">=", "<=", ">", "<"];
const ARITHMETIC_OPERATORS: [&str; 4] = [" + ", " - ", " * ", " / "];

/// Lexical scanner state shared by the splitters below.
#[derive(Default)]
struct Scan {
    depth: usize,
    token_depth: usize,
    quote: Option<char>,
}

impl Scan {
    /// Advance over `c`, with `next` as one character of lookahead.
    fn step(&mut self, c: char, next: Option<char>) {
        match self.quote {
            Some(q) if c == q => self.quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' if self.token_depth == 0 => self.quote = Some(c),
                '$' if next == Some('{') => self.token_depth += 1,
                '}' if self.token_depth > 0 => self.token_depth -= 1,
                '(' if self.token_depth == 0 => self.depth += 1,
                ')' if self.token_depth == 0 && self.depth > 0 => self.depth -= 1,
                _ => {}
            },
        }
    }

    fn at_top_level(&self) -> bool {
        self.depth == 0 && self.token_depth == 0 && self.quote.is_none()
    }
}

/// Split `expr` on every top-level occurrence of `separator`.
fn split_top_level<'e>(expr: &'e str, separator: &str) -> Vec<&'e str> {
    let mut parts = Vec::new();
    let mut scan = Scan::default();
    let mut start = 0;
    let chars: Vec<(usize, char)> = expr.char_indices().collect();
    let mut i = 0;
    while i < chars.len() {
        let (pos, c) = chars[i];
        if scan.at_top_level() && expr[pos..].starts_with(separator) {
            parts.push(&expr[start..pos]);
            start = pos + separator.len();
            i += separator.chars().count();
            continue;
        }
        scan.step(c, chars.get(i + 1).map(|(_, n)| *n));
        i += 1;
    }
    parts.push(&expr[start..]);
    parts
}

/// Find the first top-level comparison operator, returning its byte offset and text.
fn find_comparison(expr: &str) -> Option<(usize, &'static str)> {
    let mut scan = Scan::default();
    let chars: Vec<(usize, char)> = expr.char_indices().collect();
    for (i, &(pos, c)) in chars.iter().enumerate() {
        if scan.at_top_level() {
            if let Some(op) = COMPARISON_OPERATORS
                .iter()
                .find(|op| expr[pos..].starts_with(**op))
            {
                return Some((pos, *op));
            }
        }
        scan.step(c, chars.get(i + 1).map(|(_, n)| *n));
    }
    None
}

/// Find the last top-level arithmetic operator.
fn find_last_arithmetic(expr: &str) -> Option<(usize, &'static str)> {
    let mut scan = Scan::default();
    let chars: Vec<(usize, char)> = expr.char_indices().collect();
    let mut found = None;
    for (i, &(pos, c)) in chars.iter().enumerate() {
        if scan.at_top_level() {
            if let Some(op) = ARITHMETIC_OPERATORS
                .iter()
                .find(|op| expr[pos..].starts_with(**op))
            {
                found = Some((pos, *op));
            }
        }
        scan.step(c, chars.get(i + 1).map(|(_, n)| *n));
    }
    found
}

/// Returns true if `expr` is wrapped in one pair of matching parentheses.
fn is_wrapped(expr: &str) -> bool {
    if !(expr.starts_with('(') && expr.ends_with(')')) {
        return false;
    }
    let mut scan = Scan::default();
    let chars: Vec<(usize, char)> = expr.char_indices().collect();
    for (i, &(pos, c)) in chars.iter().enumerate() {
        scan.step(c, chars.get(i + 1).map(|(_, n)| *n));
        if scan.depth == 0 && pos + c.len_utf8() < expr.len() {
            return false;
        }
    }
    true
}

fn unquote(raw: &str) -> Option<&str> {
    let bytes = raw.as_bytes();
    if raw.len() >= 2 {
        let (first, last) = (bytes[0], bytes[raw.len() - 1]);
        if (first == b'\'' || first == b'"') && first == last {
            return Some(&raw[1..raw.len() - 1]);
        }
    }
    None
}

fn is_path_like(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
        && raw
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
}

fn literal(raw: &str) -> Option<Value> {
    match raw {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Some(Value::from(i));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_exact_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => parse_boolean(s.trim()),
        _ => false,
    }
}

/// A resolved condition or update operand.
enum Operand {
    Value(Value),
    /// `${...}` token with no value and no default
    Missing(String),
    /// Bare word that names no context path
    Text(String),
}

impl Operand {
    fn is_numeric(&self) -> bool {
        matches!(self, Operand::Value(value) if as_number(value).is_some())
    }

    fn into_value(self) -> Value {
        match self {
            Operand::Value(value) => value,
            Operand::Missing(text) | Operand::Text(text) => Value::String(text),
        }
    }
}

/// Text of the operand that makes a comparison meaningless, if any.
///
/// Missing tokens never compare. Bare words do not compare against numbers.
fn unresolved<'o>(left: &'o Operand, right: &'o Operand) -> Option<&'o str> {
    match (left, right) {
        (Operand::Missing(text), _) | (_, Operand::Missing(text)) => Some(text.as_str()),
        (Operand::Text(text), other) | (other, Operand::Text(text)) if other.is_numeric() => {
            Some(text.as_str())
        }
        _ => None,
    }
}

fn compare(left: &Value, op: &str, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return match op {
            "==" => l == r,
            "!=" => l != r,
            ">=" => l >= r,
            "<=" => l <= r,
            ">" => l > r,
            "<" => l < r,
            _ => false,
        };
    }
    let (l, r) = (render(left), render(right));
    match op {
        "==" => l == r,
        "!=" => l != r,
        ">=" => l >= r,
        "<=" => l <= r,
        ">" => l > r,
        "<" => l < r,
        _ => false,
    }
}

fn arithmetic(left: &Value, op: &str, right: &Value) -> Option<Value> {
    if let (Some(l), Some(r)) = (as_exact_integer(left), as_exact_integer(right)) {
        let exact = match op.trim() {
            "+" => l.checked_add(r),
            "-" => l.checked_sub(r),
            "*" => l.checked_mul(r),
            "/" if l.checked_rem(r) == Some(0) => l.checked_div(r),
            _ => None,
        };
        if let Some(result) = exact {
            return Some(Value::from(result));
        }
    }
    let (l, r) = (as_number(left)?, as_number(right)?);
    let result = match op.trim() {
        "+" => l + r,
        "-" => l - r,
        "*" => l * r,
        "/" if r != 0.0 => l / r,
        _ => return None,
    };
    Number::from_f64(result).map(Value::Number)
}

impl ExpressionResolver {
    /// Evaluate a boolean condition.
    ///
    /// Never fails: a blank or malformed condition evaluates to `false` and is
    /// logged.
    pub fn evaluate_condition(
        &self,
        expr: &str,
        context: &WorkflowContext,
        overlay: Option<&Map<String, Value>>,
    ) -> bool {
        let expr = expr.trim();
        if expr.is_empty() {
            warn!("empty condition evaluates to false");
            return false;
        }
        self.evaluate_or(expr, context, overlay)
    }

    fn evaluate_or(
        &self,
        expr: &str,
        context: &WorkflowContext,
        overlay: Option<&Map<String, Value>>,
    ) -> bool {
        split_top_level(expr, "||")
            .into_iter()
            .any(|part| self.evaluate_and(part, context, overlay))
    }

    fn evaluate_and(
        &self,
        expr: &str,
        context: &WorkflowContext,
        overlay: Option<&Map<String, Value>>,
    ) -> bool {
        split_top_level(expr, "&&")
            .into_iter()
            .all(|part| self.evaluate_term(part, context, overlay))
    }

    fn evaluate_term(
        &self,
        term: &str,
        context: &WorkflowContext,
        overlay: Option<&Map<String, Value>>,
    ) -> bool {
        let term = term.trim();
        if term.is_empty() {
            warn!("malformed condition: empty operand");
            return false;
        }
        if let Some(rest) = term.strip_prefix('!') {
            if !rest.starts_with('=') {
                return !self.evaluate_term(rest, context, overlay);
            }
        }
        if is_wrapped(term) {
            return self.evaluate_or(&term[1..term.len() - 1], context, overlay);
        }
        match find_comparison(term) {
            Some((pos, op)) => {
                let left = self.resolve_operand(&term[..pos], context, overlay);
                let right = self.resolve_operand(&term[pos + op.len()..], context, overlay);
                if let Some(operand) = unresolved(&left, &right) {
                    warn!(condition = %term, operand = %operand, "unresolved operand in comparison");
                    return false;
                }
                compare(&left.into_value(), op, &right.into_value())
            }
            None => truthy(&self.operand(term, context, overlay)),
        }
    }

    /// Evaluate an update expression to a value.
    ///
    /// `${remaining} - 1` yields an integer; a lone operand yields its resolved
    /// value; text that is neither yields itself as a string.
    pub fn evaluate_value(
        &self,
        expr: &str,
        context: &WorkflowContext,
        overlay: Option<&Map<String, Value>>,
    ) -> Value {
        let expr = expr.trim();
        if let Some((pos, op)) = find_last_arithmetic(expr) {
            let left = self.evaluate_value(&expr[..pos], context, overlay);
            let right = self.operand(&expr[pos + op.len()..], context, overlay);
            if let Some(result) = arithmetic(&left, op, &right) {
                return result;
            }
            if op == " + " && (left.is_string() || right.is_string()) {
                return Value::String(format!("{}{}", render(&left), render(&right)));
            }
            warn!(expression = %expr, "non-numeric operands in update expression");
            return Value::String(self.substitute(expr, context, overlay));
        }
        self.operand(expr, context, overlay)
    }

    /// Resolve one operand to a value, keeping unresolved text as a string.
    fn operand(
        &self,
        raw: &str,
        context: &WorkflowContext,
        overlay: Option<&Map<String, Value>>,
    ) -> Value {
        self.resolve_operand(raw, context, overlay).into_value()
    }

    fn resolve_operand(
        &self,
        raw: &str,
        context: &WorkflowContext,
        overlay: Option<&Map<String, Value>>,
    ) -> Operand {
        let raw = raw.trim();
        if let Some(text) = unquote(raw) {
            return Operand::Value(Value::String(text.to_string()));
        }
        if let Some((name, default)) = super::whole_token(raw) {
            return match (self.lookup(name, context, overlay), default) {
                (Some(value), _) => Operand::Value(value),
                (None, Some(default)) => Operand::Value(
                    literal(default).unwrap_or_else(|| Value::String(default.to_string())),
                ),
                (None, None) => Operand::Missing(raw.to_string()),
            };
        }
        if raw.contains("${") {
            return Operand::Value(Value::String(self.substitute(raw, context, overlay)));
        }
        if let Some(value) = literal(raw) {
            return Operand::Value(value);
        }
        if is_path_like(raw) {
            if let Some(value) = self.lookup_path(raw, context, overlay) {
                return Operand::Value(value.clone());
            }
        }
        Operand::Text(raw.to_string())
    }
}
