//! JSON-path-like selection for `$.`-prefixed iteration sources.
//!
//! Only the subset iteration sources need is supported: dotted field navigation
//! (`$.data.users`), list indexing (`$.pages[0]`) and list projection
//! (`$.orders[*].lines`). A path containing `[*]` always yields a list, possibly
//! empty; any other path yields a single value or nothing.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selector {
    Index(usize),
    Wildcard,
}

#[derive(Debug)]
struct Segment<'p> {
    key: &'p str,
    selectors: Vec<Selector>,
}

fn parse_segment(raw: &str) -> Option<Segment<'_>> {
    let (key, mut rest) = match raw.find('[') {
        Some(pos) => (&raw[..pos], &raw[pos..]),
        None => (raw, ""),
    };
    let mut selectors = Vec::new();
    while !rest.is_empty() {
        let close = rest.find(']')?;
        if !rest.starts_with('[') {
            return None;
        }
        let inner = rest[1..close].trim();
        let selector = if inner == "*" {
            Selector::Wildcard
        } else {
            Selector::Index(inner.parse().ok()?)
        };
        selectors.push(selector);
        rest = &rest[close + 1..];
    }
    Some(Segment {
        key: key.trim(),
        selectors,
    })
}

/// Select from a tree whose top level is reached through `first`.
///
/// `path` is the part after `$.`. Returns `None` when the path is malformed or a
/// non-projected step finds nothing.
pub(crate) fn select<'a, F>(first: F, path: &str) -> Option<Value>
where
    F: Fn(&str) -> Option<&'a Value>,
{
    if path.trim().is_empty() {
        return None;
    }
    let segments = path
        .split('.')
        .map(parse_segment)
        .collect::<Option<Vec<_>>>()?;

    let mut current: Vec<&'a Value> = Vec::new();
    let mut projected = false;

    for (position, segment) in segments.iter().enumerate() {
        if position == 0 {
            if segment.key.is_empty() {
                return None;
            }
            current.push(first(segment.key)?);
        } else if !segment.key.is_empty() {
            current = current
                .into_iter()
                .filter_map(|value| value.as_object().and_then(|map| map.get(segment.key)))
                .collect();
        }
        if !projected && current.is_empty() {
            return None;
        }

        for selector in &segment.selectors {
            current = match selector {
                Selector::Index(index) => current
                    .into_iter()
                    .filter_map(|value| value.as_array().and_then(|list| list.get(*index)))
                    .collect(),
                Selector::Wildcard => {
                    projected = true;
                    current
                        .into_iter()
                        .flat_map(|value| match value.as_array() {
                            Some(list) => list.iter().collect::<Vec<_>>(),
                            None => Vec::new(),
                        })
                        .collect()
                }
            };
            if !projected && current.is_empty() {
                return None;
            }
        }
    }

    if projected {
        Some(Value::Array(current.into_iter().cloned().collect()))
    } else {
        current.into_iter().next().cloned()
    }
}
