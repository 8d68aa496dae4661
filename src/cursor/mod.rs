//! Thread-safe claiming over an iteration's items.
//!
//! An [`IterationCursor`] is built once per stage run from a validated
//! [`IterationSpec`] and a workflow context. Consumers call
//! [`IterationCursor::try_next`], which atomically reserves the next index and
//! returns the matching item together with the context that iteration runs in.
//! Every index in `[0, total)` is handed out at most once no matter how many
//! workers share the cursor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde_json::{Map, Value};
use tracing::debug;

use crate::context::WorkflowContext;
use crate::error::EngineError;
use crate::expression::ExpressionResolver;
use crate::spec::{CountExpr, IterationKind, IterationSpec};

/// One reserved unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    /// Zero-based claim index
    pub index: usize,
    /// The item bound to the iteration variable
    pub item: Value,
    /// Base context, overlaid with the cursor's variables and `{variable: item}`
    pub context: WorkflowContext,
}

#[derive(Debug)]
enum Items {
    List(Vec<Value>),
    Range { start: i64, count: usize },
    Conditional { condition: String, max_iterations: usize },
}

/// Atomic claim-and-fetch cursor over a stage's iteration items.
#[derive(Debug)]
pub struct IterationCursor {
    items: Items,
    variable: String,
    base: WorkflowContext,
    claimed: AtomicUsize,
    overlay: Mutex<Map<String, Value>>,
    resolver: ExpressionResolver,
}

impl IterationCursor {
    /// Materialize the items of `spec` against `context`.
    ///
    /// Data-driven sources that resolve to nothing fail with
    /// [`EngineError::SourceNotFound`]; count expressions that do not produce a
    /// non-negative integer fail with [`EngineError::InvalidCount`].
    pub fn new(spec: &IterationSpec, context: WorkflowContext) -> Result<Self, EngineError> {
        let resolver = ExpressionResolver::new();

        let items = match spec.kind() {
            IterationKind::DataDriven { source } => {
                match resolver.resolve_source(source, &context, None) {
                    None | Some(Value::Null) => {
                        return Err(EngineError::SourceNotFound {
                            path: source.clone(),
                        })
                    }
                    Some(Value::Array(list)) => Items::List(list),
                    Some(single) => Items::List(vec![single]),
                }
            }
            IterationKind::CountBased { count, start } => {
                let total = match count {
                    CountExpr::Literal(n) => *n,
                    CountExpr::Expression(expr) => resolver.resolve_count(expr, &context, None)?,
                };
                let count = usize::try_from(total).map_err(|_| EngineError::InvalidCount {
                    expression: total.to_string(),
                    reason: "count exceeds the addressable range".to_string(),
                })?;
                Items::Range {
                    start: *start,
                    count,
                }
            }
            IterationKind::Conditional {
                condition,
                max_iterations,
                ..
            } => Items::Conditional {
                condition: condition.clone(),
                max_iterations: *max_iterations as usize,
            },
        };

        let cursor = Self {
            items,
            variable: spec.variable().to_string(),
            base: context,
            claimed: AtomicUsize::new(0),
            overlay: Mutex::new(Map::new()),
            resolver,
        };
        debug!(
            kind = %spec.iteration_type(),
            variable = %cursor.variable,
            total = cursor.total(),
            "Iteration cursor created"
        );
        Ok(cursor)
    }

    fn lock_overlay(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.overlay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of items for data and count kinds; `0` for conditional cursors.
    pub fn total(&self) -> usize {
        match &self.items {
            Items::List(list) => list.len(),
            Items::Range { count, .. } => *count,
            Items::Conditional { .. } => 0,
        }
    }

    /// Returns true when the number of items is not known up front.
    pub fn is_unbounded(&self) -> bool {
        matches!(self.items, Items::Conditional { .. })
    }

    /// Number of claims handed out so far.
    pub fn claimed(&self) -> usize {
        self.claimed.load(Ordering::SeqCst)
    }

    /// Name the item is bound to in each claim's context.
    pub fn variable_name(&self) -> &str {
        &self.variable
    }

    /// The context the cursor was built against, without any overlay.
    pub fn base_context(&self) -> &WorkflowContext {
        &self.base
    }

    /// Snapshot of the variable overlay.
    pub fn variables(&self) -> Map<String, Value> {
        self.lock_overlay().clone()
    }

    /// Atomically claim the next item.
    ///
    /// Returns `None` once the items are exhausted, the condition no longer holds,
    /// or a conditional cursor reached its iteration ceiling.
    pub fn try_next(&self) -> Option<Claim> {
        let (index, item, overlay) = match &self.items {
            Items::List(list) => {
                let index = self.reserve(list.len())?;
                (index, list[index].clone(), self.variables())
            }
            Items::Range { start, count } => {
                let index = self.reserve(*count)?;
                let offset = i64::try_from(index).unwrap_or(i64::MAX);
                (index, Value::from(start.saturating_add(offset)), self.variables())
            }
            Items::Conditional {
                condition,
                max_iterations,
            } => {
                // The overlay lock serializes the check against concurrent updates.
                let overlay = self.lock_overlay();
                let index = self.claimed.load(Ordering::SeqCst);
                if index >= *max_iterations {
                    debug!(max_iterations, "Conditional iteration ceiling reached");
                    return None;
                }
                if !self.condition_holds(condition, &overlay, index) {
                    debug!(index, condition = %condition, "Iteration condition no longer holds");
                    return None;
                }
                self.claimed.fetch_add(1, Ordering::SeqCst);
                (index, Value::from(index as u64), overlay.clone())
            }
        };

        debug!(index, variable = %self.variable, "Claimed iteration");
        let context = self
            .base
            .with_overlay(&overlay)
            .with_variable(self.variable.clone(), item.clone());
        Some(Claim {
            index,
            item,
            context,
        })
    }

    /// Evaluate a loop condition in the context iteration `index` would run in.
    fn condition_holds(
        &self,
        condition: &str,
        overlay: &Map<String, Value>,
        index: usize,
    ) -> bool {
        let mut scope = overlay.clone();
        scope.insert(self.variable.clone(), Value::from(index as u64));
        self.resolver
            .evaluate_condition(condition, &self.base, Some(&scope))
    }

    fn reserve(&self, total: usize) -> Option<usize> {
        self.claimed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < total).then_some(current + 1)
            })
            .ok()
    }

    /// Claim the next item, failing with [`EngineError::CursorExhausted`] when none is left.
    pub fn next_claim(&self) -> Result<Claim, EngineError> {
        self.try_next().ok_or_else(|| EngineError::CursorExhausted {
            claimed: self.claimed(),
        })
    }

    /// Whether another claim would currently succeed.
    ///
    /// Advisory only: another consumer may claim in between. Use [`try_next`](Self::try_next)
    /// to claim.
    pub fn has_next(&self) -> bool {
        match &self.items {
            Items::List(list) => self.claimed() < list.len(),
            Items::Range { count, .. } => self.claimed() < *count,
            Items::Conditional {
                condition,
                max_iterations,
            } => {
                let overlay = self.lock_overlay();
                let index = self.claimed();
                index < *max_iterations && self.condition_holds(condition, &overlay, index)
            }
        }
    }

    /// Iterate over the remaining claims.
    pub fn claims(&self) -> Claims<'_> {
        Claims { cursor: self }
    }

    /// Merge `updates` into the variable overlay used by later claims.
    pub fn update_variables(&self, updates: Option<&Map<String, Value>>) {
        let Some(updates) = updates.filter(|u| !u.is_empty()) else {
            return;
        };
        let mut overlay = self.lock_overlay();
        for (key, value) in updates {
            overlay.insert(key.clone(), value.clone());
        }
        debug!(keys = updates.len(), "Iteration variables updated");
    }

    /// Rewind to the first item and clear the variable overlay.
    pub fn reset(&self) {
        let mut overlay = self.lock_overlay();
        overlay.clear();
        self.claimed.store(0, Ordering::SeqCst);
    }
}

/// Iterator over a cursor's remaining claims, see [`IterationCursor::claims`].
#[derive(Debug)]
pub struct Claims<'a> {
    cursor: &'a IterationCursor,
}

impl Iterator for Claims<'_> {
    type Item = Claim;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.try_next()
    }
}
