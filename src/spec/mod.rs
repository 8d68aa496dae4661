//! Iteration specifications.
//!
//! [`IterationConfig`] is the raw, deserializable form of a stage's `iteration`
//! block. [`IterationConfig::validate`] checks every rule at once and produces an
//! immutable [`IterationSpec`] whose [`IterationKind`] carries only the fields its
//! kind needs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, ValidationErrors};

/// Default worker pool ceiling for parallel stages.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;
/// Default number of extra attempts under the `retry` strategy.
pub const DEFAULT_RETRY_COUNT: u32 = 3;
/// Default per-iteration timeout in milliseconds.
pub const DEFAULT_ITERATION_TIMEOUT_MS: u64 = 300_000;
/// Smallest accepted per-iteration timeout in milliseconds.
pub const MIN_ITERATION_TIMEOUT_MS: u64 = 1_000;

fn normalize_name(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace('-', "_")
}

/// Which of the three iteration semantics a stage uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum IterationType {
    /// Iterate over the elements of a resolved collection
    DataDriven,
    /// Iterate over an integer range
    CountBased,
    /// Iterate while a condition holds, up to a ceiling
    Conditional,
}

impl IterationType {
    /// Get a string representation of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            IterationType::DataDriven => "data_driven",
            IterationType::CountBased => "count_based",
            IterationType::Conditional => "conditional",
        }
    }
}

impl FromStr for IterationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_name(s).as_str() {
            "data_driven" => Ok(IterationType::DataDriven),
            "count_based" => Ok(IterationType::CountBased),
            "conditional" => Ok(IterationType::Conditional),
            _ => Err(format!(
                "unknown iteration type '{}' (expected data_driven, count_based or conditional)",
                s
            )),
        }
    }
}

impl TryFrom<String> for IterationType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for IterationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a stage reacts when one iteration fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum ErrorStrategy {
    /// Stop claiming new items after the first failure.
    #[default]
    FailFast,
    /// Keep claiming and collect every outcome.
    Continue,
    /// Re-execute a failed item up to `retry_count` more times, then keep claiming.
    Retry,
}

impl ErrorStrategy {
    /// Get a string representation of the strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorStrategy::FailFast => "fail_fast",
            ErrorStrategy::Continue => "continue",
            ErrorStrategy::Retry => "retry",
        }
    }

    /// Returns true if a failed outcome should stop further claims.
    pub fn stops_on_failure(&self) -> bool {
        matches!(self, ErrorStrategy::FailFast)
    }
}

impl FromStr for ErrorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_name(s).as_str() {
            "fail_fast" => Ok(ErrorStrategy::FailFast),
            "continue" => Ok(ErrorStrategy::Continue),
            "retry" => Ok(ErrorStrategy::Retry),
            _ => Err(format!(
                "unknown error strategy '{}' (expected fail_fast, continue or retry)",
                s
            )),
        }
    }
}

impl TryFrom<String> for ErrorStrategy {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ErrorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `count` as written in configuration: a number or an expression string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CountValue {
    Number(i64),
    Text(String),
}

impl From<u64> for CountValue {
    fn from(value: u64) -> Self {
        i64::try_from(value)
            .map(CountValue::Number)
            .unwrap_or_else(|_| CountValue::Text(value.to_string()))
    }
}

impl From<&str> for CountValue {
    fn from(value: &str) -> Self {
        CountValue::Text(value.to_string())
    }
}

impl From<String> for CountValue {
    fn from(value: String) -> Self {
        CountValue::Text(value)
    }
}

/// A validated count: known now, or resolved against the context at cursor build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountExpr {
    Literal(u64),
    Expression(String),
}

/// Kind-specific part of a validated specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationKind {
    DataDriven {
        source: String,
    },
    CountBased {
        count: CountExpr,
        start: i64,
    },
    Conditional {
        condition: String,
        max_iterations: u32,
        /// Variable name to update expression, applied after every iteration
        updates: BTreeMap<String, String>,
    },
}

impl IterationKind {
    /// The iteration type this kind belongs to.
    pub fn iteration_type(&self) -> IterationType {
        match self {
            IterationKind::DataDriven { .. } => IterationType::DataDriven,
            IterationKind::CountBased { .. } => IterationType::CountBased,
            IterationKind::Conditional { .. } => IterationType::Conditional,
        }
    }
}

/// Raw iteration block of a stage definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationConfig {
    #[serde(rename = "type", default)]
    pub kind: Option<IterationType>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub count: Option<CountValue>,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<i64>,
    #[serde(default)]
    pub updates: BTreeMap<String, String>,
    #[serde(default)]
    pub variable: Option<String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub max_concurrent: Option<i64>,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    #[serde(default)]
    pub retry_count: Option<i64>,
    /// Per-iteration timeout in milliseconds
    #[serde(default)]
    pub iteration_timeout: Option<i64>,
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or("").is_empty()
}

impl IterationConfig {
    /// A data-driven iteration over `source`, binding each element to `variable`.
    pub fn data_driven(source: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            kind: Some(IterationType::DataDriven),
            source: Some(source.into()),
            variable: Some(variable.into()),
            ..Self::default()
        }
    }

    /// A count-based iteration binding `start..start+count` to `variable`.
    pub fn count_based(count: impl Into<CountValue>, variable: impl Into<String>) -> Self {
        Self {
            kind: Some(IterationType::CountBased),
            count: Some(count.into()),
            variable: Some(variable.into()),
            ..Self::default()
        }
    }

    /// A conditional iteration running while `condition` holds, at most `max_iterations` times.
    pub fn conditional(
        condition: impl Into<String>,
        max_iterations: i64,
        variable: impl Into<String>,
    ) -> Self {
        Self {
            kind: Some(IterationType::Conditional),
            condition: Some(condition.into()),
            max_iterations: Some(max_iterations),
            variable: Some(variable.into()),
            ..Self::default()
        }
    }

    /// Set the first value of a count-based range.
    pub fn with_start(mut self, start: i64) -> Self {
        self.start = Some(start);
        self
    }

    /// Run iterations in parallel with at most `max_concurrent` workers.
    pub fn with_parallel(mut self, max_concurrent: i64) -> Self {
        self.parallel = true;
        self.max_concurrent = Some(max_concurrent);
        self
    }

    /// Set the error strategy.
    pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.error_strategy = strategy;
        self
    }

    /// Set the number of extra attempts under the `retry` strategy.
    pub fn with_retry_count(mut self, retry_count: i64) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    /// Set the per-iteration timeout in milliseconds.
    pub fn with_iteration_timeout(mut self, timeout_ms: i64) -> Self {
        self.iteration_timeout = Some(timeout_ms);
        self
    }

    /// Add a post-iteration update for a conditional loop.
    pub fn with_update(mut self, variable: impl Into<String>, expression: impl Into<String>) -> Self {
        self.updates.insert(variable.into(), expression.into());
        self
    }

    /// Check every rule and build the validated specification.
    ///
    /// All violations are reported together in one [`EngineError::Validation`].
    pub fn validate(&self) -> Result<IterationSpec, EngineError> {
        let mut errors = ValidationErrors::new();

        if is_blank(&self.variable) {
            errors.push("variable", "must not be blank");
        }

        let kind = match self.kind {
            None => {
                errors.push("type", "is required");
                None
            }
            Some(IterationType::DataDriven) => {
                if is_blank(&self.source) {
                    errors.push("source", "is required for data_driven iteration");
                    None
                } else {
                    Some(IterationKind::DataDriven {
                        source: self.source.clone().unwrap_or_default().trim().to_string(),
                    })
                }
            }
            Some(IterationType::CountBased) => {
                let count = match &self.count {
                    None => {
                        errors.push("count", "is required for count_based iteration");
                        None
                    }
                    Some(CountValue::Number(n)) if *n < 0 => {
                        errors.push("count", "must not be negative");
                        None
                    }
                    Some(CountValue::Number(n)) => Some(CountExpr::Literal(*n as u64)),
                    Some(CountValue::Text(text)) => {
                        let text = text.trim();
                        if text.is_empty() {
                            errors.push("count", "is required for count_based iteration");
                            None
                        } else if let Ok(n) = text.parse::<u64>() {
                            Some(CountExpr::Literal(n))
                        } else if text.parse::<i64>().is_ok() {
                            errors.push("count", "must not be negative");
                            None
                        } else {
                            Some(CountExpr::Expression(text.to_string()))
                        }
                    }
                };
                count.map(|count| IterationKind::CountBased {
                    count,
                    start: self.start.unwrap_or(0),
                })
            }
            Some(IterationType::Conditional) => {
                if is_blank(&self.condition) {
                    errors.push("condition", "is required for conditional iteration");
                }
                let max_iterations = match self.max_iterations {
                    None => {
                        errors.push("maxIterations", "is required for conditional iteration");
                        None
                    }
                    Some(n) if n < 1 => {
                        errors.push("maxIterations", "must be at least 1");
                        None
                    }
                    Some(n) => Some(u32::try_from(n).unwrap_or(u32::MAX)),
                };
                for (name, expression) in &self.updates {
                    if name.trim().is_empty() {
                        errors.push("updates", "variable names must not be blank");
                    } else if expression.trim().is_empty() {
                        errors.push("updates", format!("expression for '{}' is blank", name));
                    }
                }
                match (&self.condition, max_iterations) {
                    (Some(condition), Some(max_iterations)) if !condition.trim().is_empty() => {
                        Some(IterationKind::Conditional {
                            condition: condition.trim().to_string(),
                            max_iterations,
                            updates: self.updates.clone(),
                        })
                    }
                    _ => None,
                }
            }
        };

        let max_concurrent = self.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT as i64);
        if self.parallel && max_concurrent < 1 {
            errors.push("maxConcurrent", "must be at least 1 when parallel is enabled");
        }

        let retry_count = self.retry_count.unwrap_or(DEFAULT_RETRY_COUNT as i64);
        if retry_count < 0 {
            errors.push("retryCount", "must not be negative");
        }

        let timeout_ms = self
            .iteration_timeout
            .unwrap_or(DEFAULT_ITERATION_TIMEOUT_MS as i64);
        if timeout_ms < MIN_ITERATION_TIMEOUT_MS as i64 {
            errors.push(
                "iterationTimeout",
                format!("must be at least {} ms", MIN_ITERATION_TIMEOUT_MS),
            );
        }

        errors.into_result()?;

        // Every path that leaves `kind` empty has recorded an error above.
        let kind = kind.ok_or_else(|| {
            let mut errors = ValidationErrors::new();
            errors.push("type", "is required");
            EngineError::Validation(errors)
        })?;

        Ok(IterationSpec {
            kind,
            variable: self.variable.clone().unwrap_or_default().trim().to_string(),
            parallel: self.parallel,
            max_concurrent: usize::try_from(max_concurrent.max(1)).unwrap_or(usize::MAX),
            error_strategy: self.error_strategy,
            retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
            iteration_timeout: Duration::from_millis(timeout_ms as u64),
        })
    }
}

/// A validated, immutable iteration specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationSpec {
    kind: IterationKind,
    variable: String,
    parallel: bool,
    max_concurrent: usize,
    error_strategy: ErrorStrategy,
    retry_count: u32,
    iteration_timeout: Duration,
}

impl IterationSpec {
    /// Kind-specific fields.
    pub fn kind(&self) -> &IterationKind {
        &self.kind
    }

    /// The iteration type.
    pub fn iteration_type(&self) -> IterationType {
        self.kind.iteration_type()
    }

    /// Name the current item is bound to in each iteration's context.
    pub fn variable(&self) -> &str {
        &self.variable
    }

    /// Whether parallel execution was requested.
    pub fn parallel(&self) -> bool {
        self.parallel
    }

    /// Worker pool ceiling for parallel execution.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// The error strategy.
    pub fn error_strategy(&self) -> ErrorStrategy {
        self.error_strategy
    }

    /// Extra attempts under the `retry` strategy.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Upper bound on one unit of work.
    pub fn iteration_timeout(&self) -> Duration {
        self.iteration_timeout
    }

    /// Total attempts one claimed item may get.
    pub fn max_attempts(&self) -> u32 {
        match self.error_strategy {
            ErrorStrategy::Retry => self.retry_count.saturating_add(1),
            _ => 1,
        }
    }

    /// Returns true for conditional specifications.
    pub fn is_conditional(&self) -> bool {
        matches!(self.kind, IterationKind::Conditional { .. })
    }
}

impl TryFrom<IterationConfig> for IterationSpec {
    type Error = EngineError;

    fn try_from(config: IterationConfig) -> Result<Self, Self::Error> {
        config.validate()
    }
}

impl TryFrom<&IterationConfig> for IterationSpec {
    type Error = EngineError;

    fn try_from(config: &IterationConfig) -> Result<Self, Self::Error> {
        config.validate()
    }
}
