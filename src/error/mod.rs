//! Error types for the iteration engine.
//!
//! Two families of failure exist. Configuration errors (`EngineError`) are raised
//! synchronously while a stage is being prepared and abort it entirely. Failures of
//! a single unit of work are never errors at this level: they are recorded as failed
//! [`IterationOutcome`](crate::outcome::IterationOutcome)s and handed to the stage's
//! error strategy. The `classification` submodule maps engine errors onto stable
//! codes, categories and recovery hints for callers that surface them.

pub mod classification;

use std::fmt;

use thiserror::Error;

use crate::settings::SettingsError;

// Re-export main types for convenient access
pub use classification::{ClassifiedError, ErrorCategory, RecoveryHint};

/// A single offending field found while validating an iteration configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Configuration key as written in the stage definition (e.g. `maxIterations`)
    pub field: String,
    /// What is wrong with it
    pub message: String,
}

impl FieldError {
    /// Create a new field error.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every violation found in one validation pass, reported together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    errors: Vec<FieldError>,
}

impl ValidationErrors {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a violation.
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError::new(field, message));
    }

    /// Returns true if no violation was recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of recorded violations.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// The recorded violations, in discovery order.
    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    /// Names of the offending fields.
    pub fn fields(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.field.as_str()).collect()
    }

    /// Returns true if `field` was reported.
    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }

    /// Converts the collection into `Ok(())` when empty, or a validation error.
    pub fn into_result(self) -> Result<(), EngineError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// Errors raised by the iteration engine itself.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The iteration configuration failed validation.
    #[error("invalid iteration configuration: {0}")]
    Validation(ValidationErrors),

    /// A data-driven source path did not resolve to any value.
    #[error("iteration source '{path}' did not resolve to a value")]
    SourceNotFound { path: String },

    /// A count expression could not be turned into a non-negative integer.
    #[error("invalid count expression '{expression}': {reason}")]
    InvalidCount { expression: String, reason: String },

    /// `next_claim` was called after the cursor ran out of items.
    #[error("iteration cursor exhausted after {claimed} claims")]
    CursorExhausted { claimed: usize },

    /// The stage-level approval gate rejected the stage.
    #[error("stage '{stage}' was rejected: {reason}")]
    ApprovalRejected { stage: String, reason: String },

    /// The stage-level approval gate did not answer in time.
    #[error("approval for stage '{stage}' timed out")]
    ApprovalTimedOut { stage: String },

    /// A worker panicked or was aborted, in either execution mode.
    #[error("iteration worker failed: {0}")]
    Worker(String),

    /// Engine settings could not be loaded.
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

impl EngineError {
    /// Returns true for errors raised while building a stage's specification or cursor.
    ///
    /// These abort stage startup and are never retried.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::SourceNotFound { .. }
                | EngineError::InvalidCount { .. }
        )
    }

    /// Returns true if this is the cursor exhaustion signal.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, EngineError::CursorExhausted { .. })
    }

    /// The offending configuration field, when one can be named.
    pub fn field(&self) -> Option<&str> {
        match self {
            EngineError::Validation(errors) => errors.errors().first().map(|e| e.field.as_str()),
            EngineError::SourceNotFound { .. } => Some("source"),
            EngineError::InvalidCount { .. } => Some("count"),
            _ => None,
        }
    }
}

/// Failure reported by an external task orchestrator for one unit of work.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The unit of work ran and failed.
    #[error("{0}")]
    Failed(String),

    /// The collaborator refused to run the unit of work.
    #[error("task rejected: {0}")]
    Rejected(String),
}

impl TaskError {
    /// Shorthand for a [`TaskError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_display_lists_fields() {
        let mut errors = ValidationErrors::new();
        errors.push("source", "must not be blank");
        errors.push("variable", "must not be blank");

        let err = errors.into_result().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid iteration configuration: source: must not be blank; variable: must not be blank"
        );
        assert_eq!(err.field(), Some("source"));
    }

    #[test]
    fn test_empty_validation_errors_is_ok() {
        assert!(ValidationErrors::new().into_result().is_ok());
    }

    #[test]
    fn test_configuration_error_classes() {
        let source = EngineError::SourceNotFound {
            path: "items".to_string(),
        };
        let count = EngineError::InvalidCount {
            expression: "${n}".to_string(),
            reason: "not numeric".to_string(),
        };
        let exhausted = EngineError::CursorExhausted { claimed: 3 };

        assert!(source.is_configuration_error());
        assert!(count.is_configuration_error());
        assert!(!exhausted.is_configuration_error());
        assert!(exhausted.is_exhausted());
        assert_eq!(count.field(), Some("count"));
    }

    #[test]
    fn test_task_error_display() {
        assert_eq!(TaskError::failed("boom").to_string(), "boom");
        assert_eq!(
            TaskError::Rejected("busy".to_string()).to_string(),
            "task rejected: busy"
        );
    }
}
