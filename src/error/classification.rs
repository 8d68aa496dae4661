//! Error classification for callers that surface engine errors
//!
//! Engine errors are mapped onto a stable code, a coarse category and a recovery
//! hint so that a workflow runner can decide whether to fix configuration, wait for
//! a human, or simply report the failure.

use std::collections::HashMap;
use std::time::Duration;

use super::EngineError;

/// The primary category of an engine error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The stage definition is wrong; fixing it is the only remedy.
    Configuration,
    /// A cursor was consumed past its end (programmer error).
    Exhaustion,
    /// A human approval gate refused or did not answer.
    Approval,
    /// Something failed while the stage was running.
    Runtime,
}

impl ErrorCategory {
    /// Get a string representation of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Exhaustion => "exhaustion",
            ErrorCategory::Approval => "approval",
            ErrorCategory::Runtime => "runtime",
        }
    }
}

/// Hints for how to recover from an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryHint {
    /// Correct the named configuration field and start the stage again.
    FixConfiguration(String),
    /// Retry after a specified duration.
    RetryAfter(Duration),
    /// Wait for user input or intervention before proceeding.
    WaitForUser,
    /// Stop execution entirely; error is unrecoverable.
    StopExecution,
}

/// A classified error with code, category, message, recovery hint, and additional context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassifiedError {
    /// Stable machine-readable code (e.g. `ITER_CONFIG_INVALID`).
    pub code: &'static str,
    /// The category of the error.
    pub category: ErrorCategory,
    /// Human-readable error message.
    pub message: String,
    /// Suggested recovery action.
    pub recovery_hint: RecoveryHint,
    /// Additional context as key-value pairs.
    pub context: HashMap<String, String>,
}

impl ClassifiedError {
    /// Creates a new classified error.
    pub fn new(
        code: &'static str,
        category: ErrorCategory,
        message: impl Into<String>,
        recovery_hint: RecoveryHint,
    ) -> Self {
        Self {
            code,
            category,
            message: message.into(),
            recovery_hint,
            context: HashMap::new(),
        }
    }

    /// Adds a context key-value pair to the error.
    pub fn add_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Returns true if the stage definition must change before a rerun can succeed.
    pub fn is_configuration(&self) -> bool {
        self.category == ErrorCategory::Configuration
    }

    /// Returns true if this error suggests retrying.
    pub fn should_retry(&self) -> bool {
        matches!(self.recovery_hint, RecoveryHint::RetryAfter(_))
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ClassifiedError {}

impl EngineError {
    /// Classify this error for reporting.
    pub fn classify(&self) -> ClassifiedError {
        let message = self.to_string();
        match self {
            EngineError::Validation(errors) => {
                let field = errors
                    .errors()
                    .first()
                    .map(|e| e.field.clone())
                    .unwrap_or_default();
                ClassifiedError::new(
                    "ITER_CONFIG_INVALID",
                    ErrorCategory::Configuration,
                    message,
                    RecoveryHint::FixConfiguration(field),
                )
                .add_context("fields", errors.fields().join(","))
            }
            EngineError::SourceNotFound { path } => ClassifiedError::new(
                "ITER_SOURCE_NOT_FOUND",
                ErrorCategory::Configuration,
                message,
                RecoveryHint::FixConfiguration("source".to_string()),
            )
            .add_context("path", path.clone()),
            EngineError::InvalidCount { expression, .. } => ClassifiedError::new(
                "ITER_COUNT_INVALID",
                ErrorCategory::Configuration,
                message,
                RecoveryHint::FixConfiguration("count".to_string()),
            )
            .add_context("expression", expression.clone()),
            EngineError::CursorExhausted { claimed } => ClassifiedError::new(
                "ITER_CURSOR_EXHAUSTED",
                ErrorCategory::Exhaustion,
                message,
                RecoveryHint::StopExecution,
            )
            .add_context("claimed", claimed.to_string()),
            EngineError::ApprovalRejected { stage, .. } => ClassifiedError::new(
                "ITER_APPROVAL_REJECTED",
                ErrorCategory::Approval,
                message,
                RecoveryHint::WaitForUser,
            )
            .add_context("stage", stage.clone()),
            EngineError::ApprovalTimedOut { stage } => ClassifiedError::new(
                "ITER_APPROVAL_TIMEOUT",
                ErrorCategory::Approval,
                message,
                RecoveryHint::WaitForUser,
            )
            .add_context("stage", stage.clone()),
            EngineError::Worker(_) => ClassifiedError::new(
                "ITER_WORKER_FAILED",
                ErrorCategory::Runtime,
                message,
                RecoveryHint::RetryAfter(Duration::from_secs(1)),
            ),
            EngineError::Settings(_) => ClassifiedError::new(
                "ITER_SETTINGS_INVALID",
                ErrorCategory::Configuration,
                message,
                RecoveryHint::FixConfiguration("settings".to_string()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationErrors;

    #[test]
    fn test_validation_error_classification() {
        let mut errors = ValidationErrors::new();
        errors.push("maxIterations", "must be at least 1");
        let classified = EngineError::Validation(errors).classify();

        assert_eq!(classified.code, "ITER_CONFIG_INVALID");
        assert!(classified.is_configuration());
        assert_eq!(
            classified.recovery_hint,
            RecoveryHint::FixConfiguration("maxIterations".to_string())
        );
        assert_eq!(
            classified.context.get("fields"),
            Some(&"maxIterations".to_string())
        );
    }

    #[test]
    fn test_exhaustion_is_distinct_from_configuration() {
        let classified = EngineError::CursorExhausted { claimed: 5 }.classify();
        assert_eq!(classified.category, ErrorCategory::Exhaustion);
        assert!(!classified.is_configuration());
        assert!(!classified.should_retry());
    }

    #[test]
    fn test_approval_rejection_waits_for_user() {
        let classified = EngineError::ApprovalRejected {
            stage: "review".to_string(),
            reason: "not now".to_string(),
        }
        .classify();
        assert_eq!(classified.recovery_hint, RecoveryHint::WaitForUser);
        assert_eq!(classified.context.get("stage"), Some(&"review".to_string()));
    }

    #[test]
    fn test_worker_failure_should_retry() {
        let classified = EngineError::Worker("join error".to_string()).classify();
        assert!(classified.should_retry());
        assert_eq!(classified.category.as_str(), "runtime");
    }

    #[test]
    fn test_classified_error_display_includes_code() {
        let classified = EngineError::SourceNotFound {
            path: "data.items".to_string(),
        }
        .classify();
        assert_eq!(
            classified.to_string(),
            "[ITER_SOURCE_NOT_FOUND] iteration source 'data.items' did not resolve to a value"
        );
    }
}
