//! Human approval gates around iterative stages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Approval settings of a stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalConfig {
    #[serde(default)]
    pub required: bool,
    /// Ask once per claimed item instead of once per stage
    #[serde(default)]
    pub per_item: bool,
    /// Prompt shown to the approver; `${...}` tokens are substituted
    #[serde(default)]
    pub message: Option<String>,
}

impl ApprovalConfig {
    /// One approval before the stage starts.
    pub fn for_stage(message: impl Into<String>) -> Self {
        Self {
            required: true,
            per_item: false,
            message: Some(message.into()),
        }
    }

    /// One approval before each claimed item runs.
    pub fn for_each_item(message: impl Into<String>) -> Self {
        Self {
            required: true,
            per_item: true,
            message: Some(message.into()),
        }
    }

    /// Returns true if a single stage-level gate applies.
    pub fn gates_stage(&self) -> bool {
        self.required && !self.per_item
    }

    /// Returns true if every item is gated.
    pub fn gates_items(&self) -> bool {
        self.required && self.per_item
    }
}

/// What the approver is asked to decide on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalRequest {
    pub stage: String,
    pub message: String,
    /// Claim index for per-item gates
    pub index: Option<usize>,
    pub item: Option<Value>,
}

/// Answer from an [`ApprovalHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected(String),
    TimedOut,
}

/// Source of approval decisions, typically a human in the loop.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

/// Handler that approves everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalHandler for AutoApprove {
    async fn request_approval(&self, _request: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::Approved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gates() {
        assert!(ApprovalConfig::for_stage("go?").gates_stage());
        assert!(!ApprovalConfig::for_stage("go?").gates_items());
        assert!(ApprovalConfig::for_each_item("go?").gates_items());
        assert!(!ApprovalConfig::default().gates_stage());
        assert!(!ApprovalConfig::default().gates_items());
    }

    #[test]
    fn test_deserialize_camel_case() {
        let config: ApprovalConfig =
            serde_json::from_value(json!({ "required": true, "perItem": true })).unwrap();
        assert!(config.gates_items());
        assert_eq!(config.message, None);
    }

    #[test]
    fn test_auto_approve() {
        let request = ApprovalRequest {
            stage: "deploy".to_string(),
            message: "ship it?".to_string(),
            index: None,
            item: None,
        };
        assert_eq!(
            tokio_test::block_on(AutoApprove.request_approval(&request)),
            ApprovalDecision::Approved
        );
    }
}
