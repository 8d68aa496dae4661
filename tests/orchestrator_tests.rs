//! Integration tests for running iterative stages end-to-end.
//!
//! A scripted task orchestrator stands in for the agents: it records every call,
//! tracks how many calls overlap, and fails or stalls on request.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::watch;

use iterflow::error::{EngineError, TaskError};
use iterflow::metrics::MetricsCollector;
use iterflow::orchestrator::{
    ApprovalConfig, ApprovalDecision, ApprovalHandler, ApprovalRequest, StageDefinition,
    StageOrchestrator, TaskOrchestrator,
};
use iterflow::settings::EngineSettings;
use iterflow::spec::{ErrorStrategy, IterationConfig};
use iterflow::WorkflowContext;

// ============================================================================
// Test collaborators
// ============================================================================

#[derive(Default)]
struct ScriptedTask {
    /// Items that always fail
    failing: HashSet<String>,
    /// Items that fail this many times before succeeding
    flaky: Mutex<HashMap<String, u32>>,
    delay: Duration,
    calls: Mutex<Vec<Value>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Extra result fields per item
    extra: HashMap<String, Map<String, Value>>,
    /// Signal cancellation once this item has been executed
    cancel_after: Option<(String, watch::Sender<bool>)>,
}

impl ScriptedTask {
    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing_on(mut self, item: &str) -> Self {
        self.failing.insert(item.to_string());
        self
    }

    fn flaky_on(self, item: &str, failures: u32) -> Self {
        self.flaky
            .lock()
            .unwrap()
            .insert(item.to_string(), failures);
        self
    }

    fn returning(mut self, item: &str, result: Value) -> Self {
        self.extra
            .insert(item.to_string(), result.as_object().cloned().unwrap());
        self
    }

    fn calls(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

fn key(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl TaskOrchestrator for ScriptedTask {
    async fn execute(
        &self,
        stage: &StageDefinition,
        context: &WorkflowContext,
    ) -> Result<Map<String, Value>, TaskError> {
        let variable = stage.iteration.variable.clone().unwrap_or_default();
        let item = context.get(&variable).cloned().unwrap_or(Value::Null);
        let name = key(&item);
        self.calls.lock().unwrap().push(item.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some((trigger, sender)) = &self.cancel_after {
            if *trigger == name {
                let _ = sender.send(true);
            }
        }

        if self.failing.contains(&name) {
            return Err(TaskError::failed(format!("{} is broken", name)));
        }
        {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(remaining) = flaky.get_mut(&name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TaskError::failed(format!("{} is flaky", name)));
                }
            }
        }

        let mut result = self.extra.get(&name).cloned().unwrap_or_default();
        result.insert("processed".to_string(), item);
        Ok(result)
    }
}

struct ScriptedApprovals {
    decisions: HashMap<Option<String>, ApprovalDecision>,
    requests: Mutex<Vec<ApprovalRequest>>,
}

impl ScriptedApprovals {
    fn new() -> Self {
        Self {
            decisions: HashMap::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn deciding(mut self, item: Option<&str>, decision: ApprovalDecision) -> Self {
        self.decisions.insert(item.map(String::from), decision);
        self
    }
}

#[async_trait]
impl ApprovalHandler for ScriptedApprovals {
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalDecision {
        self.requests.lock().unwrap().push(request.clone());
        let item = request.item.as_ref().map(key);
        self.decisions
            .get(&item)
            .cloned()
            .unwrap_or(ApprovalDecision::Approved)
    }
}

fn fast_retries() -> EngineSettings {
    EngineSettings::from_toml_str("[retry]\nbase_delay_ms = 1\nmax_delay_ms = 5\njitter_percent = 0\n")
        .unwrap()
}

fn letters(n: usize) -> WorkflowContext {
    let items: Vec<Value> = (0..n).map(|i| json!(format!("item-{}", i))).collect();
    WorkflowContext::from_value(json!({ "items": items }))
}

fn abcd() -> WorkflowContext {
    WorkflowContext::from_value(json!({ "items": ["a", "b", "c", "d"] }))
}

// ============================================================================
// Sequential and parallel consumption
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_stage_runs_each_item_once_within_limit() {
    let task = Arc::new(ScriptedTask::default().with_delay(Duration::from_millis(20)));
    let orchestrator = StageOrchestrator::new(task.clone());
    let stage = StageDefinition::new(
        "fan-out",
        IterationConfig::data_driven("items", "item").with_parallel(4),
    );

    let result = orchestrator.run_stage(&stage, letters(20)).await.unwrap();

    assert_eq!(result.outcomes.len(), 20);
    assert!(result.all_successful());

    let mut seen: Vec<String> = task.calls().iter().map(key).collect();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 20);

    assert!(task.max_in_flight() <= 4);
    assert!(task.max_in_flight() >= 2);

    let indices: Vec<usize> = result.outcomes_by_index().iter().map(|o| o.index).collect();
    assert_eq!(indices, (0..20).collect::<Vec<_>>());
    assert!(result.total_elapsed() > result.wall_clock().unwrap());
}

#[tokio::test]
async fn test_parallel_pool_is_capped_by_item_count() {
    let task = Arc::new(ScriptedTask::default().with_delay(Duration::from_millis(10)));
    let orchestrator = StageOrchestrator::new(task.clone());
    let stage = StageDefinition::new(
        "small",
        IterationConfig::data_driven("items", "item").with_parallel(16),
    );

    let result = orchestrator.run_stage(&stage, letters(2)).await.unwrap();
    assert_eq!(result.successful_count(), 2);
    assert!(task.max_in_flight() <= 2);
}

#[tokio::test]
async fn test_count_based_stage_binds_range() {
    let task = Arc::new(ScriptedTask::default());
    let orchestrator = StageOrchestrator::new(task.clone());
    let stage = StageDefinition::new(
        "pages",
        IterationConfig::count_based("${pages}", "page").with_start(1),
    );
    let context = WorkflowContext::from_value(json!({ "pages": 3 }));

    let result = orchestrator.run_stage(&stage, context).await.unwrap();

    assert_eq!(task.calls(), vec![json!(1), json!(2), json!(3)]);
    assert_eq!(result.aggregated().count, 3);
}

#[tokio::test]
async fn test_empty_source_produces_empty_result() {
    let task = Arc::new(ScriptedTask::default());
    let orchestrator = StageOrchestrator::new(task.clone());
    let stage = StageDefinition::new(
        "nothing",
        IterationConfig::data_driven("items", "item").with_parallel(4),
    );

    let result = orchestrator
        .run_stage(&stage, WorkflowContext::from_value(json!({ "items": [] })))
        .await
        .unwrap();

    assert!(result.outcomes.is_empty());
    assert!(result.all_successful());
    assert!(task.calls().is_empty());
    assert_eq!(
        result.aggregated().to_value(),
        json!({ "iterations": [], "successful_count": 0, "failed_count": 0, "count": 0 })
    );
}

#[tokio::test]
async fn test_configuration_errors_abort_before_execution() {
    let task = Arc::new(ScriptedTask::default());
    let orchestrator = StageOrchestrator::new(task.clone());

    let missing = StageDefinition::new("missing", IterationConfig::data_driven("absent", "item"));
    let err = orchestrator
        .run_stage(&missing, WorkflowContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SourceNotFound { .. }));

    let invalid = StageDefinition::new("invalid", IterationConfig::count_based(2u64, " "));
    let err = orchestrator
        .run_stage(&invalid, WorkflowContext::default())
        .await
        .unwrap_err();
    assert!(err.is_configuration_error());
    assert_eq!(err.field(), Some("variable"));

    assert!(task.calls().is_empty());
}

// ============================================================================
// Error strategies
// ============================================================================

#[tokio::test]
async fn test_fail_fast_stops_claiming() {
    let task = Arc::new(ScriptedTask::default().failing_on("b"));
    let orchestrator = StageOrchestrator::new(task.clone());
    let stage = StageDefinition::new("ff", IterationConfig::data_driven("items", "item"));

    let result = orchestrator.run_stage(&stage, abcd()).await.unwrap();

    assert_eq!(result.outcomes.len(), 2);
    assert_eq!(result.failed_count(), 1);
    assert_eq!(task.calls(), vec![json!("a"), json!("b")]);
    assert_eq!(result.outcomes[1].error.as_deref(), Some("b is broken"));
}

#[tokio::test]
async fn test_continue_records_every_outcome() {
    let task = Arc::new(ScriptedTask::default().failing_on("b"));
    let orchestrator = StageOrchestrator::new(task.clone());
    let stage = StageDefinition::new(
        "cont",
        IterationConfig::data_driven("items", "item").with_error_strategy(ErrorStrategy::Continue),
    );

    let result = orchestrator.run_stage(&stage, abcd()).await.unwrap();

    assert_eq!(result.outcomes.len(), 4);
    assert_eq!(result.successful_count(), 3);
    assert!(!result.all_successful());

    let aggregated = result.aggregated();
    assert_eq!(aggregated.failed_count, 1);
    assert_eq!(aggregated.count, 3);
    assert!(aggregated.iterations.iter().all(|r| r["processed"] != json!("b")));
}

#[tokio::test]
async fn test_retry_recovers_flaky_item() {
    let task = Arc::new(ScriptedTask::default().flaky_on("b", 2));
    let orchestrator = StageOrchestrator::new(task.clone()).with_settings(fast_retries());
    let stage = StageDefinition::new(
        "retry",
        IterationConfig::data_driven("items", "item")
            .with_error_strategy(ErrorStrategy::Retry)
            .with_retry_count(3),
    );

    let result = orchestrator.run_stage(&stage, abcd()).await.unwrap();

    assert!(result.all_successful());
    let b = result.outcomes.iter().find(|o| o.item == json!("b")).unwrap();
    assert_eq!(b.attempts, 3);
    assert_eq!(task.calls().len(), 6);
}

#[tokio::test]
async fn test_retry_exhausted_then_keeps_claiming() {
    let task = Arc::new(ScriptedTask::default().failing_on("a"));
    let orchestrator = StageOrchestrator::new(task.clone()).with_settings(fast_retries());
    let stage = StageDefinition::new(
        "retry",
        IterationConfig::data_driven("items", "item")
            .with_error_strategy(ErrorStrategy::Retry)
            .with_retry_count(2),
    );

    let result = orchestrator.run_stage(&stage, abcd()).await.unwrap();

    assert_eq!(result.outcomes.len(), 4);
    assert_eq!(result.failed_count(), 1);
    let a = &result.outcomes_by_index()[0];
    assert!(!a.success);
    assert_eq!(a.attempts, 3);
    assert_eq!(task.calls().len(), 6);
}

#[tokio::test]
async fn test_iteration_timeout_is_a_failure() {
    let task = Arc::new(ScriptedTask::default().with_delay(Duration::from_secs(5)));
    let orchestrator = StageOrchestrator::new(task.clone());
    let stage = StageDefinition::new(
        "slow",
        IterationConfig::count_based(1u64, "n").with_iteration_timeout(1000),
    );

    let result = orchestrator
        .run_stage(&stage, WorkflowContext::default())
        .await
        .unwrap();

    assert_eq!(result.failed_count(), 1);
    let error = result.outcomes[0].error.clone().unwrap();
    assert!(error.contains("timed out"), "unexpected error: {}", error);
    assert!(result.wall_clock().unwrap() < Duration::from_secs(5));
}

// ============================================================================
// Conditional stages
// ============================================================================

#[tokio::test]
async fn test_conditional_stage_applies_updates() {
    let task = Arc::new(ScriptedTask::default());
    let orchestrator = StageOrchestrator::new(task.clone());
    let stage = StageDefinition::new(
        "countdown",
        IterationConfig::conditional("${remaining} > 0", 10, "round")
            .with_update("remaining", "${remaining} - 1"),
    );
    let context = WorkflowContext::from_value(json!({ "remaining": 3 }));

    let result = orchestrator.run_stage(&stage, context).await.unwrap();

    assert_eq!(result.outcomes.len(), 3);
    assert_eq!(task.calls(), vec![json!(0), json!(1), json!(2)]);
}

#[tokio::test]
async fn test_conditional_updates_see_iteration_result() {
    let task = Arc::new(ScriptedTask::default().returning("2", json!({ "has_more": false })));
    let orchestrator = StageOrchestrator::new(task.clone());
    let stage = StageDefinition::new(
        "paginate",
        IterationConfig::conditional("${more}", 10, "page").with_update("more", "${has_more:-true}"),
    );
    let context = WorkflowContext::from_value(json!({ "more": true }));

    let result = orchestrator.run_stage(&stage, context).await.unwrap();

    assert_eq!(result.outcomes.len(), 3);
}

#[tokio::test]
async fn test_conditional_stage_condition_on_loop_variable() {
    let task = Arc::new(ScriptedTask::default());
    let orchestrator = StageOrchestrator::new(task.clone());
    let stage = StageDefinition::new(
        "attempts",
        IterationConfig::conditional("${attempt} < ${limit}", 10, "attempt"),
    );
    let context = WorkflowContext::from_value(json!({ "limit": 3 }));

    let result = orchestrator.run_stage(&stage, context).await.unwrap();

    assert_eq!(result.outcomes.len(), 3);
    assert_eq!(task.calls(), vec![json!(0), json!(1), json!(2)]);
}

#[tokio::test]
async fn test_conditional_stage_respects_ceiling() {
    let task = Arc::new(ScriptedTask::default());
    let orchestrator = StageOrchestrator::new(task.clone());
    let stage = StageDefinition::new(
        "forever",
        IterationConfig::conditional("true", 4, "n").with_parallel(8),
    );

    let result = orchestrator
        .run_stage(&stage, WorkflowContext::default())
        .await
        .unwrap();

    assert_eq!(result.outcomes.len(), 4);
    assert_eq!(task.max_in_flight(), 1);
}

// ============================================================================
// Approval gates
// ============================================================================

#[tokio::test]
async fn test_stage_rejection_aborts() {
    let task = Arc::new(ScriptedTask::default());
    let approvals = Arc::new(
        ScriptedApprovals::new().deciding(None, ApprovalDecision::Rejected("not today".to_string())),
    );
    let orchestrator = StageOrchestrator::new(task.clone()).with_approval_handler(approvals.clone());
    let stage = StageDefinition::new("deploy", IterationConfig::data_driven("items", "item"))
        .with_approval(ApprovalConfig::for_stage("Deploy ${items}?"));

    let err = orchestrator.run_stage(&stage, abcd()).await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::ApprovalRejected { ref stage, ref reason } if stage == "deploy" && reason == "not today"
    ));
    assert!(task.calls().is_empty());
    let requests = approvals.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].message, r#"Deploy ["a","b","c","d"]?"#);
}

#[tokio::test]
async fn test_stage_approval_timeout_aborts() {
    let task = Arc::new(ScriptedTask::default());
    let approvals = Arc::new(ScriptedApprovals::new().deciding(None, ApprovalDecision::TimedOut));
    let orchestrator = StageOrchestrator::new(task.clone()).with_approval_handler(approvals);
    let stage = StageDefinition::new("deploy", IterationConfig::data_driven("items", "item"))
        .with_approval(ApprovalConfig::for_stage("Deploy?"));

    let err = orchestrator.run_stage(&stage, abcd()).await.unwrap_err();
    assert!(matches!(err, EngineError::ApprovalTimedOut { .. }));
}

#[tokio::test]
async fn test_per_item_rejection_fails_only_that_item() {
    let task = Arc::new(ScriptedTask::default());
    let approvals = Arc::new(
        ScriptedApprovals::new().deciding(Some("b"), ApprovalDecision::Rejected("risky".to_string())),
    );
    let orchestrator = StageOrchestrator::new(task.clone())
        .with_approval_handler(approvals.clone())
        .with_settings(fast_retries());
    let stage = StageDefinition::new(
        "review",
        IterationConfig::data_driven("items", "item")
            .with_parallel(4)
            .with_error_strategy(ErrorStrategy::Retry),
    )
    .with_approval(ApprovalConfig::for_each_item("Process ${item}?"));

    let result = orchestrator.run_stage(&stage, abcd()).await.unwrap();

    assert_eq!(result.outcomes.len(), 4);
    let b = result.outcomes.iter().find(|o| o.item == json!("b")).unwrap();
    assert!(!b.success);
    assert_eq!(b.attempts, 0);
    assert_eq!(b.error.as_deref(), Some("approval rejected: risky"));
    assert_eq!(task.calls(), vec![json!("a"), json!("c"), json!("d")]);
    assert_eq!(task.max_in_flight(), 1);

    let requests = approvals.requests.lock().unwrap();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[1].message, "Process b?");
    assert_eq!(requests[1].index, Some(1));
}

// ============================================================================
// Cancellation, panics and metrics
// ============================================================================

struct PanickingTask;

#[async_trait]
impl TaskOrchestrator for PanickingTask {
    async fn execute(
        &self,
        _stage: &StageDefinition,
        context: &WorkflowContext,
    ) -> Result<Map<String, Value>, TaskError> {
        if context.get_string("item").as_deref() == Some("c") {
            panic!("agent crashed on c");
        }
        Ok(Map::new())
    }
}

#[tokio::test]
async fn test_panicking_task_fails_the_stage_in_both_modes() {
    let orchestrator = StageOrchestrator::new(Arc::new(PanickingTask));
    let sequential = StageDefinition::new("seq", IterationConfig::data_driven("items", "item"));
    let parallel = StageDefinition::new(
        "par",
        IterationConfig::data_driven("items", "item").with_parallel(2),
    );

    for stage in [sequential, parallel] {
        let err = orchestrator.run_stage(&stage, abcd()).await.unwrap_err();
        match err {
            EngineError::Worker(message) => {
                assert!(message.contains("agent crashed on c"), "{}: {}", stage.name, message)
            }
            other => panic!("{}: unexpected error {:?}", stage.name, other),
        }
    }
}

#[tokio::test]
async fn test_cancellation_stops_new_claims() {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = Arc::new(ScriptedTask {
        cancel_after: Some(("2".to_string(), cancel_tx)),
        ..ScriptedTask::default()
    });
    let orchestrator = StageOrchestrator::new(task.clone());
    let stage = StageDefinition::new("long", IterationConfig::count_based(100u64, "n"));

    let result = orchestrator
        .run_stage_with_cancel(&stage, WorkflowContext::default(), cancel_rx)
        .await
        .unwrap();

    assert_eq!(result.outcomes.len(), 3);
    assert!(result.all_successful());
}

#[tokio::test]
async fn test_metrics_are_reported() {
    let collector = MetricsCollector::new();
    let task = Arc::new(ScriptedTask::default().failing_on("c"));
    let orchestrator =
        StageOrchestrator::new(task).with_metrics(Arc::new(collector.clone()));
    let stage = StageDefinition::new(
        "measured",
        IterationConfig::data_driven("items", "item").with_error_strategy(ErrorStrategy::Continue),
    );

    orchestrator.run_stage(&stage, abcd()).await.unwrap();

    let metrics = collector.build();
    assert_eq!(metrics.total_stages, 1);
    assert_eq!(metrics.total_iterations, 4);
    assert_eq!(metrics.failed_iterations, 1);
    assert_eq!(metrics.iteration_durations["measured"].count, 4);
    assert!(metrics.stages[0].wall_clock.is_some());
}
