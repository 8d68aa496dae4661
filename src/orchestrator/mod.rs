//! Running iterative stages.
//!
//! [`StageOrchestrator::run_stage`] turns a [`StageDefinition`] into an
//! [`IterativeStageResult`]:
//! 1. validate the iteration block and build the cursor (configuration errors abort)
//! 2. pass the stage-level approval gate, if any
//! 3. consume claims on the calling task, or on a pool of spawned workers when the
//!    stage may run in parallel
//! 4. run each claim through the per-item gate and the [`TaskOrchestrator`] under the
//!    iteration timeout, applying the error strategy to failures
//! 5. fold the outcomes and report metrics

mod approval;
mod retry;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::context::WorkflowContext;
use crate::cursor::{Claim, IterationCursor};
use crate::error::{EngineError, TaskError};
use crate::expression::ExpressionResolver;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::outcome::{IterationOutcome, IterativeStageResult};
use crate::settings::EngineSettings;
use crate::spec::{IterationConfig, IterationKind, IterationSpec};

pub use approval::{ApprovalConfig, ApprovalDecision, ApprovalHandler, ApprovalRequest, AutoApprove};
pub use retry::RetryBackoff;

/// A workflow stage as far as iteration is concerned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDefinition {
    pub name: String,
    #[serde(default)]
    pub agents: Vec<String>,
    pub iteration: IterationConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, iteration: IterationConfig) -> Self {
        Self {
            name: name.into(),
            agents: Vec::new(),
            iteration,
            approval: ApprovalConfig::default(),
        }
    }

    /// Add an agent that executes each iteration.
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agents.push(agent.into());
        self
    }

    pub fn with_approval(mut self, approval: ApprovalConfig) -> Self {
        self.approval = approval;
        self
    }
}

/// Executes one unit of work for a stage.
///
/// Implementations receive the claim's context, with the iteration variable bound,
/// and return the result map recorded in the outcome.
#[async_trait]
pub trait TaskOrchestrator: Send + Sync {
    async fn execute(
        &self,
        stage: &StageDefinition,
        context: &WorkflowContext,
    ) -> Result<Map<String, Value>, TaskError>;
}

/// Whether a stage may be consumed by a pool of workers.
///
/// Requires `parallel`, a bounded kind, and no per-item approval gate.
pub fn can_execute_in_parallel(spec: &IterationSpec, approval: &ApprovalConfig) -> bool {
    spec.parallel() && !spec.is_conditional() && !approval.gates_items()
}

/// Drives iterative stages against external collaborators.
#[derive(Clone)]
pub struct StageOrchestrator {
    tasks: Arc<dyn TaskOrchestrator>,
    approvals: Arc<dyn ApprovalHandler>,
    metrics: Arc<dyn MetricsSink>,
    settings: EngineSettings,
}

impl StageOrchestrator {
    /// Create an orchestrator that auto-approves and discards metrics.
    pub fn new(tasks: Arc<dyn TaskOrchestrator>) -> Self {
        Self {
            tasks,
            approvals: Arc::new(AutoApprove),
            metrics: Arc::new(NoopMetrics),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_approval_handler(mut self, approvals: Arc<dyn ApprovalHandler>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Validate the stage's iteration block and build its cursor.
    pub fn prepare(
        &self,
        stage: &StageDefinition,
        context: WorkflowContext,
    ) -> Result<(IterationSpec, IterationCursor), EngineError> {
        let spec = stage.iteration.validate()?;
        let cursor = IterationCursor::new(&spec, context)?;
        Ok((spec, cursor))
    }

    /// Run a stage to completion.
    pub async fn run_stage(
        &self,
        stage: &StageDefinition,
        context: WorkflowContext,
    ) -> Result<IterativeStageResult, EngineError> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.run_stage_with_cancel(stage, context, cancel_rx).await
    }

    /// Run a stage, stopping new claims once `cancel` turns `true`.
    ///
    /// Claims already executing are allowed to finish and are recorded; unclaimed
    /// items are simply never run.
    pub async fn run_stage_with_cancel(
        &self,
        stage: &StageDefinition,
        context: WorkflowContext,
        cancel: watch::Receiver<bool>,
    ) -> Result<IterativeStageResult, EngineError> {
        let started = Instant::now();
        let (spec, cursor) = self.prepare(stage, context)?;

        if stage.approval.gates_stage() {
            self.stage_approval(stage, &cursor).await?;
        }

        let parallel = can_execute_in_parallel(&spec, &stage.approval);
        if spec.parallel() && !parallel {
            debug!(stage = %stage.name, "Parallel execution not possible, running sequentially");
        }
        let workers = if parallel {
            spec.max_concurrent().min(cursor.total())
        } else {
            1
        };

        info!(
            stage = %stage.name,
            kind = %spec.iteration_type(),
            total = cursor.total(),
            unbounded = cursor.is_unbounded(),
            workers,
            strategy = %spec.error_strategy(),
            "Starting iterative stage"
        );

        let backoff = self
            .settings
            .retry
            .backoff(spec.max_attempts().saturating_sub(1));
        let run = Arc::new(StageRun {
            stage: stage.clone(),
            spec,
            cursor,
            tasks: Arc::clone(&self.tasks),
            approvals: Arc::clone(&self.approvals),
            metrics: Arc::clone(&self.metrics),
            backoff,
            resolver: ExpressionResolver::new(),
            stop: AtomicBool::new(false),
            cancel,
            outcomes: Mutex::new(Vec::new()),
        });

        if parallel {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let run = Arc::clone(&run);
                    tokio::spawn(async move { run.consume(worker).await })
                })
                .collect();

            for joined in futures::future::join_all(handles).await {
                joined.map_err(|e| {
                    if e.is_panic() {
                        EngineError::Worker(panic_message(e.into_panic()))
                    } else {
                        EngineError::Worker(e.to_string())
                    }
                })?;
            }
        } else {
            AssertUnwindSafe(run.consume(0))
                .catch_unwind()
                .await
                .map_err(|panic| EngineError::Worker(panic_message(panic)))?;
        }

        let outcomes = std::mem::take(&mut *run.outcomes.lock().await);
        let result = IterativeStageResult::new(stage.name.clone(), outcomes)
            .with_wall_clock(started.elapsed());

        info!(
            stage = %stage.name,
            successful = result.successful_count(),
            failed = result.failed_count(),
            cancelled = run.is_cancelled(),
            wall_clock_ms = started.elapsed().as_millis() as u64,
            "Iterative stage finished"
        );
        self.metrics.record_stage(&result);
        Ok(result)
    }

    async fn stage_approval(
        &self,
        stage: &StageDefinition,
        cursor: &IterationCursor,
    ) -> Result<(), EngineError> {
        let request = ApprovalRequest {
            stage: stage.name.clone(),
            message: approval_message(stage, &ExpressionResolver::new(), cursor.base_context()),
            index: None,
            item: None,
        };
        info!(stage = %stage.name, "Requesting stage approval");
        match self.approvals.request_approval(&request).await {
            ApprovalDecision::Approved => Ok(()),
            ApprovalDecision::Rejected(reason) => {
                warn!(stage = %stage.name, reason = %reason, "Stage approval rejected");
                Err(EngineError::ApprovalRejected {
                    stage: stage.name.clone(),
                    reason,
                })
            }
            ApprovalDecision::TimedOut => {
                warn!(stage = %stage.name, "Stage approval timed out");
                Err(EngineError::ApprovalTimedOut {
                    stage: stage.name.clone(),
                })
            }
        }
    }
}

fn approval_message(
    stage: &StageDefinition,
    resolver: &ExpressionResolver,
    context: &WorkflowContext,
) -> String {
    match &stage.approval.message {
        Some(message) => resolver.substitute(message, context, None),
        None => format!("Approve stage '{}'?", stage.name),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("iteration panicked: {}", message)
}

/// State shared by every consumer of one stage run.
struct StageRun {
    stage: StageDefinition,
    spec: IterationSpec,
    cursor: IterationCursor,
    tasks: Arc<dyn TaskOrchestrator>,
    approvals: Arc<dyn ApprovalHandler>,
    metrics: Arc<dyn MetricsSink>,
    backoff: RetryBackoff,
    resolver: ExpressionResolver,
    stop: AtomicBool,
    cancel: watch::Receiver<bool>,
    outcomes: Mutex<Vec<IterationOutcome>>,
}

impl StageRun {
    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.is_cancelled()
    }

    /// Claim and run items until the cursor is drained or the run is stopped.
    async fn consume(&self, worker: usize) {
        loop {
            if self.should_stop() {
                debug!(stage = %self.stage.name, worker, "Consumer stopping");
                break;
            }
            let Some(claim) = self.cursor.try_next() else {
                break;
            };

            let outcome = self.process(&claim).await;

            if !outcome.success && self.spec.error_strategy().stops_on_failure() {
                warn!(
                    stage = %self.stage.name,
                    index = outcome.index,
                    "Iteration failed, no further items will be claimed"
                );
                self.stop.store(true, Ordering::SeqCst);
            }
            self.apply_updates(&claim, &outcome);

            self.metrics.record_iteration(&self.stage.name, &outcome);
            self.outcomes.lock().await.push(outcome);
        }
    }

    async fn process(&self, claim: &Claim) -> IterationOutcome {
        let started = Instant::now();

        if self.stage.approval.gates_items() {
            if let Some(reason) = self.item_approval(claim).await {
                return IterationOutcome::failure(
                    claim.index,
                    claim.item.clone(),
                    reason,
                    started.elapsed(),
                )
                .with_attempts(0);
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let execution = tokio::time::timeout(
                self.spec.iteration_timeout(),
                self.tasks.execute(&self.stage, &claim.context),
            )
            .await;

            let (error, retryable) = match execution {
                Ok(Ok(result)) => {
                    debug!(stage = %self.stage.name, index = claim.index, attempt, "Iteration succeeded");
                    return IterationOutcome::success(
                        claim.index,
                        claim.item.clone(),
                        result,
                        started.elapsed(),
                    )
                    .with_attempts(attempt);
                }
                Ok(Err(TaskError::Rejected(reason))) => (format!("task rejected: {}", reason), false),
                Ok(Err(e)) => (e.to_string(), true),
                Err(_) => (
                    format!(
                        "iteration timed out after {} ms",
                        self.spec.iteration_timeout().as_millis()
                    ),
                    true,
                ),
            };

            if retryable && self.backoff.allows_retry(attempt) && !self.is_cancelled() {
                let delay = self.backoff.delay(claim.index, attempt);
                warn!(
                    stage = %self.stage.name,
                    index = claim.index,
                    attempt,
                    max_attempts = self.backoff.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Iteration failed, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            warn!(
                stage = %self.stage.name,
                index = claim.index,
                attempts = attempt,
                error = %error,
                "Iteration failed"
            );
            return IterationOutcome::failure(claim.index, claim.item.clone(), error, started.elapsed())
                .with_attempts(attempt);
        }
    }

    /// Ask for per-item approval. Returns the failure reason when not approved.
    async fn item_approval(&self, claim: &Claim) -> Option<String> {
        let request = ApprovalRequest {
            stage: self.stage.name.clone(),
            message: approval_message(&self.stage, &self.resolver, &claim.context),
            index: Some(claim.index),
            item: Some(claim.item.clone()),
        };
        match self.approvals.request_approval(&request).await {
            ApprovalDecision::Approved => None,
            ApprovalDecision::Rejected(reason) => {
                warn!(stage = %self.stage.name, index = claim.index, reason = %reason, "Item approval rejected");
                Some(format!("approval rejected: {}", reason))
            }
            ApprovalDecision::TimedOut => {
                warn!(stage = %self.stage.name, index = claim.index, "Item approval timed out");
                Some("approval timed out".to_string())
            }
        }
    }

    /// Evaluate conditional `updates` against the claim context plus the iteration result.
    fn apply_updates(&self, claim: &Claim, outcome: &IterationOutcome) {
        let IterationKind::Conditional { updates, .. } = self.spec.kind() else {
            return;
        };
        if updates.is_empty() {
            return;
        }

        let scope = claim
            .context
            .with_overlay(&outcome.result)
            .with_variable("result", Value::Object(outcome.result.clone()));
        let values: Map<String, Value> = updates
            .iter()
            .map(|(name, expr)| {
                (
                    name.clone(),
                    self.resolver.evaluate_value(expr, &scope, None),
                )
            })
            .collect();
        self.cursor.update_variables(Some(&values));
    }
}
