//! Execution metrics for iterative stages.
//!
//! The orchestrator reports every finished iteration and every finished stage to
//! a [`MetricsSink`]. [`NoopMetrics`] discards them; [`MetricsCollector`] keeps
//! them in memory and can be shared across parallel workers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::outcome::{IterationOutcome, IterativeStageResult};

/// Receiver for per-iteration and per-stage measurements.
pub trait MetricsSink: Send + Sync {
    /// Called once per recorded outcome, from whichever worker produced it.
    fn record_iteration(&self, stage: &str, outcome: &IterationOutcome);

    /// Called once when a stage run finishes.
    fn record_stage(&self, result: &IterativeStageResult);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_iteration(&self, _stage: &str, _outcome: &IterationOutcome) {}

    fn record_stage(&self, _result: &IterativeStageResult) {}
}

/// Metrics for a single finished stage run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMetrics {
    pub stage_name: String,
    /// Number of recorded outcomes
    pub iterations: usize,
    pub successful: usize,
    pub failed: usize,
    /// Extra executions spent on retries
    pub retries: u32,
    /// Sum of per-iteration elapsed times
    pub total_elapsed: Duration,
    pub wall_clock: Option<Duration>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

impl StageMetrics {
    /// Summarize a stage result.
    pub fn from_result(result: &IterativeStageResult) -> Self {
        Self {
            stage_name: result.stage_name.clone(),
            iterations: result.outcomes.len(),
            successful: result.successful_count(),
            failed: result.failed_count(),
            retries: result
                .outcomes
                .iter()
                .map(|o| o.attempts.saturating_sub(1))
                .sum(),
            total_elapsed: result.total_elapsed(),
            wall_clock: result.wall_clock(),
            completed_at: chrono::Utc::now(),
        }
    }

    /// Summed iteration time over wall-clock time.
    ///
    /// Near 1.0 for sequential stages, up to the worker count for parallel ones.
    pub fn parallelism(&self) -> f64 {
        match self.wall_clock {
            Some(wall) if wall > Duration::ZERO => {
                self.total_elapsed.as_secs_f64() / wall.as_secs_f64()
            }
            _ => 1.0,
        }
    }
}

/// Duration statistics over a set of iterations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DurationStats {
    pub count: u32,
    pub mean: Duration,
    pub min: Duration,
    pub max: Duration,
    /// Sum of all durations (for calculating mean)
    pub total: Duration,
}

impl DurationStats {
    /// Add a new duration sample.
    pub fn add_sample(&mut self, duration: Duration) {
        self.count += 1;
        self.total += duration;
        self.mean = self.total / self.count;

        if self.count == 1 {
            self.min = duration;
            self.max = duration;
        } else {
            self.min = self.min.min(duration);
            self.max = self.max.max(duration);
        }
    }
}

/// Aggregated metrics across every recorded stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_stages: usize,
    /// Stages whose outcomes were all successful
    pub successful_stages: usize,
    pub total_iterations: usize,
    pub failed_iterations: usize,
    pub retries: u32,
    /// Iteration durations per stage name, fed as iterations complete
    pub iteration_durations: HashMap<String, DurationStats>,
    pub stages: Vec<StageMetrics>,
}

impl ExecutionMetrics {
    /// Fraction of iterations that succeeded.
    pub fn iteration_success_rate(&self) -> f64 {
        if self.total_iterations == 0 {
            return 0.0;
        }
        (self.total_iterations - self.failed_iterations) as f64 / self.total_iterations as f64
    }

    /// Stage with the highest mean iteration duration.
    pub fn slowest_stage(&self) -> Option<&str> {
        self.iteration_durations
            .iter()
            .max_by_key(|(_, stats)| stats.mean)
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    iteration_durations: HashMap<String, DurationStats>,
    stages: Vec<StageMetrics>,
}

impl MetricsState {
    fn build(&self) -> ExecutionMetrics {
        let total_iterations = self.stages.iter().map(|s| s.iterations).sum();
        let failed_iterations = self.stages.iter().map(|s| s.failed).sum();
        ExecutionMetrics {
            total_stages: self.stages.len(),
            successful_stages: self.stages.iter().filter(|s| s.failed == 0).count(),
            total_iterations,
            failed_iterations,
            retries: self.stages.iter().map(|s| s.retries).sum(),
            iteration_durations: self.iteration_durations.clone(),
            stages: self.stages.clone(),
        }
    }
}

/// Thread-safe in-memory metrics sink.
///
/// Clones share the same storage, so one clone can be handed to the
/// orchestrator and another kept for reading.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<RwLock<MetricsState>>,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics for every stage recorded so far, in completion order.
    pub fn stages(&self) -> Vec<StageMetrics> {
        self.inner
            .read()
            .map(|state| state.stages.clone())
            .unwrap_or_default()
    }

    /// Build the aggregated metrics.
    pub fn build(&self) -> ExecutionMetrics {
        self.inner
            .read()
            .map(|state| state.build())
            .unwrap_or_default()
    }
}

impl MetricsSink for MetricsCollector {
    fn record_iteration(&self, stage: &str, outcome: &IterationOutcome) {
        if let Ok(mut state) = self.inner.write() {
            state
                .iteration_durations
                .entry(stage.to_string())
                .or_default()
                .add_sample(outcome.elapsed);
        }
    }

    fn record_stage(&self, result: &IterativeStageResult) {
        if let Ok(mut state) = self.inner.write() {
            state.stages.push(StageMetrics::from_result(result));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn outcome(index: usize, ok: bool, millis: u64) -> IterationOutcome {
        let elapsed = Duration::from_millis(millis);
        if ok {
            IterationOutcome::success(index, json!(index), Map::new(), elapsed)
        } else {
            IterationOutcome::failure(index, json!(index), "failed", elapsed).with_attempts(3)
        }
    }

    #[test]
    fn test_duration_stats() {
        let mut stats = DurationStats::default();
        stats.add_sample(Duration::from_millis(10));
        stats.add_sample(Duration::from_millis(30));

        assert_eq!(stats.count, 2);
        assert_eq!(stats.mean, Duration::from_millis(20));
        assert_eq!(stats.min, Duration::from_millis(10));
        assert_eq!(stats.max, Duration::from_millis(30));
    }

    #[test]
    fn test_collector_records_iterations_and_stages() {
        let collector = MetricsCollector::new();
        let outcomes = vec![outcome(0, true, 10), outcome(1, false, 50)];
        for o in &outcomes {
            collector.record_iteration("lint", o);
        }
        collector.record_stage(
            &IterativeStageResult::new("lint", outcomes).with_wall_clock(Duration::from_millis(30)),
        );

        let metrics = collector.build();
        assert_eq!(metrics.total_stages, 1);
        assert_eq!(metrics.successful_stages, 0);
        assert_eq!(metrics.total_iterations, 2);
        assert_eq!(metrics.failed_iterations, 1);
        assert_eq!(metrics.retries, 2);
        assert_eq!(metrics.iteration_durations["lint"].count, 2);
        assert!((metrics.iteration_success_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(metrics.slowest_stage(), Some("lint"));

        let stage = &collector.stages()[0];
        assert!((stage.parallelism() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_clones_share_storage() {
        let collector = MetricsCollector::new();
        let handle = collector.clone();
        handle.record_stage(&IterativeStageResult::new("empty", Vec::new()));
        assert_eq!(collector.build().total_stages, 1);
        assert_eq!(collector.build().successful_stages, 1);
    }

    #[test]
    fn test_empty_metrics() {
        let metrics = MetricsCollector::new().build();
        assert_eq!(metrics.iteration_success_rate(), 0.0);
        assert_eq!(metrics.slowest_stage(), None);
    }
}
