//! Per-iteration outcomes and their stage-level aggregation.

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

/// Result of one claimed iteration. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationOutcome {
    pub index: usize,
    pub item: Value,
    pub success: bool,
    /// Output of the unit of work; empty on failure
    pub result: Map<String, Value>,
    pub error: Option<String>,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    /// Executions made for this claim, retries included
    pub attempts: u32,
}

fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

impl IterationOutcome {
    /// A successful outcome carrying the unit of work's result.
    pub fn success(index: usize, item: Value, result: Map<String, Value>, elapsed: Duration) -> Self {
        Self {
            index,
            item,
            success: true,
            result,
            error: None,
            elapsed,
            attempts: 1,
        }
    }

    /// A failed outcome with an error message and an empty result.
    pub fn failure(index: usize, item: Value, error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            index,
            item,
            success: false,
            result: Map::new(),
            error: Some(error.into()),
            elapsed,
            attempts: 1,
        }
    }

    /// Record how many executions produced this outcome.
    ///
    /// Zero means the unit of work never ran, e.g. its approval was rejected.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Map form of the outcome, with `elapsed` rendered as `elapsed_ms`.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Summary of an iterative stage in the shape later stages consume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedResult {
    /// Successful results, one per successful outcome, in completion order
    pub iterations: Vec<Map<String, Value>>,
    pub successful_count: usize,
    pub failed_count: usize,
    /// Same as `successful_count`
    pub count: usize,
}

impl AggregatedResult {
    /// Map form with keys `iterations`, `successful_count`, `failed_count` and `count`.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// All outcomes of one stage run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterativeStageResult {
    pub stage_name: String,
    /// Outcomes in completion order
    pub outcomes: Vec<IterationOutcome>,
    #[serde(skip)]
    wall_clock: Option<Duration>,
}

impl IterativeStageResult {
    pub fn new(stage_name: impl Into<String>, outcomes: Vec<IterationOutcome>) -> Self {
        Self {
            stage_name: stage_name.into(),
            outcomes,
            wall_clock: None,
        }
    }

    /// Attach the measured duration of the whole stage.
    pub fn with_wall_clock(mut self, wall_clock: Duration) -> Self {
        self.wall_clock = Some(wall_clock);
        self
    }

    /// True when no outcome failed. Vacuously true for an empty stage.
    pub fn all_successful(&self) -> bool {
        self.outcomes.iter().all(|o| o.success)
    }

    /// Sum of per-iteration elapsed times.
    ///
    /// For parallel stages this exceeds the wall-clock time; see [`wall_clock`](Self::wall_clock).
    pub fn total_elapsed(&self) -> Duration {
        self.outcomes.iter().map(|o| o.elapsed).sum()
    }

    pub fn wall_clock(&self) -> Option<Duration> {
        self.wall_clock
    }

    pub fn successful_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.successful_count()
    }

    /// Outcomes sorted by claim index.
    pub fn outcomes_by_index(&self) -> Vec<&IterationOutcome> {
        let mut sorted: Vec<&IterationOutcome> = self.outcomes.iter().collect();
        sorted.sort_by_key(|o| o.index);
        sorted
    }

    /// Fold the outcomes into the stage's aggregated result.
    pub fn aggregated(&self) -> AggregatedResult {
        let iterations: Vec<Map<String, Value>> = self
            .outcomes
            .iter()
            .filter(|o| o.success)
            .map(|o| o.result.clone())
            .collect();
        let successful_count = iterations.len();
        AggregatedResult {
            iterations,
            successful_count,
            failed_count: self.outcomes.len() - successful_count,
            count: successful_count,
        }
    }
}
