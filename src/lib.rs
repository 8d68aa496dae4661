//! iterflow - stage iteration engine for agentic workflows
//!
//! A stage declares how it iterates: over the elements of a collection found in
//! the workflow context, over an integer range, or while a condition holds. The
//! engine validates that declaration, materializes the items, and hands them out
//! through an atomic cursor so that any number of workers can consume a stage
//! without claiming an item twice. Each claim runs through an external
//! [`TaskOrchestrator`](orchestrator::TaskOrchestrator), and the outcomes are
//! folded into a stage result.

pub mod context;
pub mod cursor;
pub mod error;
pub mod expression;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod outcome;
pub mod settings;
pub mod spec;

pub use context::WorkflowContext;
pub use cursor::{Claim, IterationCursor};
pub use error::{EngineError, TaskError};
pub use expression::ExpressionResolver;
pub use orchestrator::{StageDefinition, StageOrchestrator, TaskOrchestrator};
pub use outcome::{AggregatedResult, IterationOutcome, IterativeStageResult};
pub use spec::{ErrorStrategy, IterationConfig, IterationSpec};
