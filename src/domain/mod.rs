//! Domain types for the respondr engine.
//!
//! This module contains the core data structures:
//! - PipelineRun / StageExecution: the durable state machine
//! - PipelineDefinition: versioned workflow documents
//! - Stage results and node results (pure, serializable DTOs)

pub mod definition;
pub mod node;
pub mod results;
pub mod run;
pub mod stage_execution;
pub mod status;

// Re-export commonly used types
pub use definition::{DefinitionConfig, DefinitionDefaults, NodeSpec, PipelineDefinition};
pub use node::{NodeContext, NodeResult};
pub use results::{
    AnalyzeResult, CheckResult, Delivery, IngestResult, NotifyResult, PipelineOutcome,
    PipelineResult, Recommendation, RecommendationPriority, StageContext, StageExecutionError,
    StageOutput,
};
pub use run::{PipelineRun, FORCE_FAILED_ERROR, STALE_RUN_ERROR};
pub use stage_execution::{idempotency_key, StageExecution};
pub use status::{PipelineStatus, Stage, StageStatus, TransitionError, UnknownVariant};
