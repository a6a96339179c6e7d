//! Core orchestration logic.
//!
//! This module contains:
//! - Store: SQLite persistence for runs, stage executions and definitions
//! - PipelineOrchestrator: the fixed INGEST -> CHECK -> ANALYZE -> NOTIFY engine
//! - DefinitionBasedOrchestrator: node-graph runs driven by stored definitions
//! - TaskQueue: in-process workers for fire-and-forget runs
//! - Signals, retry policy and safety limits shared by both engines

pub mod definition_orchestrator;
pub mod error;
pub mod executors;
pub mod nodes;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod safety;
pub mod signals;
pub mod store;

// Re-export commonly used types
pub use definition_orchestrator::{
    DefinitionBasedOrchestrator, DefinitionResult, DefinitionStatus, PlannedNode,
    ADHOC_DEFINITION,
};
pub use error::OrchestratorError;
pub use executors::{ExecutorSet, ExecutorSettings, StageExecutor};
pub use nodes::{NodeHandler, NodeRegistry};
pub use orchestrator::{PipelineOrchestrator, PipelineTrigger, PlannedStage};
pub use queue::{Job, JobStatus, QueueError, QueueSettings, TaskQueue};
pub use retry::RetryPolicy;
pub use safety::{SafetyLimits, SafetyViolation};
pub use signals::{
    build_emitter, LogSignalEmitter, MetricsSignalEmitter, NoopSignalEmitter, Signal,
    SignalBackend, SignalEmitter, SignalTags,
};
pub use store::{RunFilter, Store, StoreError};
