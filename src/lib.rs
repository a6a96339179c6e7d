//! respondr - Incident response pipeline orchestrator
//!
//! Drives an incident through a fixed sequence of stages (INGEST, CHECK,
//! ANALYZE, NOTIFY) or through a user-defined graph of nodes, persisting
//! every attempt so a failed run can be resumed where it stopped.
//!
//! # Architecture
//!
//! - Every run and every stage attempt is a row in SQLite
//! - Each attempt carries an idempotency key `{run_id}:{stage}:{attempt}`
//! - Stages that already succeeded are reused on resume, never re-executed
//! - Lifecycle signals are emitted to a backend chosen once at startup
//!
//! # Modules
//!
//! - `adapters`: Collaborator traits and local backends
//! - `core`: Orchestrators, store, queue, signals
//! - `domain`: Data structures (PipelineRun, StageExecution, results)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the fixed pipeline
//! respondr run --payload '{"alerts": [{"name": "HighCPU"}]}'
//!
//! # Run a stored definition
//! respondr run-definition --name triage --payload-file alert.json
//!
//! # Resume a failed run
//! respondr resume <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::Collaborators;
pub use core::{
    DefinitionBasedOrchestrator, PipelineOrchestrator, PipelineTrigger, Store, TaskQueue,
};
pub use domain::{PipelineResult, PipelineRun, PipelineStatus, Stage, StageExecution};
