//! Orchestrator errors.

use thiserror::Error;

use crate::domain::{PipelineStatus, StageExecutionError};

use super::safety::SafetyViolation;
use super::store::StoreError;

/// Errors returned by the orchestrators' entry points.
///
/// A stage failure is not an error at this level: it ends the run FAILED and
/// is reported through `PipelineResult`. Callers that want it as an error use
/// `PipelineResult::into_result`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Safety(#[from] SafetyViolation),

    #[error("Invalid pipeline definition: {}", .0.join("; "))]
    InvalidDefinition(Vec<String>),

    #[error("Pipeline run not found: {0}")]
    RunNotFound(String),

    #[error("Run {run_id} is {status} and cannot be resumed")]
    NotResumable {
        run_id: String,
        status: PipelineStatus,
    },

    #[error("Run {0} was force-failed by an operator")]
    Cancelled(String),

    #[error("Pipeline definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Pipeline definition is inactive: {0}")]
    DefinitionInactive(String),

    #[error(transparent)]
    Stage(#[from] StageExecutionError),
}

impl OrchestratorError {
    /// Whether a supervising caller may deliver the same job again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Stage(err) => err.retryable,
            Self::Store(StoreError::Sqlite(_)) | Self::Store(StoreError::LockPoisoned) => true,
            _ => false,
        }
    }
}
