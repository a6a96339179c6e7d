//! Stage execution rows.
//!
//! One row per (run, stage, attempt). Rows are created immediately before an
//! attempt, updated once on completion and never changed after that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::StageStatus;

/// A single execution attempt of a stage (or of a definition node)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    /// Database row id (0 until persisted)
    pub id: i64,

    /// Row id of the owning PipelineRun
    pub pipeline_run_id: i64,

    /// Stage name (`INGEST`...) or node id for definition runs
    pub stage: String,

    pub status: StageStatus,

    /// 1-based attempt number
    pub attempt: u32,

    /// Format: "{run_id}:{stage}:{attempt}"
    pub idempotency_key: String,

    /// Redacted JSON output of the attempt
    pub output_snapshot: Option<serde_json::Value>,

    pub error_type: Option<String>,
    pub error_message: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl StageExecution {
    /// Create a PENDING execution for one attempt
    pub fn new(pipeline_run_id: i64, run_id: &str, stage: impl Into<String>, attempt: u32) -> Self {
        let stage = stage.into();
        Self {
            id: 0,
            pipeline_run_id,
            idempotency_key: idempotency_key(run_id, &stage, attempt),
            stage,
            status: StageStatus::Pending,
            attempt,
            output_snapshot: None,
            error_type: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = StageStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_succeeded(&mut self, snapshot: serde_json::Value, duration_ms: u64) {
        self.status = StageStatus::Succeeded;
        self.output_snapshot = Some(snapshot);
        self.finish(duration_ms);
    }

    pub fn mark_failed(
        &mut self,
        error_type: impl Into<String>,
        message: impl Into<String>,
        snapshot: Option<serde_json::Value>,
        duration_ms: u64,
    ) {
        self.status = StageStatus::Failed;
        self.error_type = Some(error_type.into());
        self.error_message = Some(message.into());
        self.output_snapshot = snapshot;
        self.finish(duration_ms);
    }

    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.status = StageStatus::Skipped;
        self.error_message = Some(reason.into());
        self.finish(0);
    }

    fn finish(&mut self, duration_ms: u64) {
        self.completed_at = Some(Utc::now());
        self.duration_ms = Some(duration_ms);
    }
}

/// Build the idempotency key for one attempt
pub fn idempotency_key(run_id: &str, stage: &str, attempt: u32) -> String {
    format!("{}:{}:{}", run_id, stage, attempt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_format() {
        let key = idempotency_key("550e8400-e29b-41d4-a716-446655440000", "CHECK", 2);
        assert_eq!(key, "550e8400-e29b-41d4-a716-446655440000:CHECK:2");
    }

    #[test]
    fn test_new_execution_carries_key() {
        let exec = StageExecution::new(7, "run-a", "INGEST", 1);

        assert_eq!(exec.idempotency_key, "run-a:INGEST:1");
        assert_eq!(exec.status, StageStatus::Pending);
        assert_eq!(exec.pipeline_run_id, 7);
    }

    #[test]
    fn test_lifecycle_marks() {
        let mut exec = StageExecution::new(1, "run-a", "ANALYZE", 1);
        exec.mark_running();
        assert!(exec.started_at.is_some());

        exec.mark_failed("StageExecutionError", "provider down", None, 42);
        assert_eq!(exec.status, StageStatus::Failed);
        assert_eq!(exec.duration_ms, Some(42));
        assert!(exec.status.is_terminal());
    }
}
