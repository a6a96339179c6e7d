//! Pipeline run record.
//!
//! A PipelineRun is the durable audit record of one triggered pipeline. The
//! orchestrator mutates it at every stage boundary and persists it before the
//! next stage starts; it is never deleted by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::{PipelineStatus, Stage, TransitionError};

/// One triggered pipeline execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Database row id (0 until persisted)
    pub id: i64,

    /// Correlation id shared by every run of one logical trigger
    pub trace_id: String,

    /// Globally unique run id
    pub run_id: String,

    pub status: PipelineStatus,

    pub current_stage: Option<Stage>,

    /// Attempts made across all stages
    pub total_attempts: u32,

    pub max_retries: u32,

    pub source: String,

    pub environment: String,

    pub alert_fingerprint: String,

    pub incident_id: Option<i64>,

    /// Name and version of the definition for definition-driven runs
    pub definition_name: Option<String>,
    pub definition_version: Option<u32>,

    /// Redacted trigger payload, replayed when a resume supplies none
    pub trigger_payload: Option<serde_json::Value>,

    /// Redacted output references, one per stage
    pub ingest_output: Option<serde_json::Value>,
    pub check_output: Option<serde_json::Value>,
    pub analyze_output: Option<serde_json::Value>,
    pub notify_output: Option<serde_json::Value>,

    pub analyze_fallback_used: bool,

    pub last_error_type: Option<String>,
    pub last_error_message: Option<String>,
    pub last_error_retryable: Option<bool>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    pub total_duration_ms: Option<u64>,
}

impl PipelineRun {
    /// Create a new PENDING run
    pub fn new(
        trace_id: impl Into<String>,
        source: impl Into<String>,
        environment: impl Into<String>,
        alert_fingerprint: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            trace_id: trace_id.into(),
            run_id: Uuid::new_v4().to_string(),
            status: PipelineStatus::Pending,
            current_stage: None,
            total_attempts: 0,
            max_retries,
            source: source.into(),
            environment: environment.into(),
            alert_fingerprint: alert_fingerprint.into(),
            incident_id: None,
            definition_name: None,
            definition_version: None,
            trigger_payload: None,
            ingest_output: None,
            check_output: None,
            analyze_output: None,
            notify_output: None,
            analyze_fallback_used: false,
            last_error_type: None,
            last_error_message: None,
            last_error_retryable: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            total_duration_ms: None,
        }
    }

    /// Tag this run as driven by a pipeline definition
    pub fn with_definition(mut self, name: impl Into<String>, version: u32) -> Self {
        self.definition_name = Some(name.into());
        self.definition_version = Some(version);
        self
    }

    pub fn with_trigger_payload(mut self, payload: serde_json::Value) -> Self {
        self.trigger_payload = Some(payload);
        self
    }

    pub fn is_definition_run(&self) -> bool {
        self.definition_name.is_some()
    }

    /// Whether an update may move a persisted run from `from` to `to`.
    ///
    /// Same-status updates carry counters and references. Definition runs
    /// have no fixed stages and finish straight from PENDING to NOTIFIED.
    pub fn transition_allowed(&self, from: PipelineStatus, to: PipelineStatus) -> bool {
        if from == to {
            return true;
        }
        if self.is_definition_run() && from == PipelineStatus::Pending && to == PipelineStatus::Notified {
            return true;
        }
        from.can_transition_to(to)
    }

    /// Move to a new status, enforcing the state machine
    pub fn transition(&mut self, to: PipelineStatus) -> Result<(), TransitionError> {
        if !self.transition_allowed(self.status, to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a successful stage and advance the run to its status
    pub fn advance(&mut self, stage: Stage) -> Result<(), TransitionError> {
        self.transition(stage.completed_status())?;
        self.current_stage = Some(stage);
        Ok(())
    }

    /// Store a redacted output reference for a stage
    pub fn set_output(&mut self, stage: Stage, output: serde_json::Value) {
        match stage {
            Stage::Ingest => self.ingest_output = Some(output),
            Stage::Check => self.check_output = Some(output),
            Stage::Analyze => self.analyze_output = Some(output),
            Stage::Notify => self.notify_output = Some(output),
        }
    }

    pub fn output(&self, stage: Stage) -> Option<&serde_json::Value> {
        match stage {
            Stage::Ingest => self.ingest_output.as_ref(),
            Stage::Check => self.check_output.as_ref(),
            Stage::Analyze => self.analyze_output.as_ref(),
            Stage::Notify => self.notify_output.as_ref(),
        }
    }

    /// Mark the run FAILED with the last error preserved
    pub fn fail(
        &mut self,
        error_type: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Result<(), TransitionError> {
        self.transition(PipelineStatus::Failed)?;
        self.last_error_type = Some(error_type.into());
        self.last_error_message = Some(message.into());
        self.last_error_retryable = Some(retryable);
        self.completed_at = Some(Utc::now());
        self.record_duration();
        Ok(())
    }

    /// Finish a definition-driven run successfully
    pub fn complete_definition_run(&mut self) -> Result<(), TransitionError> {
        self.transition(PipelineStatus::Notified)?;
        self.current_stage = None;
        self.completed_at = Some(Utc::now());
        self.record_duration();
        Ok(())
    }

    /// Record total duration from `started_at` to now
    pub fn record_duration(&mut self) {
        if let Some(started) = self.started_at {
            let elapsed = Utc::now().signed_duration_since(started);
            self.total_duration_ms = Some(elapsed.num_milliseconds().max(0) as u64);
        }
    }

    /// Whether an operator force-failed this run out of band
    pub fn is_force_failed(&self) -> bool {
        self.status == PipelineStatus::Failed
            && self.last_error_type.as_deref() == Some(FORCE_FAILED_ERROR)
    }
}

/// Error type recorded when an operator force-fails a run
pub const FORCE_FAILED_ERROR: &str = "ForceFailed";

/// Error type recorded when an operator fails an abandoned run so it can be resumed
pub const STALE_RUN_ERROR: &str = "StaleRun";

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run() -> PipelineRun {
        PipelineRun::new("trace-1", "cli", "prod", "fp-1", 3)
    }

    #[test]
    fn test_run_creation() {
        let run = sample_run();

        assert_eq!(run.status, PipelineStatus::Pending);
        assert_eq!(run.trace_id, "trace-1");
        assert!(Uuid::parse_str(&run.run_id).is_ok());
        assert!(run.current_stage.is_none());
        assert!(!run.is_definition_run());
    }

    #[test]
    fn test_advance_through_stages() {
        let mut run = sample_run();

        for stage in Stage::ALL {
            run.advance(stage).unwrap();
        }

        assert_eq!(run.status, PipelineStatus::Notified);
        assert_eq!(run.current_stage, Some(Stage::Notify));
    }

    #[test]
    fn test_advance_cannot_skip_a_stage() {
        let mut run = sample_run();
        run.advance(Stage::Ingest).unwrap();

        let err = run.advance(Stage::Analyze).unwrap_err();
        assert_eq!(err.from, PipelineStatus::Ingested);
        assert_eq!(run.status, PipelineStatus::Ingested);
    }

    #[test]
    fn test_fail_preserves_error() {
        let mut run = sample_run();
        run.advance(Stage::Ingest).unwrap();
        run.fail("StageExecutionError", "boom", true).unwrap();

        assert_eq!(run.status, PipelineStatus::Failed);
        assert_eq!(run.last_error_message.as_deref(), Some("boom"));
        assert_eq!(run.last_error_retryable, Some(true));
        assert!(run.completed_at.is_some());
        assert!(!run.is_force_failed());
    }

    #[test]
    fn test_definition_run_finishes_from_pending() {
        let mut run = sample_run().with_definition("triage", 2);
        run.started_at = Some(Utc::now());
        run.complete_definition_run().unwrap();
        assert_eq!(run.status, PipelineStatus::Notified);
        assert!(run.total_duration_ms.is_some());

        let mut fixed = sample_run();
        assert!(fixed.transition(PipelineStatus::Notified).is_err());
    }
}
