//! Stage inputs and outputs.
//!
//! `StageContext` is handed to every executor by value; each executor returns
//! its own result type. Results serialize to the JSON persisted as the stage's
//! output snapshot and printed by the CLI.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::status::Stage;

/// Input passed to each stage executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageContext {
    pub trace_id: String,
    pub run_id: String,
    pub incident_id: Option<i64>,
    pub attempt: u32,
    pub environment: String,
    pub source: String,
    pub alert_fingerprint: String,
    pub payload: serde_json::Value,

    /// Outputs of earlier stages keyed by `Stage::result_key`
    #[serde(default)]
    pub previous_results: BTreeMap<String, serde_json::Value>,
}

impl StageContext {
    /// String field from the trigger payload
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    pub fn previous(&self, stage: Stage) -> Option<&serde_json::Value> {
        self.previous_results.get(stage.result_key())
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Output of the INGEST stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestResult {
    pub alerts_created: u32,
    pub alerts_updated: u32,
    pub alerts_resolved: u32,
    pub incidents_created: u32,
    pub incidents_updated: u32,
    pub incident_id: Option<i64>,
    pub alert_fingerprint: Option<String>,
    pub severity: Option<String>,
    pub errors: Vec<String>,
    /// Set when retrying cannot help (e.g. unknown alert driver)
    #[serde(skip_serializing_if = "is_false")]
    pub fatal: bool,
    pub duration_ms: u64,
}

impl IngestResult {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn alerts_touched(&self) -> u32 {
        self.alerts_created + self.alerts_updated + self.alerts_resolved
    }
}

/// Output of the CHECK stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckResult {
    pub checks_run: u32,
    pub checks_passed: u32,
    pub checks_failed: u32,
    pub failed_checks: Vec<String>,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub fatal: bool,
    pub duration_ms: u64,
}

impl CheckResult {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Priority of a recommendation, ordered from lowest to highest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl RecommendationPriority {
    /// Notification severity for this priority
    pub fn severity(&self) -> &'static str {
        match self {
            Self::Low => "info",
            Self::Medium => "warning",
            Self::High => "error",
            Self::Critical => "critical",
        }
    }
}

/// One recommendation produced by a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(rename = "type")]
    pub rec_type: String,
    #[serde(default)]
    pub priority: RecommendationPriority,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Output of the ANALYZE stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzeResult {
    pub provider: Option<String>,
    pub recommendations: Vec<Recommendation>,
    pub confidence: f64,
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub fatal: bool,
    pub duration_ms: u64,
}

impl AnalyzeResult {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Highest priority among the recommendations
    pub fn top_priority(&self) -> Option<RecommendationPriority> {
        self.recommendations.iter().map(|r| r.priority).max()
    }
}

/// One delivery attempt made by the NOTIFY stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub driver: String,
    pub channel: String,
    pub status: String,
    pub provider_id: Option<String>,
}

/// Output of the NOTIFY stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyResult {
    pub driver: Option<String>,
    pub severity: Option<String>,
    pub notifications_sent: u32,
    pub notifications_failed: u32,
    pub deliveries: Vec<Delivery>,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub fatal: bool,
    pub duration_ms: u64,
}

impl NotifyResult {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Result of any stage, as returned by an executor
#[derive(Debug, Clone)]
pub enum StageOutput {
    Ingest(IngestResult),
    Check(CheckResult),
    Analyze(AnalyzeResult),
    Notify(NotifyResult),
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Ingest(_) => Stage::Ingest,
            Self::Check(_) => Stage::Check,
            Self::Analyze(_) => Stage::Analyze,
            Self::Notify(_) => Stage::Notify,
        }
    }

    pub fn errors(&self) -> &[String] {
        match self {
            Self::Ingest(r) => &r.errors,
            Self::Check(r) => &r.errors,
            Self::Analyze(r) => &r.errors,
            Self::Notify(r) => &r.errors,
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors().is_empty()
    }

    /// Whether a failed result is worth another attempt
    pub fn retryable(&self) -> bool {
        let fatal = match self {
            Self::Ingest(r) => r.fatal,
            Self::Check(r) => r.fatal,
            Self::Analyze(r) => r.fatal,
            Self::Notify(r) => r.fatal,
        };
        !fatal
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            Self::Ingest(r) => r.duration_ms,
            Self::Check(r) => r.duration_ms,
            Self::Analyze(r) => r.duration_ms,
            Self::Notify(r) => r.duration_ms,
        }
    }

    pub fn set_duration_ms(&mut self, duration_ms: u64) {
        match self {
            Self::Ingest(r) => r.duration_ms = duration_ms,
            Self::Check(r) => r.duration_ms = duration_ms,
            Self::Analyze(r) => r.duration_ms = duration_ms,
            Self::Notify(r) => r.duration_ms = duration_ms,
        }
    }

    /// Serialize for persistence and downstream stages
    pub fn to_json(&self) -> serde_json::Value {
        let value = match self {
            Self::Ingest(r) => serde_json::to_value(r),
            Self::Check(r) => serde_json::to_value(r),
            Self::Analyze(r) => serde_json::to_value(r),
            Self::Notify(r) => serde_json::to_value(r),
        };
        value.unwrap_or(serde_json::Value::Null)
    }

    /// Rebuild a stage result from a persisted snapshot
    pub fn from_snapshot(stage: Stage, snapshot: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let snapshot = snapshot.clone();
        Ok(match stage {
            Stage::Ingest => Self::Ingest(serde_json::from_value(snapshot)?),
            Stage::Check => Self::Check(serde_json::from_value(snapshot)?),
            Stage::Analyze => Self::Analyze(serde_json::from_value(snapshot)?),
            Stage::Notify => Self::Notify(serde_json::from_value(snapshot)?),
        })
    }
}

/// Tagged failure of one stage, carried out of the retry loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{stage} failed ({error_type}): {}", errors.join("; "))]
pub struct StageExecutionError {
    /// Stage name or node id
    pub stage: String,
    pub error_type: String,
    pub errors: Vec<String>,
    pub retryable: bool,
}

impl StageExecutionError {
    pub fn new(stage: impl Into<String>, errors: Vec<String>, retryable: bool) -> Self {
        Self {
            stage: stage.into(),
            error_type: "StageExecutionError".to_string(),
            errors,
            retryable,
        }
    }

    /// Wrap an unexpected error (store failure, bad snapshot, ...)
    pub fn unexpected(stage: impl Into<String>, error_type: impl Into<String>, message: String) -> Self {
        Self {
            stage: stage.into(),
            error_type: error_type.into(),
            errors: vec![message],
            retryable: false,
        }
    }

    pub fn message(&self) -> String {
        self.errors.join("; ")
    }
}

/// Terminal outcome of a fixed pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineOutcome {
    Completed,
    Failed,
}

impl PipelineOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// Aggregate result of a fixed pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub trace_id: String,
    pub run_id: String,
    pub status: PipelineOutcome,
    pub stages_completed: Vec<Stage>,
    /// Stages whose persisted output was reused on resume
    pub stages_reused: Vec<Stage>,
    pub incident_id: Option<i64>,
    pub alert_fingerprint: String,
    pub fallback_used: bool,
    /// Stage outputs keyed by `Stage::result_key`
    pub results: BTreeMap<String, serde_json::Value>,
    pub error: Option<StageExecutionError>,
    pub duration_ms: u64,
}

impl PipelineResult {
    pub fn is_completed(&self) -> bool {
        self.status == PipelineOutcome::Completed
    }

    /// Surface a FAILED run as an error for supervising callers
    pub fn into_result(self) -> Result<Self, StageExecutionError> {
        match (self.status, self.error.clone()) {
            (PipelineOutcome::Failed, Some(err)) => Err(err),
            (PipelineOutcome::Failed, None) => Err(StageExecutionError::unexpected(
                "pipeline",
                "PipelineFailed",
                format!("Run {} failed", self.run_id),
            )),
            _ => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_has_errors() {
        let mut result = CheckResult::default();
        assert!(!result.has_errors());
        result.errors.push("checker crashed".to_string());
        assert!(result.has_errors());
    }

    #[test]
    fn test_fatal_flag_controls_retryable() {
        let output = StageOutput::Notify(NotifyResult {
            errors: vec!["Notify error: unknown driver".to_string()],
            fatal: true,
            ..Default::default()
        });
        assert!(output.has_errors());
        assert!(!output.retryable());

        let output = StageOutput::Ingest(IngestResult {
            errors: vec!["Ingest error: timeout".to_string()],
            ..Default::default()
        });
        assert!(output.retryable());
    }

    #[test]
    fn test_snapshot_rebuilds_stage_result() {
        let output = StageOutput::Ingest(IngestResult {
            alerts_created: 2,
            incident_id: Some(11),
            alert_fingerprint: Some("fp".to_string()),
            ..Default::default()
        });

        let rebuilt = StageOutput::from_snapshot(Stage::Ingest, &output.to_json()).unwrap();
        match rebuilt {
            StageOutput::Ingest(r) => {
                assert_eq!(r.alerts_created, 2);
                assert_eq!(r.incident_id, Some(11));
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_tolerates_missing_fields() {
        let rebuilt = StageOutput::from_snapshot(Stage::Analyze, &json!({"fallback_used": true})).unwrap();
        match rebuilt {
            StageOutput::Analyze(r) => {
                assert!(r.fallback_used);
                assert!(r.recommendations.is_empty());
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn test_top_priority_and_severity() {
        let rec = |priority| Recommendation {
            rec_type: "investigate".to_string(),
            priority,
            title: "t".to_string(),
            description: String::new(),
            actions: vec![],
            confidence: None,
        };
        let result = AnalyzeResult {
            recommendations: vec![
                rec(RecommendationPriority::Low),
                rec(RecommendationPriority::High),
            ],
            ..Default::default()
        };

        assert_eq!(result.top_priority(), Some(RecommendationPriority::High));
        assert_eq!(RecommendationPriority::High.severity(), "error");
    }

    #[test]
    fn test_into_result_surfaces_failure() {
        let failed = PipelineResult {
            trace_id: "t".to_string(),
            run_id: "r".to_string(),
            status: PipelineOutcome::Failed,
            stages_completed: vec![Stage::Ingest],
            stages_reused: vec![],
            incident_id: None,
            alert_fingerprint: String::new(),
            fallback_used: false,
            results: BTreeMap::new(),
            error: Some(StageExecutionError::new("CHECK", vec!["down".to_string()], true)),
            duration_ms: 5,
        };

        let err = failed.into_result().unwrap_err();
        assert_eq!(err.stage, "CHECK");
        assert!(err.retryable);
        assert_eq!(err.to_string(), "CHECK failed (StageExecutionError): down");
    }
}
