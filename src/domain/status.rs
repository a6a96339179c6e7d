//! Stage and status enums for the fixed pipeline state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One of the four stages of the fixed incident pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Ingest,
    Check,
    Analyze,
    Notify,
}

impl Stage {
    /// Execution order of the fixed pipeline
    pub const ALL: [Stage; 4] = [Stage::Ingest, Stage::Check, Stage::Analyze, Stage::Notify];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "INGEST",
            Self::Check => "CHECK",
            Self::Analyze => "ANALYZE",
            Self::Notify => "NOTIFY",
        }
    }

    /// Key used for this stage's entry in `previous_results`
    pub fn result_key(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Check => "check",
            Self::Analyze => "analyze",
            Self::Notify => "notify",
        }
    }

    /// Run status reached once this stage succeeds
    pub fn completed_status(&self) -> PipelineStatus {
        match self {
            Self::Ingest => PipelineStatus::Ingested,
            Self::Check => PipelineStatus::Checked,
            Self::Analyze => PipelineStatus::Analyzed,
            Self::Notify => PipelineStatus::Notified,
        }
    }

    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Ingest => Some(Self::Check),
            Self::Check => Some(Self::Analyze),
            Self::Analyze => Some(Self::Notify),
            Self::Notify => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INGEST" => Ok(Self::Ingest),
            "CHECK" => Ok(Self::Check),
            "ANALYZE" => Ok(Self::Analyze),
            "NOTIFY" => Ok(Self::Notify),
            _ => Err(UnknownVariant {
                kind: "stage",
                value: s.to_string(),
            }),
        }
    }
}

/// Status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Pending,
    Ingested,
    Checked,
    Analyzed,
    Notified,
    Failed,
    Retrying,
    Skipped,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Ingested => "INGESTED",
            Self::Checked => "CHECKED",
            Self::Analyzed => "ANALYZED",
            Self::Notified => "NOTIFIED",
            Self::Failed => "FAILED",
            Self::Retrying => "RETRYING",
            Self::Skipped => "SKIPPED",
        }
    }

    /// NOTIFIED and SKIPPED are final; FAILED can still move to RETRYING.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Notified | Self::Skipped)
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Failed | Self::Retrying)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Forward moves go exactly one stage at a time, so a run can never
    /// reach a status for a stage it has not attempted. The only regression
    /// is FAILED -> RETRYING, after which the run restarts at INGESTED.
    pub fn can_transition_to(&self, next: PipelineStatus) -> bool {
        use PipelineStatus::*;

        if next == Failed {
            return !self.is_terminal() && *self != Failed;
        }

        matches!(
            (*self, next),
            (Pending, Ingested)
                | (Pending, Skipped)
                | (Ingested, Checked)
                | (Checked, Analyzed)
                | (Analyzed, Notified)
                | (Failed, Retrying)
                | (Retrying, Ingested)
        )
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "INGESTED" => Ok(Self::Ingested),
            "CHECKED" => Ok(Self::Checked),
            "ANALYZED" => Ok(Self::Analyzed),
            "NOTIFIED" => Ok(Self::Notified),
            "FAILED" => Ok(Self::Failed),
            "RETRYING" => Ok(Self::Retrying),
            "SKIPPED" => Ok(Self::Skipped),
            _ => Err(UnknownVariant {
                kind: "pipeline status",
                value: s.to_string(),
            }),
        }
    }
}

/// Status of a single stage (or node) execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Retrying => "RETRYING",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "RETRYING" => Ok(Self::Retrying),
            "SKIPPED" => Ok(Self::Skipped),
            _ => Err(UnknownVariant {
                kind: "stage status",
                value: s.to_string(),
            }),
        }
    }
}

/// Parse failure for any of the enums above
#[derive(Debug, Clone, Error)]
#[error("Unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Illegal pipeline status move
#[derive(Debug, Clone, Error)]
#[error("Invalid status transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: PipelineStatus,
    pub to: PipelineStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_maps_to_statuses() {
        let statuses: Vec<PipelineStatus> =
            Stage::ALL.iter().map(|s| s.completed_status()).collect();
        assert_eq!(
            statuses,
            vec![
                PipelineStatus::Ingested,
                PipelineStatus::Checked,
                PipelineStatus::Analyzed,
                PipelineStatus::Notified,
            ]
        );
        assert_eq!(Stage::Analyze.next(), Some(Stage::Notify));
        assert_eq!(Stage::Notify.next(), None);
    }

    #[test]
    fn test_forward_transitions_are_single_step() {
        use PipelineStatus::*;

        assert!(Pending.can_transition_to(Ingested));
        assert!(Ingested.can_transition_to(Checked));
        assert!(!Pending.can_transition_to(Checked));
        assert!(!Ingested.can_transition_to(Analyzed));
        assert!(!Checked.can_transition_to(Ingested));
    }

    #[test]
    fn test_failure_and_retry_transitions() {
        use PipelineStatus::*;

        assert!(Checked.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Ingested));
        assert!(Retrying.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Ingested));
        assert!(!Notified.can_transition_to(Failed));
        assert!(!Notified.can_transition_to(Retrying));
    }

    #[test]
    fn test_status_round_trip_through_strings() {
        for status in [
            PipelineStatus::Pending,
            PipelineStatus::Retrying,
            PipelineStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<PipelineStatus>().unwrap(), status);
        }
        assert_eq!("check".parse::<Stage>().unwrap(), Stage::Check);
        assert!("bogus".parse::<StageStatus>().is_err());
    }

    #[test]
    fn test_serde_uses_screaming_case() {
        let json = serde_json::to_string(&Stage::Analyze).unwrap();
        assert_eq!(json, "\"ANALYZE\"");
        let json = serde_json::to_string(&StageStatus::Succeeded).unwrap();
        assert_eq!(json, "\"SUCCEEDED\"");
    }
}
