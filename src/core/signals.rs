//! Pipeline signals.
//!
//! Orchestrators report progress as [`Signal`]s tagged with [`SignalTags`].
//! The sink is a [`SignalEmitter`] chosen once at startup (see
//! [`build_emitter`]) and handed to each orchestrator at construction.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{PipelineRun, UnknownVariant};

/// Correlation tags attached to every signal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalTags {
    pub trace_id: String,
    pub run_id: String,
    /// Stage name or node id; empty for run-level signals
    pub stage: String,
    pub incident_id: Option<i64>,
    pub source: String,
    pub alert_fingerprint: String,
    pub environment: String,
    pub attempt: u32,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SignalTags {
    /// Run-level tags
    pub fn for_run(run: &PipelineRun) -> Self {
        Self {
            trace_id: run.trace_id.clone(),
            run_id: run.run_id.clone(),
            stage: String::new(),
            incident_id: run.incident_id,
            source: run.source.clone(),
            alert_fingerprint: run.alert_fingerprint.clone(),
            environment: run.environment.clone(),
            attempt: 0,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = stage.into();
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// Events emitted while a pipeline runs
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    PipelineStarted,
    PipelineCompleted {
        status: String,
        duration_ms: u64,
    },
    StageStarted,
    StageSucceeded {
        duration_ms: u64,
    },
    StageFailed {
        error_type: String,
        message: String,
        retryable: bool,
        duration_ms: u64,
    },
    StageRetrying {
        next_attempt: u32,
        delay_ms: u64,
    },
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PipelineStarted => "pipeline.started",
            Self::PipelineCompleted { .. } => "pipeline.completed",
            Self::StageStarted => "pipeline.stage.started",
            Self::StageSucceeded { .. } => "pipeline.stage.succeeded",
            Self::StageFailed { .. } => "pipeline.stage.failed",
            Self::StageRetrying { .. } => "pipeline.stage.retrying",
        }
    }

    /// Signal-specific fields as JSON
    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::PipelineStarted | Self::StageStarted => serde_json::json!({}),
            Self::PipelineCompleted {
                status,
                duration_ms,
            } => serde_json::json!({ "status": status, "duration_ms": duration_ms }),
            Self::StageSucceeded { duration_ms } => serde_json::json!({ "duration_ms": duration_ms }),
            Self::StageFailed {
                error_type,
                message,
                retryable,
                duration_ms,
            } => serde_json::json!({
                "error_type": error_type,
                "error_message": message,
                "retryable": retryable,
                "duration_ms": duration_ms,
            }),
            Self::StageRetrying {
                next_attempt,
                delay_ms,
            } => serde_json::json!({ "next_attempt": next_attempt, "delay_ms": delay_ms }),
        }
    }

    fn duration_ms(&self) -> Option<u64> {
        match self {
            Self::PipelineCompleted { duration_ms, .. }
            | Self::StageSucceeded { duration_ms }
            | Self::StageFailed { duration_ms, .. } => Some(*duration_ms),
            _ => None,
        }
    }
}

/// Observability sink
pub trait SignalEmitter: Send + Sync {
    /// Backend name
    fn name(&self) -> &str;

    fn emit(&self, signal: &Signal, tags: &SignalTags);
}

/// Structured-log backend (default)
#[derive(Debug, Default)]
pub struct LogSignalEmitter;

impl SignalEmitter for LogSignalEmitter {
    fn name(&self) -> &str {
        "log"
    }

    fn emit(&self, signal: &Signal, tags: &SignalTags) {
        let details = signal.details();
        let extra = serde_json::Value::Object(tags.extra.clone());

        match signal {
            Signal::StageFailed { .. } | Signal::StageRetrying { .. } => warn!(
                signal = signal.name(),
                trace_id = %tags.trace_id,
                run_id = %tags.run_id,
                stage = %tags.stage,
                incident_id = ?tags.incident_id,
                source = %tags.source,
                alert_fingerprint = %tags.alert_fingerprint,
                environment = %tags.environment,
                attempt = tags.attempt,
                %details,
                %extra,
                "{}",
                signal.name()
            ),
            _ => info!(
                signal = signal.name(),
                trace_id = %tags.trace_id,
                run_id = %tags.run_id,
                stage = %tags.stage,
                incident_id = ?tags.incident_id,
                source = %tags.source,
                alert_fingerprint = %tags.alert_fingerprint,
                environment = %tags.environment,
                attempt = tags.attempt,
                %details,
                %extra,
                "{}",
                signal.name()
            ),
        }
    }
}

/// A signal captured by [`MetricsSignalEmitter`]
#[derive(Debug, Clone)]
pub struct RecordedSignal {
    pub name: &'static str,
    pub signal: Signal,
    pub tags: SignalTags,
}

#[derive(Debug, Default)]
struct MetricsState {
    counters: HashMap<String, u64>,
    timers: HashMap<String, Vec<u64>>,
    events: Vec<RecordedSignal>,
}

/// Counter/timer backend kept in memory
#[derive(Debug, Default)]
pub struct MetricsSignalEmitter {
    state: Mutex<MetricsState>,
}

impl MetricsSignalEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter (0 if never incremented)
    pub fn counter(&self, name: &str) -> u64 {
        self.state
            .lock()
            .map(|s| s.counters.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Recorded durations for a timer
    pub fn timings(&self, name: &str) -> Vec<u64> {
        self.state
            .lock()
            .map(|s| s.timers.get(name).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Every signal seen, in emission order
    pub fn events(&self) -> Vec<RecordedSignal> {
        self.state.lock().map(|s| s.events.clone()).unwrap_or_default()
    }

    /// Names of every signal seen, in emission order
    pub fn event_names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.name).collect()
    }
}

impl SignalEmitter for MetricsSignalEmitter {
    fn name(&self) -> &str {
        "metrics"
    }

    fn emit(&self, signal: &Signal, tags: &SignalTags) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        *state.counters.entry(signal.name().to_string()).or_default() += 1;
        if let Signal::PipelineCompleted { status, .. } = signal {
            let key = format!("{}.{}", signal.name(), status.to_ascii_lowercase());
            *state.counters.entry(key).or_default() += 1;
        }

        if let Some(duration_ms) = signal.duration_ms() {
            let key = if tags.stage.is_empty() {
                format!("{}.duration_ms", signal.name())
            } else {
                format!("{}.{}.duration_ms", signal.name(), tags.stage)
            };
            state.timers.entry(key).or_default().push(duration_ms);
        }

        state.events.push(RecordedSignal {
            name: signal.name(),
            signal: signal.clone(),
            tags: tags.clone(),
        });
    }
}

/// Discards every signal
#[derive(Debug, Default)]
pub struct NoopSignalEmitter;

impl SignalEmitter for NoopSignalEmitter {
    fn name(&self) -> &str {
        "none"
    }

    fn emit(&self, _signal: &Signal, _tags: &SignalTags) {}
}

/// Configured signal backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalBackend {
    #[default]
    Log,
    Metrics,
    None,
}

impl fmt::Display for SignalBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Log => "log",
            Self::Metrics => "metrics",
            Self::None => "none",
        };
        f.write_str(name)
    }
}

impl FromStr for SignalBackend {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "metrics" => Ok(Self::Metrics),
            "none" | "noop" => Ok(Self::None),
            _ => Err(UnknownVariant {
                kind: "signal backend",
                value: s.to_string(),
            }),
        }
    }
}

/// Build the emitter for a backend; called once at startup
pub fn build_emitter(backend: SignalBackend) -> Arc<dyn SignalEmitter> {
    match backend {
        SignalBackend::Log => Arc::new(LogSignalEmitter),
        SignalBackend::Metrics => Arc::new(MetricsSignalEmitter::new()),
        SignalBackend::None => Arc::new(NoopSignalEmitter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> SignalTags {
        SignalTags {
            trace_id: "t".to_string(),
            run_id: "r".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(Signal::PipelineStarted.name(), "pipeline.started");
        assert_eq!(Signal::StageStarted.name(), "pipeline.stage.started");
        assert_eq!(
            Signal::StageRetrying {
                next_attempt: 2,
                delay_ms: 0
            }
            .name(),
            "pipeline.stage.retrying"
        );
    }

    #[test]
    fn test_metrics_counters_and_timers() {
        let metrics = MetricsSignalEmitter::new();

        metrics.emit(&Signal::StageStarted, &tags().with_stage("INGEST"));
        metrics.emit(
            &Signal::StageSucceeded { duration_ms: 12 },
            &tags().with_stage("INGEST"),
        );
        metrics.emit(
            &Signal::PipelineCompleted {
                status: "COMPLETED".to_string(),
                duration_ms: 40,
            },
            &tags(),
        );

        assert_eq!(metrics.counter("pipeline.stage.started"), 1);
        assert_eq!(metrics.counter("pipeline.completed.completed"), 1);
        assert_eq!(
            metrics.timings("pipeline.stage.succeeded.INGEST.duration_ms"),
            vec![12]
        );
        assert_eq!(metrics.timings("pipeline.completed.duration_ms"), vec![40]);
        assert_eq!(
            metrics.event_names(),
            vec![
                "pipeline.stage.started",
                "pipeline.stage.succeeded",
                "pipeline.completed"
            ]
        );
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("log".parse::<SignalBackend>().unwrap(), SignalBackend::Log);
        assert_eq!("METRICS".parse::<SignalBackend>().unwrap(), SignalBackend::Metrics);
        assert!("statsd".parse::<SignalBackend>().is_err());

        assert_eq!(build_emitter(SignalBackend::None).name(), "none");
    }

    #[test]
    fn test_failed_details() {
        let signal = Signal::StageFailed {
            error_type: "StageExecutionError".to_string(),
            message: "boom".to_string(),
            retryable: true,
            duration_ms: 3,
        };
        let details = signal.details();
        assert_eq!(details["error_message"], "boom");
        assert_eq!(details["retryable"], true);
    }
}
