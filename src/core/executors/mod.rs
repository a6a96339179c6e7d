//! Stage executors.
//!
//! Each executor wraps one collaborator call and converts its outcome into
//! the stage's result type. Executors do not fail across their boundary:
//! collaborator errors come back as entries in the result's `errors` list,
//! with `fatal` set when retrying cannot help.

pub mod analyze;
pub mod check;
pub mod ingest;
pub mod notify;

use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::Collaborators;
use crate::domain::{Stage, StageContext, StageOutput};

pub use analyze::AnalyzeExecutor;
pub use check::CheckExecutor;
pub use ingest::IngestExecutor;
pub use notify::NotifyExecutor;

/// Executes one stage of the fixed pipeline
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Stage this executor handles
    fn stage(&self) -> Stage;

    /// Human-readable executor name (shown by dry runs)
    fn name(&self) -> &str;

    async fn execute(&self, ctx: StageContext) -> StageOutput;
}

/// Settings shared by the built-in executors
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Replace analyze provider failures with a degraded result
    pub fallback_enabled: bool,

    /// Notification driver used when the payload names none
    pub default_driver: String,

    /// Driver config merged under the payload's `notify_config`
    pub default_notify_config: serde_json::Value,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            fallback_enabled: true,
            default_driver: "log".to_string(),
            default_notify_config: serde_json::json!({}),
        }
    }
}

/// One executor per stage
#[derive(Clone)]
pub struct ExecutorSet {
    ingest: Arc<dyn StageExecutor>,
    check: Arc<dyn StageExecutor>,
    analyze: Arc<dyn StageExecutor>,
    notify: Arc<dyn StageExecutor>,
}

impl ExecutorSet {
    /// Built-in executors over the given collaborators
    pub fn from_collaborators(collaborators: &Collaborators, settings: &ExecutorSettings) -> Self {
        Self {
            ingest: Arc::new(IngestExecutor::new(collaborators.ingestor.clone())),
            check: Arc::new(CheckExecutor::new(collaborators.diagnostics.clone())),
            analyze: Arc::new(AnalyzeExecutor::new(
                collaborators.providers.clone(),
                settings.fallback_enabled,
            )),
            notify: Arc::new(NotifyExecutor::new(
                collaborators.drivers.clone(),
                settings.default_driver.clone(),
                settings.default_notify_config.clone(),
            )),
        }
    }

    /// Replace the executor for `executor.stage()`
    pub fn with_executor(mut self, executor: Arc<dyn StageExecutor>) -> Self {
        match executor.stage() {
            Stage::Ingest => self.ingest = executor,
            Stage::Check => self.check = executor,
            Stage::Analyze => self.analyze = executor,
            Stage::Notify => self.notify = executor,
        }
        self
    }

    pub fn get(&self, stage: Stage) -> &Arc<dyn StageExecutor> {
        match stage {
            Stage::Ingest => &self.ingest,
            Stage::Check => &self.check,
            Stage::Analyze => &self.analyze,
            Stage::Notify => &self.notify,
        }
    }
}

/// Overlay `overrides` onto an object payload (non-objects are replaced)
pub(crate) fn merge_objects(base: &serde_json::Value, overrides: &serde_json::Value) -> serde_json::Value {
    match (base, overrides) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overrides)) => {
            let mut merged = base.clone();
            for (key, value) in overrides {
                let next = match merged.get(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_objects(existing, value)
                    }
                    _ => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            serde_json::Value::Object(merged)
        }
        (base, serde_json::Value::Null) => base.clone(),
        (_, overrides) => overrides.clone(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;

    use crate::domain::StageContext;

    pub fn context(payload: serde_json::Value) -> StageContext {
        StageContext {
            trace_id: "trace-1".to_string(),
            run_id: "run-1".to_string(),
            incident_id: None,
            attempt: 1,
            environment: "staging".to_string(),
            source: "test".to_string(),
            alert_fingerprint: "fp-1".to_string(),
            payload,
            previous_results: BTreeMap::new(),
        }
    }
}
