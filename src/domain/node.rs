//! Inputs and outputs of definition nodes.

use serde::{Deserialize, Serialize};

use super::results::StageContext;
use super::status::Stage;

/// Shared context handed to each node handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeContext {
    pub trace_id: String,
    pub run_id: String,
    pub node_id: String,
    pub incident_id: Option<i64>,
    pub environment: String,
    pub source: String,
    pub alert_fingerprint: String,
    pub payload: serde_json::Value,

    /// Outputs of earlier nodes keyed by node id, in execution order
    #[serde(default)]
    pub previous_outputs: serde_json::Map<String, serde_json::Value>,
}

impl NodeContext {
    /// Most recent earlier output carrying `key`
    pub fn latest_output_with(&self, key: &str) -> Option<&serde_json::Value> {
        self.previous_outputs.values().rev().find(|v| v.get(key).is_some())
    }

    /// Build the equivalent stage context so node handlers can reuse the
    /// fixed-pipeline executors.
    pub fn to_stage_context(&self, previous: Vec<(Stage, serde_json::Value)>) -> StageContext {
        StageContext {
            trace_id: self.trace_id.clone(),
            run_id: self.run_id.clone(),
            incident_id: self.incident_id,
            attempt: 1,
            environment: self.environment.clone(),
            source: self.source.clone(),
            alert_fingerprint: self.alert_fingerprint.clone(),
            payload: self.payload.clone(),
            previous_results: previous
                .into_iter()
                .map(|(stage, value)| (stage.result_key().to_string(), value))
                .collect(),
        }
    }
}

/// Output of one node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeResult {
    pub output: serde_json::Map<String, serde_json::Value>,
    pub errors: Vec<String>,
}

impl NodeResult {
    pub fn ok(output: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            output,
            errors: Vec::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            output: serde_json::Map::new(),
            errors: vec![error.into()],
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Build a node result from a serialized value (object fields become the output)
    pub fn from_value(value: serde_json::Value, errors: Vec<String>) -> Self {
        let output = match value {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self { output, errors }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "output": self.output,
            "errors": self.errors,
        })
    }
}
