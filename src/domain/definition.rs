//! Pipeline definitions for the definition-driven engine.
//!
//! A definition is a named, versioned JSON document:
//!
//! ```json
//! {
//!   "version": "1",
//!   "defaults": { "max_retries": 3, "timeout_seconds": 300 },
//!   "nodes": [
//!     { "id": "ingest", "type": "ingest" },
//!     { "id": "ctx", "type": "context", "next": "notify" },
//!     { "id": "notify", "type": "notify", "skip_if_errors": ["ctx"] }
//!   ]
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored, versioned workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: i64,

    /// Unique name
    pub name: String,

    pub description: String,

    /// Incremented every time the config changes
    pub version: u32,

    /// Raw config document (validated before execution)
    pub config: serde_json::Value,

    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Typed view of a definition config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionConfig {
    pub version: serde_json::Value,

    #[serde(default)]
    pub defaults: DefinitionDefaults,

    pub nodes: Vec<NodeSpec>,
}

impl DefinitionConfig {
    /// Parse the typed view from a raw config document
    pub fn from_value(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// Run-wide defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionDefaults {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Accepted and stored; execution does not enforce it
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_timeout_seconds() -> u64 {
    300
}

impl Default for DefinitionDefaults {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// One node of a definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,

    #[serde(rename = "type")]
    pub node_type: String,

    #[serde(default = "empty_config")]
    pub config: serde_json::Value,

    /// Validated for referential integrity only; execution follows array order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,

    #[serde(default = "default_required")]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_if_errors: Vec<String>,

    /// Form: "<node_id>.has_errors"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if_condition: Option<String>,
}

fn default_required() -> bool {
    true
}

fn empty_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl NodeSpec {
    /// Node id referenced by `skip_if_condition`, if the condition is well formed
    pub fn condition_target(&self) -> Option<&str> {
        self.skip_if_condition
            .as_deref()
            .map(str::trim)
            .and_then(|c| c.strip_suffix(".has_errors"))
            .filter(|id| !id.is_empty())
    }
}
