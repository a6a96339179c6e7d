//! Node handlers for definition-driven pipelines.
//!
//! Every node `type` in a definition dispatches to a [`NodeHandler`]
//! registered under that name in a [`NodeRegistry`]. Built-in types:
//!
//! | type           | handler              |
//! |----------------|----------------------|
//! | `ingest`       | [`IngestNode`]       |
//! | `context`      | [`ContextNode`]      |
//! | `intelligence` | [`IntelligenceNode`] |
//! | `notify`       | [`NotifyNode`]       |
//! | `transform`    | [`TransformNode`]    |

pub mod context;
pub mod intelligence;
pub mod ingest;
pub mod notify;
pub mod transform;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::DiagnosticsRunner;
use crate::domain::{NodeContext, NodeResult, Stage, StageOutput};

use super::executors::{ExecutorSet, StageExecutor};

pub use context::ContextNode;
pub use ingest::IngestNode;
pub use intelligence::IntelligenceNode;
pub use notify::NotifyNode;
pub use transform::TransformNode;

/// Handler for one node type
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Type name matched against a node's `type`
    fn node_type(&self) -> &str;

    /// Errors in a node's `config`; empty when valid
    fn validate_config(&self, _config: &serde_json::Value) -> Vec<String> {
        Vec::new()
    }

    async fn execute(&self, ctx: &NodeContext, config: &serde_json::Value) -> NodeResult;
}

/// Registry mapping node types to handlers
#[derive(Default, Clone)]
pub struct NodeRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in node type
    pub fn with_builtin(executors: &ExecutorSet, diagnostics: Arc<dyn DiagnosticsRunner>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(IngestNode::new(executors.get(Stage::Ingest).clone())));
        registry.register(Arc::new(ContextNode::new(diagnostics)));
        registry.register(Arc::new(IntelligenceNode::new(executors.get(Stage::Analyze).clone())));
        registry.register(Arc::new(NotifyNode::new(executors.get(Stage::Notify).clone())));
        registry.register(Arc::new(TransformNode));
        registry
    }

    /// Register a handler, replacing any handler of the same type
    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(handler.node_type().to_string(), handler);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(node_type).cloned()
    }

    pub fn has(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Run a stage executor on behalf of a node and wrap its output
pub(crate) async fn run_stage_executor(
    executor: &Arc<dyn StageExecutor>,
    ctx: &NodeContext,
    payload: serde_json::Value,
    previous: Vec<(Stage, serde_json::Value)>,
) -> NodeResult {
    let mut stage_ctx = ctx.to_stage_context(previous);
    stage_ctx.payload = payload;

    let output: StageOutput = executor.execute(stage_ctx).await;
    NodeResult::from_value(output.to_json(), output.errors().to_vec())
}

/// String field in a node config, if present
pub(crate) fn config_str<'a>(config: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(|v| v.as_str())
}

/// Error unless `config[key]` is absent or a string
pub(crate) fn expect_string(config: &serde_json::Value, key: &str, errors: &mut Vec<String>) {
    if let Some(value) = config.get(key) {
        if !value.is_string() {
            errors.push(format!("'{}' must be a string", key));
        }
    }
}

/// Error unless `config[key]` is absent or an object
pub(crate) fn expect_object(config: &serde_json::Value, key: &str, errors: &mut Vec<String>) {
    if let Some(value) = config.get(key) {
        if !value.is_object() {
            errors.push(format!("'{}' must be an object", key));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Collaborators;
    use crate::core::executors::ExecutorSettings;

    #[test]
    fn test_builtin_registry() {
        let collaborators = Collaborators::local();
        let executors = ExecutorSet::from_collaborators(&collaborators, &ExecutorSettings::default());
        let registry = NodeRegistry::with_builtin(&executors, collaborators.diagnostics.clone());

        assert_eq!(
            registry.types(),
            vec!["context", "ingest", "intelligence", "notify", "transform"]
        );
        assert!(registry.has("notify"));
        assert!(!registry.has("nonexistent"));
        assert!(registry.get("transform").is_some());
    }

    #[test]
    fn test_config_helpers() {
        let config = serde_json::json!({"driver": 3, "checks": {}});
        let mut errors = Vec::new();

        expect_string(&config, "driver", &mut errors);
        expect_object(&config, "checks", &mut errors);
        expect_object(&config, "missing", &mut errors);

        assert_eq!(errors, vec!["'driver' must be a string".to_string()]);
    }
}
