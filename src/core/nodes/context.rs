//! `context` node: exposes the run's shared context to later nodes.
//!
//! Output keys: `trace_id`, `incident_id`, `source`, `environment`,
//! `alert_fingerprint`, `payload`. With a `checks` config the node also runs
//! diagnostics and reports them under `checks`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::DiagnosticsRunner;
use crate::core::executors::check::diagnostics_request;
use crate::domain::{NodeContext, NodeResult};

use super::{expect_object, NodeHandler};

pub struct ContextNode {
    diagnostics: Arc<dyn DiagnosticsRunner>,
}

impl ContextNode {
    pub fn new(diagnostics: Arc<dyn DiagnosticsRunner>) -> Self {
        Self { diagnostics }
    }
}

#[async_trait]
impl NodeHandler for ContextNode {
    fn node_type(&self) -> &str {
        "context"
    }

    fn validate_config(&self, config: &serde_json::Value) -> Vec<String> {
        let mut errors = Vec::new();
        expect_object(config, "checks", &mut errors);
        errors
    }

    async fn execute(&self, ctx: &NodeContext, config: &serde_json::Value) -> NodeResult {
        let mut output = serde_json::Map::new();
        output.insert("trace_id".to_string(), ctx.trace_id.clone().into());
        output.insert("incident_id".to_string(), ctx.incident_id.into());
        output.insert("source".to_string(), ctx.source.clone().into());
        output.insert("environment".to_string(), ctx.environment.clone().into());
        output.insert("alert_fingerprint".to_string(), ctx.alert_fingerprint.clone().into());
        output.insert("payload".to_string(), ctx.payload.clone());

        let mut errors = Vec::new();
        if let Some(checks) = config.get("checks") {
            let request = diagnostics_request(&serde_json::json!({ "checks": checks }));
            match self.diagnostics.run(&request).await {
                Ok(report) => {
                    errors.extend(report.errors.iter().map(|e| format!("Check error: {}", e)));
                    output.insert(
                        "checks".to_string(),
                        serde_json::to_value(&report).unwrap_or(serde_json::Value::Null),
                    );
                    output.insert("failed_checks".to_string(), report.failed_checks.into());
                }
                Err(e) => errors.push(format!("Check error: {:#}", e)),
            }
        }

        NodeResult { output, errors }
    }
}
