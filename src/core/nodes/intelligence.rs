//! `intelligence` node: runs the ANALYZE executor.
//!
//! Config: `{ "provider": "local" }` (optional). Earlier ingest and check
//! outputs are found by shape, so the node works after any node ids.

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::executors::{merge_objects, StageExecutor};
use crate::domain::{NodeContext, NodeResult, Stage};

use super::{config_str, expect_string, run_stage_executor, NodeHandler};

pub struct IntelligenceNode {
    executor: Arc<dyn StageExecutor>,
}

impl IntelligenceNode {
    pub fn new(executor: Arc<dyn StageExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl NodeHandler for IntelligenceNode {
    fn node_type(&self) -> &str {
        "intelligence"
    }

    fn validate_config(&self, config: &serde_json::Value) -> Vec<String> {
        let mut errors = Vec::new();
        expect_string(config, "provider", &mut errors);
        errors
    }

    async fn execute(&self, ctx: &NodeContext, config: &serde_json::Value) -> NodeResult {
        let mut previous = Vec::new();
        if let Some(ingest) = ctx.latest_output_with("alerts_created") {
            previous.push((Stage::Ingest, ingest.clone()));
        }
        if let Some(check) = ctx.latest_output_with("failed_checks") {
            previous.push((Stage::Check, check.clone()));
        }

        let payload = match config_str(config, "provider") {
            Some(provider) => merge_objects(&ctx.payload, &serde_json::json!({ "provider": provider })),
            None => ctx.payload.clone(),
        };
        run_stage_executor(&self.executor, ctx, payload, previous).await
    }
}
