//! `ingest` node: runs the INGEST executor.
//!
//! Config: `{ "driver": "generic" }` (optional, overrides the payload hint).
//! The orchestrator propagates an `incident_id` in this node's output to
//! every later node.

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::executors::{merge_objects, StageExecutor};
use crate::domain::{NodeContext, NodeResult};

use super::{config_str, expect_string, run_stage_executor, NodeHandler};

pub struct IngestNode {
    executor: Arc<dyn StageExecutor>,
}

impl IngestNode {
    pub fn new(executor: Arc<dyn StageExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl NodeHandler for IngestNode {
    fn node_type(&self) -> &str {
        "ingest"
    }

    fn validate_config(&self, config: &serde_json::Value) -> Vec<String> {
        let mut errors = Vec::new();
        expect_string(config, "driver", &mut errors);
        errors
    }

    async fn execute(&self, ctx: &NodeContext, config: &serde_json::Value) -> NodeResult {
        let payload = match config_str(config, "driver") {
            Some(driver) => merge_objects(&ctx.payload, &serde_json::json!({ "driver": driver })),
            None => ctx.payload.clone(),
        };
        run_stage_executor(&self.executor, ctx, payload, Vec::new()).await
    }
}
