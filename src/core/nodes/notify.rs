//! `notify` node: runs the NOTIFY executor.
//!
//! Config: `{ "driver": "generic", "config": { "endpoint": "..." } }`, both
//! optional. The message is rendered from the latest earlier output that
//! carries `recommendations`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::executors::{merge_objects, StageExecutor};
use crate::domain::{NodeContext, NodeResult, Stage};

use super::{config_str, expect_object, expect_string, run_stage_executor, NodeHandler};

pub struct NotifyNode {
    executor: Arc<dyn StageExecutor>,
}

impl NotifyNode {
    pub fn new(executor: Arc<dyn StageExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl NodeHandler for NotifyNode {
    fn node_type(&self) -> &str {
        "notify"
    }

    fn validate_config(&self, config: &serde_json::Value) -> Vec<String> {
        let mut errors = Vec::new();
        expect_string(config, "driver", &mut errors);
        expect_object(config, "config", &mut errors);
        errors
    }

    async fn execute(&self, ctx: &NodeContext, config: &serde_json::Value) -> NodeResult {
        let previous = ctx
            .latest_output_with("recommendations")
            .map(|analysis| vec![(Stage::Analyze, analysis.clone())])
            .unwrap_or_default();

        let mut overrides = serde_json::Map::new();
        if let Some(driver) = config_str(config, "driver") {
            overrides.insert("notify_driver".to_string(), driver.into());
        }
        if let Some(driver_config) = config.get("config") {
            overrides.insert("notify_config".to_string(), driver_config.clone());
        }
        let payload = merge_objects(&ctx.payload, &serde_json::Value::Object(overrides));

        run_stage_executor(&self.executor, ctx, payload, previous).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{DriverRegistry, LogDriver, WebhookDriver};
    use crate::core::executors::NotifyExecutor;
    use crate::core::nodes::test_support::node_context;
    use serde_json::json;

    fn node() -> NotifyNode {
        let drivers = DriverRegistry::new()
            .register(Arc::new(LogDriver))
            .register(Arc::new(WebhookDriver::new()));
        NotifyNode::new(Arc::new(NotifyExecutor::new(drivers, "log".to_string(), json!({}))))
    }

    #[tokio::test]
    async fn test_notify_without_analysis() {
        let ctx = node_context("notify", json!({}));
        let result = node().execute(&ctx, &json!({})).await;

        assert!(!result.has_errors());
        assert_eq!(result.output["severity"], json!("info"));
        assert_eq!(result.output["notifications_sent"], json!(1));
    }

    #[tokio::test]
    async fn test_severity_from_earlier_analysis() {
        let mut ctx = node_context("notify", json!({}));
        ctx.previous_outputs.insert(
            "ai".to_string(),
            json!({"recommendations": [{"type": "escalate", "priority": "critical", "title": "Page"}]}),
        );

        let result = node().execute(&ctx, &json!({})).await;
        assert_eq!(result.output["severity"], json!("critical"));
    }

    #[tokio::test]
    async fn test_config_selects_driver() {
        let ctx = node_context("notify", json!({}));
        let result = node().execute(&ctx, &json!({"driver": "generic", "config": {}})).await;

        assert!(result.has_errors());
        assert!(result.errors[0].contains("invalid config"));
        assert_eq!(node().validate_config(&json!({"config": "x"})).len(), 1);
    }
}
