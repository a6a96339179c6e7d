//! `transform` node: reshapes earlier outputs.
//!
//! ```json
//! { "mappings": { "incident": "ingest.incident_id", "top": "ai.recommendations.0.title" },
//!   "static": { "team": "sre" } }
//! ```
//!
//! A mapping path starts with a node id followed by object keys or array
//! indexes. Missing paths are reported as errors.

use async_trait::async_trait;

use crate::domain::{NodeContext, NodeResult};

use super::{expect_object, NodeHandler};

pub struct TransformNode;

fn resolve_path<'a>(outputs: &'a serde_json::Map<String, serde_json::Value>, path: &str) -> Option<&'a serde_json::Value> {
    let mut segments = path.split('.');
    let mut current = outputs.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[async_trait]
impl NodeHandler for TransformNode {
    fn node_type(&self) -> &str {
        "transform"
    }

    fn validate_config(&self, config: &serde_json::Value) -> Vec<String> {
        let mut errors = Vec::new();
        expect_object(config, "mappings", &mut errors);
        expect_object(config, "static", &mut errors);

        if let Some(mappings) = config.get("mappings").and_then(|m| m.as_object()) {
            for (key, path) in mappings {
                match path.as_str() {
                    Some(p) if !p.is_empty() && !p.split('.').any(str::is_empty) => {}
                    _ => errors.push(format!("mapping '{}' must be a dotted path string", key)),
                }
            }
        }
        errors
    }

    async fn execute(&self, ctx: &NodeContext, config: &serde_json::Value) -> NodeResult {
        let mut output = serde_json::Map::new();
        let mut errors = Vec::new();

        if let Some(statics) = config.get("static").and_then(|s| s.as_object()) {
            for (key, value) in statics {
                output.insert(key.clone(), value.clone());
            }
        }

        if let Some(mappings) = config.get("mappings").and_then(|m| m.as_object()) {
            for (key, path) in mappings {
                let Some(path) = path.as_str() else {
                    continue;
                };
                match resolve_path(&ctx.previous_outputs, path) {
                    Some(value) => {
                        output.insert(key.clone(), value.clone());
                    }
                    None => errors.push(format!("Transform error: path '{}' not found", path)),
                }
            }
        }

        NodeResult { output, errors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::nodes::test_support::node_context;
    use serde_json::json;

    #[tokio::test]
    async fn test_mappings_and_statics() {
        let mut ctx = node_context("shape", json!({}));
        ctx.previous_outputs.insert("ingest".to_string(), json!({"incident_id": 3}));
        ctx.previous_outputs.insert(
            "ai".to_string(),
            json!({"recommendations": [{"title": "Page on-call"}]}),
        );

        let config = json!({
            "mappings": {"incident": "ingest.incident_id", "top": "ai.recommendations.0.title"},
            "static": {"team": "sre"}
        });
        let result = TransformNode.execute(&ctx, &config).await;

        assert!(!result.has_errors());
        assert_eq!(result.output["incident"], json!(3));
        assert_eq!(result.output["top"], json!("Page on-call"));
        assert_eq!(result.output["team"], json!("sre"));
    }

    #[tokio::test]
    async fn test_missing_path_is_an_error() {
        let ctx = node_context("shape", json!({}));
        let result = TransformNode
            .execute(&ctx, &json!({"mappings": {"x": "nowhere.value"}}))
            .await;

        assert_eq!(result.errors, vec!["Transform error: path 'nowhere.value' not found".to_string()]);
    }

    #[test]
    fn test_validate_config() {
        assert!(TransformNode.validate_config(&json!({"mappings": {"a": "n.k"}})).is_empty());
        assert_eq!(TransformNode.validate_config(&json!({"mappings": {"a": 1}})).len(), 1);
        assert_eq!(TransformNode.validate_config(&json!({"mappings": {"a": "n..k"}})).len(), 1);
        assert_eq!(TransformNode.validate_config(&json!({"static": []})).len(), 1);
    }
}
