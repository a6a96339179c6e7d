//! CHECK stage.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::adapters::{DiagnosticsRequest, DiagnosticsRunner};
use crate::domain::{CheckResult, Stage, StageContext, StageOutput};

use super::StageExecutor;

pub struct CheckExecutor {
    diagnostics: Arc<dyn DiagnosticsRunner>,
}

impl CheckExecutor {
    pub fn new(diagnostics: Arc<dyn DiagnosticsRunner>) -> Self {
        Self { diagnostics }
    }
}

/// Build a diagnostics request from a trigger payload.
///
/// `checks` may be an object of name -> config or an array of names;
/// `labels` defaults to the first alert's labels.
pub fn diagnostics_request(payload: &serde_json::Value) -> DiagnosticsRequest {
    let mut request = DiagnosticsRequest::default();

    match payload.get("checks") {
        Some(serde_json::Value::Object(configs)) => {
            request.checker_configs = configs.clone();
        }
        Some(serde_json::Value::Array(names)) => {
            request.checker_names = Some(
                names
                    .iter()
                    .filter_map(|n| n.as_str().map(String::from))
                    .collect(),
            );
        }
        _ => {}
    }

    let labels = payload.get("labels").or_else(|| {
        payload
            .get("alerts")
            .and_then(|a| a.as_array())
            .and_then(|a| a.first())
            .and_then(|alert| alert.get("labels"))
    });
    if let Some(serde_json::Value::Object(labels)) = labels {
        request.labels = labels
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect::<BTreeMap<_, _>>();
    }

    request
}

#[async_trait]
impl StageExecutor for CheckExecutor {
    fn stage(&self) -> Stage {
        Stage::Check
    }

    fn name(&self) -> &str {
        "check"
    }

    async fn execute(&self, ctx: StageContext) -> StageOutput {
        let start = Instant::now();
        let request = diagnostics_request(&ctx.payload);

        let mut result = match self.diagnostics.run(&request).await {
            Ok(report) => CheckResult {
                checks_run: report.checks_run,
                checks_passed: report.checks_passed,
                checks_failed: report.checks_failed,
                failed_checks: report.failed_checks,
                errors: report
                    .errors
                    .into_iter()
                    .map(|e| format!("Check error: {}", e))
                    .collect(),
                ..Default::default()
            },
            Err(e) => CheckResult {
                errors: vec![format!("Check error: {:#}", e)],
                ..Default::default()
            },
        };

        result.duration_ms = start.elapsed().as_millis() as u64;
        StageOutput::Check(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::LocalDiagnostics;
    use crate::core::executors::test_support::context;
    use serde_json::json;

    #[test]
    fn test_request_from_payload() {
        let request = diagnostics_request(&json!({
            "checks": {"api": {"type": "http", "url": "http://x"}},
            "alerts": [{"name": "a", "labels": {"service": "api"}}]
        }));

        assert!(request.checker_names.is_none());
        assert!(request.checker_configs.contains_key("api"));
        assert_eq!(request.labels.get("service").map(String::as_str), Some("api"));

        let request = diagnostics_request(&json!({"checks": ["db", 3]}));
        assert_eq!(request.checker_names, Some(vec!["db".to_string()]));
    }

    #[tokio::test]
    async fn test_no_checks_is_success() {
        let executor = CheckExecutor::new(Arc::new(LocalDiagnostics::with_builtin_checks()));

        let StageOutput::Check(result) = executor.execute(context(json!({"alerts": []}))).await else {
            panic!("expected check output");
        };
        assert_eq!(result.checks_run, 0);
        assert!(!result.has_errors());
    }
}
