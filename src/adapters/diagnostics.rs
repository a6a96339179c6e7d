//! Local diagnostics runner.
//!
//! Checks are configured per trigger:
//!
//! ```json
//! { "checks": { "api": { "type": "http", "url": "http://localhost:8080/health" } } }
//! ```
//!
//! A check config's `type` selects the registered [`HealthCheck`]; when it is
//! missing the check name itself is used.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{CheckOutcome, DiagnosticsReport, DiagnosticsRequest, DiagnosticsRunner, HealthCheck};

/// Runs registered health checks sequentially
#[derive(Default, Clone)]
pub struct LocalDiagnostics {
    checks: HashMap<String, Arc<dyn HealthCheck>>,
}

impl LocalDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner with the built-in `http` check
    pub fn with_builtin_checks() -> Self {
        Self::new().register(Arc::new(HttpHealthCheck::new()))
    }

    pub fn register(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.checks.insert(check.name().to_string(), check);
        self
    }
}

#[async_trait]
impl DiagnosticsRunner for LocalDiagnostics {
    async fn run(&self, request: &DiagnosticsRequest) -> Result<DiagnosticsReport> {
        let names: Vec<String> = match request.checker_names {
            Some(ref names) => names.clone(),
            None => request.checker_configs.keys().cloned().collect(),
        };

        let mut report = DiagnosticsReport::default();
        let empty = serde_json::Value::Object(serde_json::Map::new());

        for name in names {
            let config = request.checker_configs.get(&name).unwrap_or(&empty);
            let check_type = config
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or(name.as_str());

            let Some(check) = self.checks.get(check_type) else {
                report
                    .errors
                    .push(format!("unknown check type '{}' for check '{}'", check_type, name));
                continue;
            };

            report.checks_run += 1;
            match check.check(config).await {
                Ok(CheckOutcome { healthy: true, .. }) => {
                    debug!(check = %name, "Check passed");
                    report.checks_passed += 1;
                }
                Ok(CheckOutcome { healthy: false, detail }) => {
                    warn!(check = %name, %detail, "Check failed");
                    report.checks_failed += 1;
                    report.failed_checks.push(name.clone());
                }
                Err(e) => {
                    report.checks_failed += 1;
                    report.failed_checks.push(name.clone());
                    report.errors.push(format!("check '{}': {:#}", name, e));
                }
            }
        }

        Ok(report)
    }
}

/// `http` check: GET `url`, healthy on 2xx (or `expected_status`)
pub struct HttpHealthCheck {
    client: reqwest::Client,
}

impl Default for HttpHealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpHealthCheck {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    fn name(&self) -> &str {
        "http"
    }

    async fn check(&self, config: &serde_json::Value) -> Result<CheckOutcome> {
        let url = config
            .get("url")
            .and_then(|u| u.as_str())
            .context("http check requires 'url'")?;
        let timeout = config
            .get("timeout_seconds")
            .and_then(|t| t.as_u64())
            .unwrap_or(5);
        let expected = config.get("expected_status").and_then(|s| s.as_u64());

        let response = match self
            .client
            .get(url)
            .timeout(Duration::from_secs(timeout))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return Ok(CheckOutcome {
                    healthy: false,
                    detail: format!("request to {} failed: {}", url, e),
                })
            }
        };

        let status = response.status();
        let healthy = match expected {
            Some(code) => u64::from(status.as_u16()) == code,
            None => status.is_success(),
        };

        Ok(CheckOutcome {
            healthy,
            detail: format!("{} returned {}", url, status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StaticCheck(bool);

    #[async_trait]
    impl HealthCheck for StaticCheck {
        fn name(&self) -> &str {
            "static"
        }

        async fn check(&self, _config: &serde_json::Value) -> Result<CheckOutcome> {
            Ok(CheckOutcome {
                healthy: self.0,
                detail: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_runs_configured_checks() {
        let diagnostics = LocalDiagnostics::new().register(Arc::new(StaticCheck(false)));
        let request = DiagnosticsRequest {
            checker_configs: json!({"db": {"type": "static"}})
                .as_object()
                .cloned()
                .unwrap(),
            ..Default::default()
        };

        let report = diagnostics.run(&request).await.unwrap();
        assert_eq!(report.checks_run, 1);
        assert_eq!(report.checks_failed, 1);
        assert_eq!(report.failed_checks, vec!["db".to_string()]);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_check_type_is_an_error() {
        let diagnostics = LocalDiagnostics::with_builtin_checks();
        let request = DiagnosticsRequest {
            checker_names: Some(vec!["ping".to_string()]),
            ..Default::default()
        };

        let report = diagnostics.run(&request).await.unwrap();
        assert_eq!(report.checks_run, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("ping"));
    }

    #[tokio::test]
    async fn test_no_checks_configured() {
        let report = LocalDiagnostics::with_builtin_checks()
            .run(&DiagnosticsRequest::default())
            .await
            .unwrap();
        assert_eq!(report.checks_run, 0);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_http_check_requires_url() {
        let check = HttpHealthCheck::new();
        assert!(check.check(&json!({})).await.is_err());
    }
}
