//! INGEST stage.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use crate::adapters::AlertIngestor;
use crate::domain::{IngestResult, Stage, StageContext, StageOutput};

use super::StageExecutor;

/// Driver hint used when the payload does not name one
pub const DEFAULT_ALERT_DRIVER: &str = "generic";

pub struct IngestExecutor {
    ingestor: Arc<dyn AlertIngestor>,
}

impl IngestExecutor {
    pub fn new(ingestor: Arc<dyn AlertIngestor>) -> Self {
        Self { ingestor }
    }

    async fn ingest(&self, ctx: &StageContext) -> IngestResult {
        let hint = ctx.payload_str("driver").unwrap_or(DEFAULT_ALERT_DRIVER);
        let mut result = IngestResult {
            incident_id: ctx.incident_id,
            ..Default::default()
        };

        if !self.ingestor.supports(hint) {
            result.errors.push(format!("Ingest error: unknown alert driver '{}'", hint));
            result.fatal = true;
            return result;
        }

        let outcome = match self.ingestor.process(&ctx.payload, hint).await {
            Ok(outcome) => outcome,
            Err(e) => {
                result.errors.push(format!("Ingest error: {:#}", e));
                return result;
            }
        };

        result.alerts_created = outcome.alerts_created;
        result.alerts_updated = outcome.alerts_updated;
        result.alerts_resolved = outcome.alerts_resolved;
        result.incidents_created = outcome.incidents_created;
        result.incidents_updated = outcome.incidents_updated;
        result
            .errors
            .extend(outcome.errors.into_iter().map(|e| format!("Ingest error: {}", e)));

        if result.alerts_touched() > 0 {
            match self.ingestor.latest_incident().await {
                Ok(Some(incident)) => {
                    debug!(incident_id = incident.id, "Resolved most recent incident");
                    result.incident_id = Some(incident.id);
                    result.alert_fingerprint = Some(incident.fingerprint);
                    result.severity = Some(incident.severity);
                }
                Ok(None) => {}
                Err(e) => result.errors.push(format!("Ingest error: {:#}", e)),
            }
        }

        result
    }
}

#[async_trait]
impl StageExecutor for IngestExecutor {
    fn stage(&self) -> Stage {
        Stage::Ingest
    }

    fn name(&self) -> &str {
        "ingest"
    }

    async fn execute(&self, ctx: StageContext) -> StageOutput {
        let start = Instant::now();
        let mut result = self.ingest(&ctx).await;
        result.duration_ms = start.elapsed().as_millis() as u64;
        StageOutput::Ingest(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::GenericAlertIngestor;
    use crate::core::executors::test_support::context;
    use serde_json::json;

    fn executor() -> IngestExecutor {
        IngestExecutor::new(Arc::new(GenericAlertIngestor::new()))
    }

    #[tokio::test]
    async fn test_ingest_derives_incident() {
        let payload = json!({"alerts": [{"name": "DiskFull", "severity": "error", "fingerprint": "disk"}]});

        let StageOutput::Ingest(result) = executor().execute(context(payload)).await else {
            panic!("expected ingest output");
        };

        assert!(!result.has_errors());
        assert_eq!(result.alerts_created, 1);
        assert_eq!(result.incident_id, Some(1));
        assert_eq!(result.alert_fingerprint.as_deref(), Some("disk"));
        assert_eq!(result.severity.as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn test_empty_payload_succeeds() {
        let output = executor().execute(context(json!({"alerts": []}))).await;
        assert!(!output.has_errors());
    }

    #[tokio::test]
    async fn test_unknown_driver_is_fatal() {
        let output = executor()
            .execute(context(json!({"driver": "pagerduty", "alerts": []})))
            .await;

        assert!(output.has_errors());
        assert!(!output.retryable());
        assert!(output.errors()[0].contains("pagerduty"));
    }
}
