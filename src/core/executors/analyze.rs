//! ANALYZE stage.
//!
//! Provider failures are absorbed when fallback is enabled: the stage then
//! succeeds with a degraded result instead of blocking notification.

use std::time::Instant;

use async_trait::async_trait;
use tracing::warn;

use crate::adapters::{IncidentSummary, ProviderRegistry, RegistryError};
use crate::domain::{
    AnalyzeResult, CheckResult, IngestResult, Recommendation, RecommendationPriority, Stage,
    StageContext, StageOutput,
};

use super::StageExecutor;

pub struct AnalyzeExecutor {
    providers: ProviderRegistry,
    fallback_enabled: bool,
}

impl AnalyzeExecutor {
    pub fn new(providers: ProviderRegistry, fallback_enabled: bool) -> Self {
        Self {
            providers,
            fallback_enabled,
        }
    }

    /// Degraded result used when the provider is unavailable
    pub fn fallback_result(provider: Option<String>, reason: String) -> AnalyzeResult {
        AnalyzeResult {
            provider,
            recommendations: vec![Recommendation {
                rec_type: "manual".to_string(),
                priority: RecommendationPriority::Medium,
                title: "Manual investigation required".to_string(),
                description: "Automated analysis was unavailable for this incident".to_string(),
                actions: vec!["Investigate the incident manually".to_string()],
                confidence: None,
            }],
            confidence: 0.0,
            fallback_used: true,
            fallback_reason: Some(reason),
            ..Default::default()
        }
    }

    fn summary(ctx: &StageContext) -> IncidentSummary {
        let ingest: IngestResult = ctx
            .previous(Stage::Ingest)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let check: CheckResult = ctx
            .previous(Stage::Check)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        IncidentSummary {
            incident_id: ctx.incident_id.or(ingest.incident_id),
            severity: ingest
                .severity
                .or_else(|| ctx.payload_str("severity").map(String::from)),
            alert_fingerprint: ingest
                .alert_fingerprint
                .unwrap_or_else(|| ctx.alert_fingerprint.clone()),
            environment: ctx.environment.clone(),
            source: ctx.source.clone(),
            failed_checks: check.failed_checks,
        }
    }

    fn has_incident(summary: &IncidentSummary) -> bool {
        summary.incident_id.is_some() || summary.severity.is_some() || !summary.failed_checks.is_empty()
    }

    async fn analyze(&self, ctx: &StageContext) -> AnalyzeResult {
        let requested = ctx.payload_str("provider");
        let provider_name = requested
            .map(String::from)
            .or_else(|| self.providers.active().map(String::from));

        let provider = match self.providers.resolve(requested) {
            Ok(provider) => provider,
            Err(e) => {
                let unknown = matches!(e, RegistryError::UnknownProvider(_) | RegistryError::NoActiveProvider);
                return self.failure(provider_name, format!("{}", e), unknown);
            }
        };

        let summary = Self::summary(ctx);
        let incident = Self::has_incident(&summary).then_some(&summary);

        match provider.analyze(incident).await {
            Ok(recommendations) => AnalyzeResult {
                provider: Some(provider.name().to_string()),
                confidence: mean_confidence(&recommendations),
                recommendations,
                ..Default::default()
            },
            Err(e) => self.failure(Some(provider.name().to_string()), format!("{:#}", e), false),
        }
    }

    fn failure(&self, provider: Option<String>, reason: String, fatal: bool) -> AnalyzeResult {
        if self.fallback_enabled {
            warn!(provider = ?provider, %reason, "Provider unavailable, using fallback analysis");
            return Self::fallback_result(provider, reason);
        }
        AnalyzeResult {
            provider,
            errors: vec![format!("Analyze error: {}", reason)],
            fatal,
            ..Default::default()
        }
    }
}

/// Mean of the recommendations' confidences.
///
/// Recommendations without a confidence count as 0.5; no recommendations
/// yields 0.0.
pub fn mean_confidence(recommendations: &[Recommendation]) -> f64 {
    if recommendations.is_empty() {
        return 0.0;
    }
    let scored: Vec<f64> = recommendations.iter().filter_map(|r| r.confidence).collect();
    if scored.is_empty() {
        return 0.5;
    }
    scored.iter().sum::<f64>() / scored.len() as f64
}

#[async_trait]
impl StageExecutor for AnalyzeExecutor {
    fn stage(&self) -> Stage {
        Stage::Analyze
    }

    fn name(&self) -> &str {
        "analyze"
    }

    async fn execute(&self, ctx: StageContext) -> StageOutput {
        let start = Instant::now();
        let mut result = self.analyze(&ctx).await;
        result.duration_ms = start.elapsed().as_millis() as u64;
        StageOutput::Analyze(result)
    }
}
