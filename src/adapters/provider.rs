//! Rule-based recommendation provider.
//!
//! Deterministic and offline: recommendations are derived from incident
//! severity and failed diagnostics checks.

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::{Recommendation, RecommendationPriority};

use super::{IncidentSummary, RecommendationProvider};

#[derive(Debug, Default)]
pub struct LocalRuleProvider;

impl LocalRuleProvider {
    pub fn new() -> Self {
        Self
    }

    fn severity_recommendation(summary: &IncidentSummary) -> Option<Recommendation> {
        let severity = summary.severity.as_deref()?.to_ascii_lowercase();
        let incident = summary
            .incident_id
            .map(|id| format!("incident #{}", id))
            .unwrap_or_else(|| "the incident".to_string());

        let (rec_type, priority, title, actions, confidence) = match severity.as_str() {
            "critical" => (
                "escalate",
                RecommendationPriority::Critical,
                format!("Page on-call for {}", incident),
                vec!["Page the on-call engineer", "Open an incident channel"],
                0.8,
            ),
            "error" | "high" => (
                "investigate",
                RecommendationPriority::High,
                format!("Investigate {} in {}", incident, summary.environment),
                vec!["Review recent deployments", "Check error rates and logs"],
                0.7,
            ),
            "warning" | "medium" => (
                "investigate",
                RecommendationPriority::Medium,
                format!("Review {}", incident),
                vec!["Check dashboards for the affected service"],
                0.6,
            ),
            _ => (
                "monitor",
                RecommendationPriority::Low,
                format!("Monitor {}", incident),
                vec!["Watch for recurrence"],
                0.5,
            ),
        };

        Some(Recommendation {
            rec_type: rec_type.to_string(),
            priority,
            title,
            description: format!(
                "Alert {} from {} reported severity '{}'",
                summary.alert_fingerprint, summary.source, severity
            ),
            actions: actions.into_iter().map(String::from).collect(),
            confidence: Some(confidence),
        })
    }
}

#[async_trait]
impl RecommendationProvider for LocalRuleProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn analyze(&self, incident: Option<&IncidentSummary>) -> Result<Vec<Recommendation>> {
        let Some(summary) = incident else {
            return Ok(vec![Recommendation {
                rec_type: "monitor".to_string(),
                priority: RecommendationPriority::Low,
                title: "No active incident".to_string(),
                description: "No incident context was available for analysis".to_string(),
                actions: vec!["Verify the alert source is configured".to_string()],
                confidence: Some(0.5),
            }]);
        };

        let mut recommendations: Vec<Recommendation> =
            Self::severity_recommendation(summary).into_iter().collect();

        for check in &summary.failed_checks {
            recommendations.push(Recommendation {
                rec_type: "remediate".to_string(),
                priority: RecommendationPriority::High,
                title: format!("Restore '{}'", check),
                description: format!("Diagnostics check '{}' is failing", check),
                actions: vec![
                    format!("Inspect the service behind '{}'", check),
                    "Restart or roll back if unhealthy".to_string(),
                ],
                confidence: Some(0.7),
            });
        }

        if recommendations.is_empty() {
            recommendations.push(Recommendation {
                rec_type: "monitor".to_string(),
                priority: RecommendationPriority::Low,
                title: "No action required".to_string(),
                description: "No severity or failing checks were reported".to_string(),
                actions: Vec::new(),
                confidence: Some(0.5),
            });
        }

        Ok(recommendations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_critical_incident_escalates() {
        let summary = IncidentSummary {
            incident_id: Some(4),
            severity: Some("critical".to_string()),
            failed_checks: vec!["api".to_string()],
            ..Default::default()
        };

        let recs = LocalRuleProvider::new().analyze(Some(&summary)).await.unwrap();

        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].priority, RecommendationPriority::Critical);
        assert!(recs[0].title.contains("#4"));
        assert_eq!(recs[1].rec_type, "remediate");
    }

    #[tokio::test]
    async fn test_without_incident() {
        let recs = LocalRuleProvider::new().analyze(None).await.unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].priority, RecommendationPriority::Low);
    }
}
