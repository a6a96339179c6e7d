//! Generic alert ingestion with in-memory incident tracking.
//!
//! Accepts payloads of the form:
//!
//! ```json
//! { "alerts": [ { "name": "HighCPU", "severity": "critical",
//!                 "status": "firing", "labels": { "host": "web-1" } } ] }
//! ```
//!
//! Alerts are deduplicated by fingerprint; every firing fingerprint maps to
//! one open incident until the alert resolves.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{AlertIngestor, IncidentRef, IngestOutcome};

/// Stable fingerprint for an alert: sha256 over the name and sorted labels
pub fn alert_fingerprint(name: &str, labels: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    for (key, value) in labels {
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}

/// Fingerprint for a whole trigger payload when it carries none
pub fn payload_fingerprint(payload: &serde_json::Value) -> String {
    if let Some(fp) = payload.get("alert_fingerprint").and_then(|v| v.as_str()) {
        return fp.to_string();
    }
    let first_alert = payload
        .get("alerts")
        .and_then(|a| a.as_array())
        .and_then(|alerts| alerts.first())
        .and_then(|alert| serde_json::from_value::<RawAlert>(alert.clone()).ok());
    if let Some(alert) = first_alert {
        if let Some(name) = alert.name.as_deref() {
            return alert
                .fingerprint
                .clone()
                .unwrap_or_else(|| alert_fingerprint(name, &alert.labels));
        }
    }

    let canonical = serde_json::to_vec(payload).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    hex::encode(&digest[..16])
}

#[derive(Debug, Deserialize)]
struct RawAlert {
    name: Option<String>,
    fingerprint: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct AlertRecord {
    firing: bool,
    incident_id: i64,
}

#[derive(Debug, Clone)]
struct IncidentRecord {
    id: i64,
    fingerprint: String,
    severity: String,
    title: String,
    open: bool,
}

#[derive(Debug, Default)]
struct IngestState {
    alerts: HashMap<String, AlertRecord>,
    incidents: Vec<IncidentRecord>,
    last_touched: Option<i64>,
}

impl IngestState {
    fn incident_mut(&mut self, id: i64) -> Option<&mut IncidentRecord> {
        self.incidents.iter_mut().find(|i| i.id == id)
    }

    fn open_incident(&mut self, fingerprint: &str, severity: &str, title: &str) -> i64 {
        let id = self.incidents.len() as i64 + 1;
        self.incidents.push(IncidentRecord {
            id,
            fingerprint: fingerprint.to_string(),
            severity: severity.to_string(),
            title: title.to_string(),
            open: true,
        });
        id
    }
}

fn severity_rank(severity: &str) -> u8 {
    match severity.to_ascii_lowercase().as_str() {
        "critical" => 4,
        "error" | "high" => 3,
        "warning" | "medium" => 2,
        "info" | "low" => 1,
        _ => 0,
    }
}

/// Ingestor for the `generic` alert format
#[derive(Debug, Default)]
pub struct GenericAlertIngestor {
    state: Mutex<IngestState>,
}

impl GenericAlertIngestor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertIngestor for GenericAlertIngestor {
    fn name(&self) -> &str {
        "generic"
    }

    fn supports(&self, driver_hint: &str) -> bool {
        driver_hint == "generic"
    }

    async fn process(&self, payload: &serde_json::Value, driver_hint: &str) -> Result<IngestOutcome> {
        if !self.supports(driver_hint) {
            return Err(anyhow!("unsupported alert driver '{}'", driver_hint));
        }

        let alerts = match payload.get("alerts") {
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(serde_json::Value::Array(items)) => items.clone(),
            Some(_) => return Err(anyhow!("'alerts' must be an array")),
        };

        let mut outcome = IngestOutcome::default();
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("ingest state lock poisoned"))?;

        for (idx, value) in alerts.into_iter().enumerate() {
            let alert: RawAlert = match serde_json::from_value(value) {
                Ok(alert) => alert,
                Err(e) => {
                    outcome.errors.push(format!("alert[{}]: {}", idx, e));
                    continue;
                }
            };
            let Some(name) = alert.name.as_deref() else {
                outcome.errors.push(format!("alert[{}]: missing name", idx));
                continue;
            };

            let fingerprint = alert
                .fingerprint
                .clone()
                .unwrap_or_else(|| alert_fingerprint(name, &alert.labels));
            let severity = alert.severity.clone().unwrap_or_else(|| "warning".to_string());
            let resolved = alert
                .status
                .as_deref()
                .map(|s| s.eq_ignore_ascii_case("resolved"))
                .unwrap_or(false);

            let existing = state.alerts.get(&fingerprint).cloned();
            match (existing, resolved) {
                (Some(record), true) if record.firing => {
                    outcome.alerts_resolved += 1;
                    state.alerts.insert(
                        fingerprint.clone(),
                        AlertRecord {
                            firing: false,
                            incident_id: record.incident_id,
                        },
                    );
                    if let Some(incident) = state.incident_mut(record.incident_id) {
                        incident.open = false;
                    }
                    outcome.incidents_updated += 1;
                    state.last_touched = Some(record.incident_id);
                }
                (_, true) => {
                    debug!(%fingerprint, "Resolved alert without a firing record, ignoring");
                }
                (Some(record), false) => {
                    outcome.alerts_updated += 1;
                    let reopen = state
                        .incidents
                        .iter()
                        .find(|i| i.id == record.incident_id)
                        .map(|i| !i.open)
                        .unwrap_or(true);

                    let incident_id = if reopen {
                        outcome.incidents_created += 1;
                        state.open_incident(&fingerprint, &severity, name)
                    } else {
                        outcome.incidents_updated += 1;
                        if let Some(incident) = state.incident_mut(record.incident_id) {
                            if severity_rank(&severity) > severity_rank(&incident.severity) {
                                incident.severity = severity.clone();
                            }
                        }
                        record.incident_id
                    };

                    state.alerts.insert(
                        fingerprint.clone(),
                        AlertRecord {
                            firing: true,
                            incident_id,
                        },
                    );
                    state.last_touched = Some(incident_id);
                }
                (None, false) => {
                    outcome.alerts_created += 1;
                    outcome.incidents_created += 1;
                    let incident_id = state.open_incident(&fingerprint, &severity, name);
                    state.alerts.insert(
                        fingerprint.clone(),
                        AlertRecord {
                            firing: true,
                            incident_id,
                        },
                    );
                    state.last_touched = Some(incident_id);
                }
            }
        }

        Ok(outcome)
    }

    async fn latest_incident(&self) -> Result<Option<IncidentRef>> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow!("ingest state lock poisoned"))?;

        let incident = state.last_touched.and_then(|id| {
            state.incidents.iter().find(|i| i.id == id).map(|i| IncidentRef {
                id: i.id,
                fingerprint: i.fingerprint.clone(),
                severity: i.severity.clone(),
                title: i.title.clone(),
            })
        });
        Ok(incident)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_is_stable_and_label_sensitive() {
        let mut labels = BTreeMap::new();
        labels.insert("host".to_string(), "web-1".to_string());

        let a = alert_fingerprint("HighCPU", &labels);
        let b = alert_fingerprint("HighCPU", &labels);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        labels.insert("host".to_string(), "web-2".to_string());
        assert_ne!(a, alert_fingerprint("HighCPU", &labels));
    }

    #[test]
    fn test_payload_fingerprint_prefers_explicit_value() {
        assert_eq!(payload_fingerprint(&json!({"alert_fingerprint": "fp-9"})), "fp-9");
        assert_eq!(
            payload_fingerprint(&json!({"alerts": [{"name": "x", "fingerprint": "abc"}]})),
            "abc"
        );
        assert_eq!(
            payload_fingerprint(&json!({"alerts": []})),
            payload_fingerprint(&json!({"alerts": []}))
        );
    }

    #[tokio::test]
    async fn test_create_update_resolve_cycle() {
        let ingestor = GenericAlertIngestor::new();
        let firing = json!({"alerts": [{"name": "HighCPU", "severity": "warning", "fingerprint": "fp"}]});

        let outcome = ingestor.process(&firing, "generic").await.unwrap();
        assert_eq!(outcome.alerts_created, 1);
        assert_eq!(outcome.incidents_created, 1);

        let escalated = json!({"alerts": [{"name": "HighCPU", "severity": "critical", "fingerprint": "fp"}]});
        let outcome = ingestor.process(&escalated, "generic").await.unwrap();
        assert_eq!(outcome.alerts_updated, 1);
        assert_eq!(outcome.incidents_updated, 1);

        let incident = ingestor.latest_incident().await.unwrap().unwrap();
        assert_eq!(incident.id, 1);
        assert_eq!(incident.severity, "critical");
        assert_eq!(incident.fingerprint, "fp");

        let resolved = json!({"alerts": [{"name": "HighCPU", "status": "resolved", "fingerprint": "fp"}]});
        let outcome = ingestor.process(&resolved, "generic").await.unwrap();
        assert_eq!(outcome.alerts_resolved, 1);
    }

    #[tokio::test]
    async fn test_empty_and_invalid_payloads() {
        let ingestor = GenericAlertIngestor::new();

        let outcome = ingestor.process(&json!({"alerts": []}), "generic").await.unwrap();
        assert_eq!(outcome.alerts_created, 0);
        assert!(ingestor.latest_incident().await.unwrap().is_none());

        let outcome = ingestor
            .process(&json!({"alerts": [{"severity": "info"}]}), "generic")
            .await
            .unwrap();
        assert_eq!(outcome.errors, vec!["alert[0]: missing name".to_string()]);

        assert!(ingestor.process(&json!({"alerts": "x"}), "generic").await.is_err());
        assert!(ingestor.process(&json!({}), "pagerduty").await.is_err());
    }
}
