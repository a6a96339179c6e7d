//! Collaborator interfaces for the stage executors.
//!
//! Executors never talk to the outside world directly; they call these
//! traits. Local backends ship with the crate so a pipeline can run end to
//! end without external services:
//! - `ingest`: in-memory alert/incident tracking
//! - `diagnostics`: health-check runner with an HTTP check
//! - `provider`: rule-based recommendation provider
//! - `drivers`: webhook and log notification drivers

pub mod diagnostics;
pub mod drivers;
pub mod ingest;
pub mod provider;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Recommendation;

pub use diagnostics::{HttpHealthCheck, LocalDiagnostics};
pub use drivers::{LogDriver, WebhookDriver};
pub use ingest::{alert_fingerprint, payload_fingerprint, GenericAlertIngestor};
pub use provider::LocalRuleProvider;

// ============================================================================
// Ingest
// ============================================================================

/// Counts reported by an alert ingestor for one payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub alerts_created: u32,
    pub alerts_updated: u32,
    pub alerts_resolved: u32,
    pub incidents_created: u32,
    pub incidents_updated: u32,
    pub errors: Vec<String>,
}

/// The most recently touched incident
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentRef {
    pub id: i64,
    pub fingerprint: String,
    pub severity: String,
    pub title: String,
}

#[async_trait]
pub trait AlertIngestor: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this ingestor understands payloads for `driver_hint`
    fn supports(&self, driver_hint: &str) -> bool;

    async fn process(&self, payload: &serde_json::Value, driver_hint: &str) -> Result<IngestOutcome>;

    async fn latest_incident(&self) -> Result<Option<IncidentRef>>;
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Which checks to run and with what settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticsRequest {
    /// Checks to run; `None` runs every configured check
    pub checker_names: Option<Vec<String>>,
    pub checker_configs: serde_json::Map<String, serde_json::Value>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub checks_run: u32,
    pub checks_passed: u32,
    pub checks_failed: u32,
    pub failed_checks: Vec<String>,
    pub errors: Vec<String>,
}

#[async_trait]
pub trait DiagnosticsRunner: Send + Sync {
    async fn run(&self, request: &DiagnosticsRequest) -> Result<DiagnosticsReport>;
}

/// Outcome of a single health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub healthy: bool,
    pub detail: String,
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Check type, matched against a check config's `type`
    fn name(&self) -> &str;

    async fn check(&self, config: &serde_json::Value) -> Result<CheckOutcome>;
}

// ============================================================================
// Analyze
// ============================================================================

/// What a provider knows about the incident under analysis
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncidentSummary {
    pub incident_id: Option<i64>,
    pub severity: Option<String>,
    pub alert_fingerprint: String,
    pub environment: String,
    pub source: String,
    pub failed_checks: Vec<String>,
}

#[async_trait]
pub trait RecommendationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, incident: Option<&IncidentSummary>) -> Result<Vec<Recommendation>>;
}

/// Lookup failures in the provider and driver registries
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("no active provider configured")]
    NoActiveProvider,

    #[error("unknown driver '{0}'")]
    UnknownDriver(String),
}

/// Name-keyed recommendation providers with one active provider
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn RecommendationProvider>>,
    active: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider; the first one registered becomes active
    pub fn register(mut self, provider: Arc<dyn RecommendationProvider>) -> Self {
        let name = provider.name().to_string();
        if self.active.is_none() {
            self.active = Some(name.clone());
        }
        self.providers.insert(name, provider);
        self
    }

    pub fn with_active(mut self, name: impl Into<String>) -> Self {
        self.active = Some(name.into());
        self
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Explicit name looks up directly; otherwise the active provider
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn RecommendationProvider>, RegistryError> {
        match name {
            Some(name) => self
                .providers
                .get(name)
                .cloned()
                .ok_or_else(|| RegistryError::UnknownProvider(name.to_string())),
            None => {
                let active = self.active.as_deref().ok_or(RegistryError::NoActiveProvider)?;
                self.providers
                    .get(active)
                    .cloned()
                    .ok_or_else(|| RegistryError::UnknownProvider(active.to_string()))
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

// ============================================================================
// Notify
// ============================================================================

/// Rendered notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub title: String,
    pub body: String,
    pub severity: String,
    pub incident_id: Option<i64>,
    pub trace_id: String,
    pub run_id: String,
}

/// Driver acknowledgement of a send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub status: String,
    pub message_id: Option<String>,
}

#[async_trait]
pub trait NotificationDriver: Send + Sync {
    fn name(&self) -> &str;

    fn validate_config(&self, config: &serde_json::Value) -> bool;

    async fn send(&self, message: &NotificationMessage, config: &serde_json::Value) -> Result<SendReceipt>;
}

/// Name-keyed notification drivers
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn NotificationDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, driver: Arc<dyn NotificationDriver>) -> Self {
        self.drivers.insert(driver.name().to_string(), driver);
        self
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn NotificationDriver>, RegistryError> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownDriver(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// Every collaborator the executors need
#[derive(Clone)]
pub struct Collaborators {
    pub ingestor: Arc<dyn AlertIngestor>,
    pub diagnostics: Arc<dyn DiagnosticsRunner>,
    pub providers: ProviderRegistry,
    pub drivers: DriverRegistry,
}

impl Collaborators {
    /// Local backends only: no external API is needed to run a pipeline
    pub fn local() -> Self {
        Self {
            ingestor: Arc::new(GenericAlertIngestor::new()),
            diagnostics: Arc::new(LocalDiagnostics::with_builtin_checks()),
            providers: ProviderRegistry::new().register(Arc::new(LocalRuleProvider::new())),
            drivers: DriverRegistry::new()
                .register(Arc::new(WebhookDriver::new()))
                .register(Arc::new(LogDriver)),
        }
    }

    pub fn with_ingestor(mut self, ingestor: Arc<dyn AlertIngestor>) -> Self {
        self.ingestor = ingestor;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsRunner>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }
}
