//! Definition-driven pipeline orchestrator.
//!
//! Interprets a definition's node list with the handlers in a
//! [`NodeRegistry`]. Nodes run strictly in declaration order; `next` is
//! checked for referential integrity during validation but does not steer
//! execution. Each executed node gets one audit row keyed
//! `{run_id}:{node_id}:1`, skipped nodes get a SKIPPED row.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::domain::{
    DefinitionConfig, NodeContext, NodeResult, NodeSpec, PipelineRun, StageExecution,
};

use super::error::OrchestratorError;
use super::nodes::NodeRegistry;
use super::orchestrator::PipelineTrigger;
use super::safety::SafetyLimits;
use super::signals::{Signal, SignalEmitter, SignalTags};
use super::store::{Store, StoreError};

/// Definition name recorded for runs of an unsaved config
pub const ADHOC_DEFINITION: &str = "adhoc";

/// Error type recorded on a node row whose handler reported errors
const NODE_ERROR: &str = "NodeExecutionError";

/// Final status of a definition run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionStatus {
    /// Every executed node succeeded
    Completed,
    /// Only non-required nodes failed
    Partial,
    /// A required node failed or the run was stopped
    Failed,
}

impl DefinitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DefinitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one definition run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionResult {
    pub trace_id: String,
    pub run_id: String,
    pub definition_name: String,
    pub definition_version: u32,
    pub status: DefinitionStatus,
    pub executed_nodes: Vec<String>,
    pub skipped_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,

    /// `{output, errors}` per executed node, in execution order
    pub node_results: serde_json::Map<String, serde_json::Value>,

    pub incident_id: Option<i64>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl DefinitionResult {
    /// Completed or partial
    pub fn succeeded(&self) -> bool {
        self.status != DefinitionStatus::Failed
    }
}

/// One entry of a dry-run plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedNode {
    pub node_id: String,
    pub node_type: String,
    pub required: bool,
}

/// Accumulated state of the node walk
#[derive(Default)]
struct Walk {
    executed_nodes: Vec<String>,
    skipped_nodes: Vec<String>,
    failed_nodes: Vec<String>,
    node_results: serde_json::Map<String, serde_json::Value>,
    errored: HashSet<String>,
    /// Set when a required node failed or the run was force-failed
    abort: Option<(String, String)>,
}

pub struct DefinitionBasedOrchestrator {
    store: Store,
    registry: NodeRegistry,
    signals: Arc<dyn SignalEmitter>,
    safety: SafetyLimits,
}

impl DefinitionBasedOrchestrator {
    pub fn new(store: Store, registry: NodeRegistry, signals: Arc<dyn SignalEmitter>) -> Self {
        Self {
            store,
            registry,
            signals,
            safety: SafetyLimits::default(),
        }
    }

    pub fn with_safety_limits(mut self, safety: SafetyLimits) -> Self {
        self.safety = safety;
        self
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Every problem in a definition config; empty when it can run
    pub fn validate(&self, config: &serde_json::Value) -> Vec<String> {
        let mut errors = Vec::new();

        let Some(doc) = config.as_object() else {
            return vec!["definition must be a JSON object".to_string()];
        };

        if doc.get("version").map_or(true, |v| v.is_null()) {
            errors.push("missing 'version'".to_string());
        }

        if let Some(defaults) = doc.get("defaults") {
            match defaults.as_object() {
                Some(defaults) => {
                    let fits_u32 = |v: &serde_json::Value| {
                        v.as_u64().map_or(false, |n| n <= u64::from(u32::MAX))
                    };
                    if defaults.get("max_retries").map_or(false, |v| !fits_u32(v)) {
                        errors.push("defaults: 'max_retries' must be a non-negative integer".to_string());
                    }
                    if defaults.get("timeout_seconds").map_or(false, |v| v.as_u64().is_none()) {
                        errors.push("defaults: 'timeout_seconds' must be a non-negative integer".to_string());
                    }
                }
                None => errors.push("'defaults' must be an object".to_string()),
            }
        }

        let nodes = match doc.get("nodes") {
            Some(serde_json::Value::Array(nodes)) if !nodes.is_empty() => nodes,
            _ => {
                errors.push("'nodes' must be a non-empty list".to_string());
                return errors;
            }
        };

        let ids: Vec<Option<&str>> = nodes
            .iter()
            .map(|n| n.get("id").and_then(|id| id.as_str()).filter(|id| !id.is_empty()))
            .collect();

        let mut seen = HashSet::new();
        for (idx, node) in nodes.iter().enumerate() {
            let label = match ids[idx] {
                Some(id) => {
                    if !seen.insert(id) {
                        errors.push(format!("node[{}]: duplicate id '{}'", idx, id));
                    }
                    format!("node '{}'", id)
                }
                None => {
                    errors.push(format!("node[{}]: missing 'id'", idx));
                    format!("node[{}]", idx)
                }
            };

            let node_config = node
                .get("config")
                .cloned()
                .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
            if !node_config.is_object() {
                errors.push(format!("{}: 'config' must be an object", label));
            }

            match node.get("type").and_then(|t| t.as_str()) {
                None => errors.push(format!("{}: missing 'type'", label)),
                Some(node_type) => match self.registry.get(node_type) {
                    None => errors.push(format!(
                        "{}: unknown type '{}' (known: {})",
                        label,
                        node_type,
                        self.registry.types().join(", ")
                    )),
                    Some(handler) if node_config.is_object() => errors.extend(
                        handler
                            .validate_config(&node_config)
                            .into_iter()
                            .map(|e| format!("{}: {}", label, e)),
                    ),
                    Some(_) => {}
                },
            }

            if let Some(next) = node.get("next") {
                match next.as_str() {
                    Some(target) if ids[idx + 1..].contains(&Some(target)) => {}
                    Some(target) => errors.push(format!(
                        "{}: next '{}' must reference a later node",
                        label, target
                    )),
                    None => errors.push(format!("{}: 'next' must be a string", label)),
                }
            }

            if let Some(required) = node.get("required") {
                if !required.is_boolean() {
                    errors.push(format!("{}: 'required' must be a boolean", label));
                }
            }

            if let Some(skip) = node.get("skip_if_errors") {
                let valid = skip
                    .as_array()
                    .map(|items| items.iter().all(|i| i.is_string()))
                    .unwrap_or(false);
                if !valid {
                    errors.push(format!("{}: 'skip_if_errors' must be a list of node ids", label));
                }
            }

            if let Some(condition) = node.get("skip_if_condition") {
                if !condition.is_string() {
                    errors.push(format!("{}: 'skip_if_condition' must be a string", label));
                }
            }
        }

        errors
    }

    /// Validate and list the nodes that would run, without executing anything
    pub fn plan(&self, config: &serde_json::Value) -> Result<Vec<PlannedNode>, OrchestratorError> {
        let definition = self.parse(config)?;
        Ok(definition
            .nodes
            .into_iter()
            .map(|node| PlannedNode {
                node_id: node.id,
                node_type: node.node_type,
                required: node.required,
            })
            .collect())
    }

    /// Run a stored, active definition.
    ///
    /// The definition's config is snapshotted at start; later edits do not
    /// affect this run.
    #[instrument(skip(self, trigger), fields(definition = %name))]
    pub async fn run_definition(
        &self,
        name: &str,
        trigger: PipelineTrigger,
    ) -> Result<DefinitionResult, OrchestratorError> {
        let definition = self
            .store
            .get_definition(name)?
            .ok_or_else(|| OrchestratorError::DefinitionNotFound(name.to_string()))?;
        if !definition.is_active {
            return Err(OrchestratorError::DefinitionInactive(name.to_string()));
        }

        let config = self.parse(&definition.config)?;
        self.execute(&config, &definition.name, definition.version, trigger)
            .await
    }

    /// Run an unsaved config
    #[instrument(skip(self, config, trigger))]
    pub async fn run_config(
        &self,
        config: &serde_json::Value,
        trigger: PipelineTrigger,
    ) -> Result<DefinitionResult, OrchestratorError> {
        let config = self.parse(config)?;
        self.execute(&config, ADHOC_DEFINITION, 0, trigger).await
    }

    fn parse(&self, config: &serde_json::Value) -> Result<DefinitionConfig, OrchestratorError> {
        let errors = self.validate(config);
        if !errors.is_empty() {
            return Err(OrchestratorError::InvalidDefinition(errors));
        }
        DefinitionConfig::from_value(config)
            .map_err(|e| OrchestratorError::InvalidDefinition(vec![e.to_string()]))
    }

    async fn execute(
        &self,
        definition: &DefinitionConfig,
        name: &str,
        version: u32,
        trigger: PipelineTrigger,
    ) -> Result<DefinitionResult, OrchestratorError> {
        self.safety.validate_payload(&trigger.payload)?;

        let run = trigger
            .new_run(definition.defaults.max_retries, &self.safety)
            .with_definition(name, version);
        let mut run = self.store.create_run(&run)?;
        info!(
            run_id = %run.run_id,
            trace_id = %run.trace_id,
            nodes = definition.nodes.len(),
            "Starting definition run"
        );
        self.signals.emit(
            &Signal::PipelineStarted,
            &SignalTags::for_run(&run).with_extra("definition", name),
        );

        let started = Instant::now();
        let mut walk = Walk::default();
        if let Err(e) = self
            .walk(&mut run, definition, &trigger.payload, &mut walk)
            .await
        {
            error!(run_id = %run.run_id, error = %e, "Definition run aborted by store failure");
            walk.abort = Some(("StoreError".to_string(), e.to_string()));
        }

        Ok(self.finish(run, walk, started))
    }

    async fn walk(
        &self,
        run: &mut PipelineRun,
        definition: &DefinitionConfig,
        payload: &serde_json::Value,
        walk: &mut Walk,
    ) -> Result<(), StoreError> {
        let mut ctx = NodeContext {
            trace_id: run.trace_id.clone(),
            run_id: run.run_id.clone(),
            node_id: String::new(),
            incident_id: run.incident_id,
            environment: run.environment.clone(),
            source: run.source.clone(),
            alert_fingerprint: run.alert_fingerprint.clone(),
            payload: payload.clone(),
            previous_outputs: serde_json::Map::new(),
        };

        for node in &definition.nodes {
            if let Some(reason) = skip_reason(node, &walk.errored) {
                info!(node = %node.id, %reason, "Skipping node");
                let mut execution = StageExecution::new(run.id, &run.run_id, node.id.as_str(), 1);
                execution.mark_skipped(reason);
                self.store.create_stage_execution(&execution)?;
                walk.skipped_nodes.push(node.id.clone());
                continue;
            }

            let current = self.store.require_run(&run.run_id)?;
            if current.is_force_failed() {
                warn!(node = %node.id, "Run was force-failed, stopping");
                *run = current;
                let reason = run
                    .last_error_message
                    .clone()
                    .unwrap_or_else(|| "force-failed by operator".to_string());
                walk.abort = Some((node.id.clone(), reason));
                return Ok(());
            }

            let result = self.run_node(run, node, &mut ctx).await?;

            ctx.previous_outputs
                .insert(node.id.clone(), serde_json::Value::Object(result.output.clone()));
            walk.node_results.insert(node.id.clone(), result.to_json());
            walk.executed_nodes.push(node.id.clone());

            if node.node_type == "ingest" {
                if let Some(incident_id) = result.output.get("incident_id").and_then(|v| v.as_i64()) {
                    ctx.incident_id = Some(incident_id);
                    run.incident_id = Some(incident_id);
                    self.store.update_run(run)?;
                }
            }

            if result.has_errors() {
                walk.errored.insert(node.id.clone());
                walk.failed_nodes.push(node.id.clone());
                if node.required {
                    error!(node = %node.id, errors = ?result.errors, "Required node failed");
                    walk.abort = Some((node.id.clone(), result.errors.join("; ")));
                    return Ok(());
                }
                warn!(node = %node.id, errors = ?result.errors, "Optional node failed, continuing");
            }
        }

        Ok(())
    }

    /// Execute one node inside its own audit row
    async fn run_node(
        &self,
        run: &mut PipelineRun,
        node: &NodeSpec,
        ctx: &mut NodeContext,
    ) -> Result<NodeResult, StoreError> {
        let mut execution = self
            .store
            .create_stage_execution(&StageExecution::new(run.id, &run.run_id, node.id.as_str(), 1))?;
        execution.mark_running();
        self.store.update_stage_execution(&execution)?;

        run.total_attempts += 1;
        self.store.update_run(run)?;

        let tags = SignalTags::for_run(run)
            .with_stage(node.id.as_str())
            .with_attempt(1)
            .with_extra("node_type", node.node_type.as_str());
        self.signals.emit(&Signal::StageStarted, &tags);

        ctx.node_id = node.id.clone();
        let start = Instant::now();
        let result = match self.registry.get(&node.node_type) {
            Some(handler) => handler.execute(ctx, &node.config).await,
            None => NodeResult::failed(format!("unknown node type '{}'", node.node_type)),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let snapshot = self.safety.redact(&result.to_json());

        if result.has_errors() {
            let message = result.errors.join("; ");
            execution.mark_failed(NODE_ERROR, message.clone(), Some(snapshot), duration_ms);
            self.store.update_stage_execution(&execution)?;
            self.signals.emit(
                &Signal::StageFailed {
                    error_type: NODE_ERROR.to_string(),
                    message,
                    retryable: false,
                    duration_ms,
                },
                &tags,
            );
        } else {
            execution.mark_succeeded(snapshot, duration_ms);
            self.store.update_stage_execution(&execution)?;
            self.signals
                .emit(&Signal::StageSucceeded { duration_ms }, &tags);
            info!(node = %node.id, duration_ms, "Node succeeded");
        }

        Ok(result)
    }

    fn finish(&self, mut run: PipelineRun, walk: Walk, started: Instant) -> DefinitionResult {
        let status = match (&walk.abort, walk.failed_nodes.is_empty()) {
            (Some(_), _) => DefinitionStatus::Failed,
            (None, false) => DefinitionStatus::Partial,
            (None, true) => DefinitionStatus::Completed,
        };
        let error = walk
            .abort
            .as_ref()
            .map(|(node, reason)| format!("Node '{}' failed: {}", node, reason));

        if !run.is_force_failed() {
            let transition = match &error {
                Some(message) => run.fail(NODE_ERROR, message.clone(), false),
                None => run.complete_definition_run(),
            };
            match transition {
                Ok(()) => {
                    if let Err(e) = self.store.update_run(&run) {
                        error!(run_id = %run.run_id, error = %e, "Failed to persist definition run");
                    }
                }
                Err(e) => warn!(run_id = %run.run_id, error = %e, "Definition run could not be finalized"),
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            run_id = %run.run_id,
            status = %status,
            executed = walk.executed_nodes.len(),
            skipped = walk.skipped_nodes.len(),
            duration_ms,
            "Definition run finished"
        );
        self.signals.emit(
            &Signal::PipelineCompleted {
                status: status.as_str().to_ascii_uppercase(),
                duration_ms,
            },
            &SignalTags::for_run(&run),
        );

        DefinitionResult {
            trace_id: run.trace_id.clone(),
            run_id: run.run_id.clone(),
            definition_name: run.definition_name.clone().unwrap_or_default(),
            definition_version: run.definition_version.unwrap_or_default(),
            status,
            executed_nodes: walk.executed_nodes,
            skipped_nodes: walk.skipped_nodes,
            failed_nodes: walk.failed_nodes,
            node_results: walk.node_results,
            incident_id: run.incident_id,
            error,
            duration_ms,
        }
    }
}

/// Why a node is skipped, if it is
fn skip_reason(node: &NodeSpec, errored: &HashSet<String>) -> Option<String> {
    if let Some(prior) = node.skip_if_errors.iter().find(|id| errored.contains(*id)) {
        return Some(format!("'{}' had errors", prior));
    }
    match node.condition_target() {
        Some(target) if errored.contains(target) => Some(format!(
            "condition '{}' matched",
            node.skip_if_condition.as_deref().unwrap_or_default()
        )),
        _ => None,
    }
}
