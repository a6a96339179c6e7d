//! Fixed four-stage pipeline orchestrator.
//!
//! Drives INGEST -> CHECK -> ANALYZE -> NOTIFY for one run, persisting every
//! stage boundary to the store before the next stage starts. Each attempt
//! gets its own `StageExecution` row; a stage that already SUCCEEDED is
//! reused from its snapshot, which makes resume safe after a crash.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::payload_fingerprint;
use crate::domain::{
    PipelineOutcome, PipelineResult, PipelineRun, PipelineStatus, Stage, StageContext,
    StageExecution, StageExecutionError, StageOutput, FORCE_FAILED_ERROR,
};

use super::error::OrchestratorError;
use super::executors::ExecutorSet;
use super::retry::RetryPolicy;
use super::safety::SafetyLimits;
use super::signals::{Signal, SignalEmitter, SignalTags};
use super::store::{RunFilter, Store, StoreError};

/// Parameters of one pipeline trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTrigger {
    /// Correlation id; generated when absent
    pub trace_id: Option<String>,
    pub source: String,
    pub environment: String,
    pub payload: serde_json::Value,
    /// Overrides the orchestrator's retry limit for this run
    pub max_retries: Option<u32>,
}

impl PipelineTrigger {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            trace_id: None,
            source: "manual".to_string(),
            environment: "production".to_string(),
            payload,
            max_retries: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Build the PENDING run for this trigger
    pub(crate) fn new_run(&self, default_max_retries: u32, safety: &SafetyLimits) -> PipelineRun {
        let trace_id = self
            .trace_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut run = PipelineRun::new(
            trace_id,
            self.source.clone(),
            self.environment.clone(),
            payload_fingerprint(&self.payload),
            self.max_retries.unwrap_or(default_max_retries),
        )
        .with_trigger_payload(safety.redact(&self.payload));
        run.started_at = Some(chrono::Utc::now());
        run
    }
}

/// One entry of a dry-run plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedStage {
    pub stage: Stage,
    pub executor: String,
    pub max_retries: u32,
}

/// Outcome of one stage inside a run
struct StageRun {
    output: StageOutput,
    reused: bool,
}

/// Accumulated state of the stage walk
#[derive(Default)]
struct Progress {
    results: BTreeMap<String, serde_json::Value>,
    stages_completed: Vec<Stage>,
    stages_reused: Vec<Stage>,
}

/// Orchestrator for the fixed incident pipeline
pub struct PipelineOrchestrator {
    store: Store,
    executors: ExecutorSet,
    signals: Arc<dyn SignalEmitter>,
    retry: RetryPolicy,
    safety: SafetyLimits,
}

impl PipelineOrchestrator {
    pub fn new(store: Store, executors: ExecutorSet, signals: Arc<dyn SignalEmitter>) -> Self {
        Self {
            store,
            executors,
            signals,
            retry: RetryPolicy::default(),
            safety: SafetyLimits::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_safety_limits(mut self, safety: SafetyLimits) -> Self {
        self.safety = safety;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Stages that would run, without executing anything
    pub fn plan(&self) -> Vec<PlannedStage> {
        Stage::ALL
            .iter()
            .map(|stage| PlannedStage {
                stage: *stage,
                executor: self.executors.get(*stage).name().to_string(),
                max_retries: self.retry.max_retries,
            })
            .collect()
    }

    /// Execute a new run end to end.
    ///
    /// A stage failure ends the run FAILED and is returned as a FAILED
    /// `PipelineResult`; `Err` is reserved for problems that prevent the run
    /// from being recorded at all.
    #[instrument(skip(self, trigger), fields(trace_id = ?trigger.trace_id, source = %trigger.source))]
    pub async fn run_pipeline(&self, trigger: PipelineTrigger) -> Result<PipelineResult, OrchestratorError> {
        self.safety.validate_payload(&trigger.payload)?;

        let run = trigger.new_run(self.retry.max_retries, &self.safety);
        let run = self.store.create_run(&run)?;
        info!(run_id = %run.run_id, trace_id = %run.trace_id, "Starting pipeline run");

        self.signals
            .emit(&Signal::PipelineStarted, &SignalTags::for_run(&run));

        Ok(self.drive(run, &trigger.payload).await)
    }

    /// Re-enter a FAILED or RETRYING run; succeeded stages are reused.
    ///
    /// When `payload` is `None` the run's stored (redacted) trigger payload
    /// is replayed.
    #[instrument(skip(self, payload), fields(run_id = %run_id))]
    pub async fn resume_pipeline(
        &self,
        run_id: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<PipelineResult, OrchestratorError> {
        let mut run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;

        if run.is_force_failed() {
            return Err(OrchestratorError::Cancelled(run_id.to_string()));
        }
        if !run.status.is_resumable() || run.is_definition_run() {
            return Err(OrchestratorError::NotResumable {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }

        let payload = payload
            .or_else(|| run.trigger_payload.clone())
            .unwrap_or_else(|| serde_json::json!({}));
        self.safety.validate_payload(&payload)?;

        if run.status == PipelineStatus::Failed {
            run.transition(PipelineStatus::Retrying)
                .map_err(StoreError::from)?;
        }
        run.completed_at = None;
        run.started_at = Some(chrono::Utc::now());
        self.store.update_run(&run)?;

        info!(trace_id = %run.trace_id, "Resuming pipeline run");
        self.signals.emit(
            &Signal::PipelineStarted,
            &SignalTags::for_run(&run).with_extra("resumed", true),
        );

        Ok(self.drive(run, &payload).await)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>, OrchestratorError> {
        Ok(self.store.get_run(run_id)?)
    }

    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<PipelineRun>, OrchestratorError> {
        Ok(self.store.list_runs(filter)?)
    }

    /// Walk the stages in order, stopping at the first failure
    async fn drive(&self, mut run: PipelineRun, payload: &serde_json::Value) -> PipelineResult {
        let started = Instant::now();
        let mut progress = Progress::default();

        for stage in Stage::ALL {
            let outcome = match self.run_stage(&mut run, stage, payload, &progress.results).await {
                Ok(outcome) => self.record_stage(&mut run, outcome),
                Err(err) => Err(err),
            };

            match outcome {
                Ok((output, reused)) => {
                    progress
                        .results
                        .insert(stage.result_key().to_string(), output.to_json());
                    progress.stages_completed.push(stage);
                    if reused {
                        progress.stages_reused.push(stage);
                    }
                }
                Err(err) => return self.fail_run(run, err, progress, started),
            }
        }

        self.complete_run(run, progress, started)
    }

    /// Run one stage: reuse a succeeded attempt, otherwise execute with retry
    async fn run_stage(
        &self,
        run: &mut PipelineRun,
        stage: Stage,
        payload: &serde_json::Value,
        previous: &BTreeMap<String, serde_json::Value>,
    ) -> Result<StageRun, StageExecutionError> {
        let store_failure = move |e: StoreError| stage_store_error(stage, e);

        if let Some(execution) = self
            .store
            .succeeded_execution(run.id, stage.as_str())
            .map_err(store_failure)?
        {
            info!(stage = %stage, attempt = execution.attempt, "Stage already succeeded, reusing output");
            let snapshot = execution
                .output_snapshot
                .unwrap_or_else(|| serde_json::json!({}));
            let output = StageOutput::from_snapshot(stage, &snapshot).map_err(|e| {
                StageExecutionError::unexpected(stage.as_str(), "SnapshotError", e.to_string())
            })?;
            return Ok(StageRun { output, reused: true });
        }

        let executor = self.executors.get(stage);
        let first_attempt = self
            .store
            .max_attempt(run.id, stage.as_str())
            .map_err(store_failure)?
            + 1;
        let mut tries = 0u32;

        loop {
            tries += 1;
            let attempt = first_attempt + tries - 1;

            // Operator actions are only visible in the store
            let current = self.store.require_run(&run.run_id).map_err(store_failure)?;
            if let Some(err) = failed_out_of_band(stage.as_str(), &current) {
                warn!(stage = %stage, error_type = %err.error_type, "Run was failed by an operator, stopping");
                return Err(err);
            }

            let mut execution = self
                .store
                .create_stage_execution(&StageExecution::new(run.id, &run.run_id, stage.as_str(), attempt))
                .map_err(store_failure)?;
            execution.mark_running();
            self.store
                .update_stage_execution(&execution)
                .map_err(store_failure)?;

            run.total_attempts += 1;
            if let Err(e) = self.store.update_run(run) {
                let err = store_failure(e);
                execution.mark_failed(err.error_type.clone(), err.message(), None, 0);
                self.close_attempt(&execution);
                return Err(err);
            }

            let tags = SignalTags::for_run(run)
                .with_stage(stage.as_str())
                .with_attempt(attempt);
            self.signals.emit(&Signal::StageStarted, &tags);

            let ctx = StageContext {
                trace_id: run.trace_id.clone(),
                run_id: run.run_id.clone(),
                incident_id: run.incident_id,
                attempt,
                environment: run.environment.clone(),
                source: run.source.clone(),
                alert_fingerprint: run.alert_fingerprint.clone(),
                payload: payload.clone(),
                previous_results: previous.clone(),
            };

            let start = Instant::now();
            let mut output = executor.execute(ctx).await;
            let duration_ms = start.elapsed().as_millis() as u64;
            output.set_duration_ms(duration_ms);
            let snapshot = self.safety.redact(&output.to_json());

            // An operator may have failed the run while the stage was in flight
            let interrupted = match self.store.require_run(&run.run_id) {
                Ok(current) => failed_out_of_band(stage.as_str(), &current),
                Err(e) => Some(store_failure(e)),
            };
            if let Some(err) = interrupted {
                warn!(stage = %stage, attempt, error_type = %err.error_type, "Run changed while stage was in flight, discarding result");
                execution.mark_failed(err.error_type.clone(), err.message(), Some(snapshot), duration_ms);
                self.close_attempt(&execution);
                return Err(err);
            }

            if !is_failure(&output) {
                execution.mark_succeeded(snapshot, duration_ms);
                self.store
                    .update_stage_execution(&execution)
                    .map_err(store_failure)?;
                self.signals
                    .emit(&Signal::StageSucceeded { duration_ms }, &tags);
                info!(stage = %stage, attempt, duration_ms, "Stage succeeded");
                return Ok(StageRun {
                    output,
                    reused: false,
                });
            }

            let err = StageExecutionError::new(stage.as_str(), output.errors().to_vec(), output.retryable());
            execution.mark_failed(err.error_type.clone(), err.message(), Some(snapshot), duration_ms);
            self.store
                .update_stage_execution(&execution)
                .map_err(store_failure)?;
            self.signals.emit(
                &Signal::StageFailed {
                    error_type: err.error_type.clone(),
                    message: err.message(),
                    retryable: err.retryable,
                    duration_ms,
                },
                &tags,
            );

            if err.retryable && self.retry.should_retry(tries, run.max_retries) {
                let delay = self.retry.delay_for_attempt(tries);
                self.signals.emit(
                    &Signal::StageRetrying {
                        next_attempt: attempt + 1,
                        delay_ms: delay.as_millis() as u64,
                    },
                    &tags,
                );
                warn!(
                    stage = %stage,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err.message(),
                    "Stage failed, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            error!(stage = %stage, attempt, error = %err.message(), retryable = err.retryable, "Stage failed permanently");
            return Err(err);
        }
    }

    /// Advance the run past a successful stage and persist it
    fn record_stage(
        &self,
        run: &mut PipelineRun,
        outcome: StageRun,
    ) -> Result<(StageOutput, bool), StageExecutionError> {
        let stage = outcome.output.stage();
        run.advance(stage)
            .map_err(|e| stage_store_error(stage, StoreError::from(e)))?;

        match &outcome.output {
            StageOutput::Ingest(result) => {
                if let Some(incident_id) = result.incident_id {
                    run.incident_id = Some(incident_id);
                }
                if let Some(ref fingerprint) = result.alert_fingerprint {
                    run.alert_fingerprint = fingerprint.clone();
                }
            }
            StageOutput::Analyze(result) => run.analyze_fallback_used = result.fallback_used,
            _ => {}
        }
        run.set_output(stage, self.safety.redact(&outcome.output.to_json()));

        self.store
            .update_run(run)
            .map_err(|e| stage_store_error(stage, e))?;
        Ok((outcome.output, outcome.reused))
    }

    /// Persist an attempt row closed after the fact; the run error wins over this one
    fn close_attempt(&self, execution: &StageExecution) {
        if let Err(e) = self.store.update_stage_execution(execution) {
            warn!(key = %execution.idempotency_key, error = %e, "Could not close stage attempt");
        }
    }

    /// Mark the run FAILED, starting from the persisted row.
    ///
    /// The in-memory copy may be stale after an operator action; a run that
    /// is already FAILED in the store keeps the error recorded there.
    fn fail_run(
        &self,
        run: PipelineRun,
        mut err: StageExecutionError,
        progress: Progress,
        started: Instant,
    ) -> PipelineResult {
        let run = match self.store.get_run(&run.run_id) {
            Ok(Some(current)) if current.status == PipelineStatus::Failed => {
                if let Some(operator) = failed_out_of_band(&err.stage, &current) {
                    err = operator;
                }
                current
            }
            Ok(Some(current)) => self.persist_failure(current, &err),
            Ok(None) => self.persist_failure(run, &err),
            Err(e) => {
                error!(run_id = %run.run_id, error = %e, "Could not reload run before failing it");
                self.persist_failure(run, &err)
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        error!(run_id = %run.run_id, stage = %err.stage, error = %err, "Pipeline run failed");
        self.signals.emit(
            &Signal::PipelineCompleted {
                status: PipelineOutcome::Failed.as_str().to_string(),
                duration_ms,
            },
            &SignalTags::for_run(&run).with_stage(err.stage.clone()),
        );

        build_result(&run, PipelineOutcome::Failed, progress, Some(err), duration_ms)
    }

    fn persist_failure(&self, mut run: PipelineRun, err: &StageExecutionError) -> PipelineRun {
        match run.fail(err.error_type.clone(), err.message(), err.retryable) {
            Ok(()) => {
                if let Err(e) = self.store.update_run(&run) {
                    error!(run_id = %run.run_id, error = %e, "Failed to persist FAILED run");
                }
            }
            Err(e) => warn!(run_id = %run.run_id, error = %e, "Run could not be marked FAILED"),
        }
        run
    }

    fn complete_run(&self, mut run: PipelineRun, progress: Progress, started: Instant) -> PipelineResult {
        run.completed_at = Some(chrono::Utc::now());
        run.record_duration();
        run.last_error_type = None;
        run.last_error_message = None;
        run.last_error_retryable = None;
        if let Err(e) = self.store.update_run(&run) {
            error!(run_id = %run.run_id, error = %e, "Failed to persist completed run");
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(run_id = %run.run_id, duration_ms, "Pipeline run completed");
        self.signals.emit(
            &Signal::PipelineCompleted {
                status: PipelineOutcome::Completed.as_str().to_string(),
                duration_ms,
            },
            &SignalTags::for_run(&run),
        );

        build_result(&run, PipelineOutcome::Completed, progress, None, duration_ms)
    }
}

/// Errors fail a stage, except analyze errors absorbed by fallback
fn is_failure(output: &StageOutput) -> bool {
    match output {
        StageOutput::Analyze(result) if result.fallback_used => false,
        other => other.has_errors(),
    }
}

/// The error an operator recorded on a run that is FAILED in the store
fn failed_out_of_band(stage: &str, current: &PipelineRun) -> Option<StageExecutionError> {
    if current.status != PipelineStatus::Failed {
        return None;
    }
    let mut err = StageExecutionError::unexpected(
        stage,
        current
            .last_error_type
            .clone()
            .unwrap_or_else(|| FORCE_FAILED_ERROR.to_string()),
        current
            .last_error_message
            .clone()
            .unwrap_or_else(|| "failed by operator".to_string()),
    );
    err.retryable = !current.is_force_failed() && current.last_error_retryable.unwrap_or(false);
    Some(err)
}

fn stage_store_error(stage: Stage, err: StoreError) -> StageExecutionError {
    let error_type = match err {
        StoreError::RunCancelled(_) => FORCE_FAILED_ERROR,
        StoreError::DuplicateExecution(_) => "DuplicateExecution",
        StoreError::Transition(_) => "TransitionError",
        _ => "StoreError",
    };
    StageExecutionError::unexpected(stage.as_str(), error_type, err.to_string())
}

fn build_result(
    run: &PipelineRun,
    status: PipelineOutcome,
    progress: Progress,
    error: Option<StageExecutionError>,
    duration_ms: u64,
) -> PipelineResult {
    PipelineResult {
        trace_id: run.trace_id.clone(),
        run_id: run.run_id.clone(),
        status,
        stages_completed: progress.stages_completed,
        stages_reused: progress.stages_reused,
        incident_id: run.incident_id,
        alert_fingerprint: run.alert_fingerprint.clone(),
        fallback_used: run.analyze_fallback_used,
        results: progress.results,
        error,
        duration_ms,
    }
}
