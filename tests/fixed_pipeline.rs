//! Fixed Pipeline Integration Tests
//!
//! End-to-end runs of INGEST -> CHECK -> ANALYZE -> NOTIFY against an
//! in-memory store, with scripted executors standing in for stages.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use respondr::adapters::{Collaborators, IncidentSummary, ProviderRegistry, RecommendationProvider};
use respondr::core::{
    ExecutorSet, ExecutorSettings, MetricsSignalEmitter, OrchestratorError, PipelineOrchestrator,
    PipelineTrigger, RetryPolicy, StageExecutor, Store,
};
use respondr::domain::{
    CheckResult, IngestResult, PipelineOutcome, PipelineStatus, Recommendation, Stage,
    StageContext, StageOutput, StageStatus, FORCE_FAILED_ERROR,
};

/// Executor that fails its first `failures` calls
struct ScriptedExecutor {
    stage: Stage,
    failures: u32,
    fatal: bool,
    calls: AtomicU32,
}

impl ScriptedExecutor {
    fn failing(stage: Stage, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            stage,
            failures,
            fatal: false,
            calls: AtomicU32::new(0),
        })
    }

    fn fatal(stage: Stage) -> Arc<Self> {
        Arc::new(Self {
            stage,
            failures: u32::MAX,
            fatal: true,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

fn dynamic(executor: &Arc<ScriptedExecutor>) -> Arc<dyn StageExecutor> {
    executor.clone()
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, _ctx: StageContext) -> StageOutput {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let errors = if call <= self.failures {
            vec![format!("{} error: attempt {} failed", self.stage, call)]
        } else {
            Vec::new()
        };

        match self.stage {
            Stage::Ingest => StageOutput::Ingest(IngestResult {
                alerts_created: 1,
                incident_id: Some(7),
                errors,
                fatal: self.fatal,
                ..Default::default()
            }),
            _ => StageOutput::Check(CheckResult {
                checks_run: 1,
                errors,
                fatal: self.fatal,
                ..Default::default()
            }),
        }
    }
}

/// Provider that always errors
struct BrokenProvider;

#[async_trait]
impl RecommendationProvider for BrokenProvider {
    fn name(&self) -> &str {
        "broken"
    }

    async fn analyze(&self, _incident: Option<&IncidentSummary>) -> anyhow::Result<Vec<Recommendation>> {
        anyhow::bail!("provider unavailable")
    }
}

struct Harness {
    store: Store,
    metrics: Arc<MetricsSignalEmitter>,
    orchestrator: PipelineOrchestrator,
}

fn harness_with(
    collaborators: Collaborators,
    settings: ExecutorSettings,
    overrides: Vec<Arc<dyn StageExecutor>>,
) -> Harness {
    let store = Store::in_memory().unwrap();
    let metrics = Arc::new(MetricsSignalEmitter::new());
    let executors = overrides
        .into_iter()
        .fold(ExecutorSet::from_collaborators(&collaborators, &settings), |set, executor| {
            set.with_executor(executor)
        });
    let orchestrator = PipelineOrchestrator::new(store.clone(), executors, metrics.clone())
        .with_retry_policy(RetryPolicy::new(3, 0.0));
    Harness {
        store,
        metrics,
        orchestrator,
    }
}

fn harness(overrides: Vec<Arc<dyn StageExecutor>>) -> Harness {
    harness_with(Collaborators::local(), ExecutorSettings::default(), overrides)
}

fn alert_payload() -> serde_json::Value {
    json!({
        "alerts": [{
            "name": "HighErrorRate",
            "severity": "critical",
            "status": "firing",
            "labels": {"service": "checkout"}
        }]
    })
}

#[tokio::test]
async fn test_full_run_completes_and_records_each_stage() {
    let h = harness(vec![]);
    let result = h
        .orchestrator
        .run_pipeline(PipelineTrigger::new(alert_payload()).with_trace_id("trace-42"))
        .await
        .unwrap();

    assert_eq!(result.status, PipelineOutcome::Completed);
    assert_eq!(result.trace_id, "trace-42");
    assert_eq!(result.stages_completed, Stage::ALL.to_vec());
    assert!(result.stages_reused.is_empty());
    assert!(result.incident_id.is_some());
    for stage in Stage::ALL {
        assert!(result.results.contains_key(stage.result_key()), "missing {}", stage);
    }

    let run = h.store.require_run(&result.run_id).unwrap();
    assert_eq!(run.status, PipelineStatus::Notified);
    assert_eq!(run.current_stage, Some(Stage::Notify));
    assert_eq!(run.incident_id, result.incident_id);
    assert!(run.completed_at.is_some());
    assert!(run.last_error_type.is_none());

    let rows = h.store.stage_executions(run.id).unwrap();
    assert_eq!(rows.len(), 4);
    for (row, stage) in rows.iter().zip(Stage::ALL) {
        assert_eq!(row.stage, stage.as_str());
        assert_eq!(row.status, StageStatus::Succeeded);
        assert_eq!(row.idempotency_key, format!("{}:{}:1", run.run_id, stage.as_str()));
        assert!(row.output_snapshot.is_some());
    }
}

#[tokio::test]
async fn test_signals_are_emitted_in_order() {
    let h = harness(vec![]);
    h.orchestrator
        .run_pipeline(PipelineTrigger::new(json!({"alerts": []})))
        .await
        .unwrap();

    let mut expected = vec!["pipeline.started"];
    for _ in Stage::ALL {
        expected.push("pipeline.stage.started");
        expected.push("pipeline.stage.succeeded");
    }
    expected.push("pipeline.completed");

    assert_eq!(h.metrics.event_names(), expected);
    assert_eq!(h.metrics.counter("pipeline.completed.completed"), 1);
    assert_eq!(h.metrics.timings("pipeline.stage.succeeded.CHECK.duration_ms").len(), 1);

    let events = h.metrics.events();
    let check_started = &events[3];
    assert_eq!(check_started.tags.stage, "CHECK");
    assert_eq!(check_started.tags.attempt, 1);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let check = ScriptedExecutor::failing(Stage::Check, 2);
    let h = harness(vec![dynamic(&check)]);

    let result = h
        .orchestrator
        .run_pipeline(PipelineTrigger::new(json!({"alerts": []})))
        .await
        .unwrap();

    assert!(result.is_completed());
    assert_eq!(check.calls(), 3);
    assert_eq!(h.metrics.counter("pipeline.stage.retrying"), 2);

    let run = h.store.require_run(&result.run_id).unwrap();
    assert_eq!(run.total_attempts, 6);

    let attempts: Vec<(u32, StageStatus)> = h
        .store
        .stage_executions(run.id)
        .unwrap()
        .into_iter()
        .filter(|e| e.stage == "CHECK")
        .map(|e| (e.attempt, e.status))
        .collect();
    assert_eq!(
        attempts,
        vec![
            (1, StageStatus::Failed),
            (2, StageStatus::Failed),
            (3, StageStatus::Succeeded)
        ]
    );
}

#[tokio::test]
async fn test_retry_exhaustion_fails_run() {
    let check = ScriptedExecutor::failing(Stage::Check, u32::MAX);
    let h = harness(vec![dynamic(&check)]);

    let result = h
        .orchestrator
        .run_pipeline(PipelineTrigger::new(json!({"alerts": []})))
        .await
        .unwrap();

    assert_eq!(result.status, PipelineOutcome::Failed);
    assert_eq!(result.stages_completed, vec![Stage::Ingest]);
    assert_eq!(check.calls(), 3);

    let err = result.error.clone().unwrap();
    assert_eq!(err.stage, "CHECK");
    assert!(err.retryable);

    let run = h.store.require_run(&result.run_id).unwrap();
    assert_eq!(run.status, PipelineStatus::Failed);
    assert_eq!(run.last_error_type.as_deref(), Some("StageExecutionError"));
    assert_eq!(run.last_error_retryable, Some(true));
    assert_eq!(h.metrics.counter("pipeline.completed.failed"), 1);

    assert!(result.into_result().is_err());
}

#[tokio::test]
async fn test_fatal_failure_is_not_retried() {
    let check = ScriptedExecutor::fatal(Stage::Check);
    let h = harness(vec![dynamic(&check)]);

    let result = h
        .orchestrator
        .run_pipeline(PipelineTrigger::new(json!({"alerts": []})))
        .await
        .unwrap();

    assert_eq!(result.status, PipelineOutcome::Failed);
    assert_eq!(check.calls(), 1);
    assert!(!result.error.unwrap().retryable);
    assert_eq!(h.metrics.counter("pipeline.stage.retrying"), 0);
}

#[tokio::test]
async fn test_trigger_max_retries_overrides_policy() {
    let check = ScriptedExecutor::failing(Stage::Check, u32::MAX);
    let h = harness(vec![dynamic(&check)]);

    let result = h
        .orchestrator
        .run_pipeline(PipelineTrigger::new(json!({"alerts": []})).with_max_retries(1))
        .await
        .unwrap();

    assert!(!result.is_completed());
    assert_eq!(check.calls(), 1);
}

#[tokio::test]
async fn test_resume_reuses_succeeded_stages() {
    let ingest = ScriptedExecutor::failing(Stage::Ingest, 0);
    let check = ScriptedExecutor::failing(Stage::Check, 3);
    let h = harness(vec![dynamic(&ingest), dynamic(&check)]);

    let failed = h
        .orchestrator
        .run_pipeline(PipelineTrigger::new(json!({"alerts": []})))
        .await
        .unwrap();
    assert_eq!(failed.status, PipelineOutcome::Failed);
    assert_eq!(ingest.calls(), 1);

    let resumed = h
        .orchestrator
        .resume_pipeline(&failed.run_id, None)
        .await
        .unwrap();

    assert!(resumed.is_completed());
    assert_eq!(resumed.run_id, failed.run_id);
    assert_eq!(resumed.stages_reused, vec![Stage::Ingest]);
    assert_eq!(resumed.stages_completed, Stage::ALL.to_vec());
    assert_eq!(resumed.incident_id, Some(7));
    assert_eq!(ingest.calls(), 1, "INGEST must not run again");

    let run = h.store.require_run(&failed.run_id).unwrap();
    let rows = h.store.stage_executions(run.id).unwrap();
    let ingest_rows = rows.iter().filter(|e| e.stage == "INGEST").count();
    let check_attempts: Vec<u32> = rows
        .iter()
        .filter(|e| e.stage == "CHECK")
        .map(|e| e.attempt)
        .collect();
    assert_eq!(ingest_rows, 1);
    assert_eq!(check_attempts, vec![1, 2, 3, 4]);
    assert_eq!(run.status, PipelineStatus::Notified);
}

#[tokio::test]
async fn test_resume_refuses_completed_and_unknown_runs() {
    let h = harness(vec![]);
    let result = h
        .orchestrator
        .run_pipeline(PipelineTrigger::new(json!({"alerts": []})))
        .await
        .unwrap();

    let err = h.orchestrator.resume_pipeline(&result.run_id, None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotResumable { .. }));

    let err = h.orchestrator.resume_pipeline("no-such-run", None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::RunNotFound(_)));
}

#[tokio::test]
async fn test_analyze_fallback_keeps_run_going() {
    let collaborators = Collaborators::local()
        .with_providers(ProviderRegistry::new().register(Arc::new(BrokenProvider)));
    let h = harness_with(collaborators, ExecutorSettings::default(), vec![]);

    let result = h
        .orchestrator
        .run_pipeline(PipelineTrigger::new(alert_payload()))
        .await
        .unwrap();

    assert!(result.is_completed());
    assert!(result.fallback_used);
    assert_eq!(result.results["analyze"]["fallback_used"], true);

    let run = h.store.require_run(&result.run_id).unwrap();
    assert!(run.analyze_fallback_used);
}

#[tokio::test]
async fn test_analyze_failure_without_fallback() {
    let collaborators = Collaborators::local()
        .with_providers(ProviderRegistry::new().register(Arc::new(BrokenProvider)));
    let settings = ExecutorSettings {
        fallback_enabled: false,
        ..Default::default()
    };
    let h = harness_with(collaborators, settings, vec![]);

    let result = h
        .orchestrator
        .run_pipeline(PipelineTrigger::new(alert_payload()))
        .await
        .unwrap();

    assert_eq!(result.status, PipelineOutcome::Failed);
    assert_eq!(result.error.unwrap().stage, "ANALYZE");
    assert_eq!(result.stages_completed, vec![Stage::Ingest, Stage::Check]);
}

/// Check executor that force-fails its own run before reporting an error
struct ForceFailingExecutor {
    store: Store,
}

#[async_trait]
impl StageExecutor for ForceFailingExecutor {
    fn stage(&self) -> Stage {
        Stage::Check
    }

    fn name(&self) -> &str {
        "force-failing"
    }

    async fn execute(&self, ctx: StageContext) -> StageOutput {
        self.store
            .force_fail_run(&ctx.run_id, "operator stopped the run")
            .unwrap();
        StageOutput::Check(CheckResult {
            errors: vec!["Check error: interrupted".to_string()],
            ..Default::default()
        })
    }
}

#[tokio::test]
async fn test_force_fail_stops_run_and_blocks_resume() {
    let store = Store::in_memory().unwrap();
    let metrics = Arc::new(MetricsSignalEmitter::new());
    let executors = ExecutorSet::from_collaborators(&Collaborators::local(), &ExecutorSettings::default())
        .with_executor(Arc::new(ForceFailingExecutor { store: store.clone() }));
    let orchestrator = PipelineOrchestrator::new(store.clone(), executors, metrics.clone())
        .with_retry_policy(RetryPolicy::new(3, 0.0));

    let result = orchestrator
        .run_pipeline(PipelineTrigger::new(json!({"alerts": []})))
        .await
        .unwrap();

    assert_eq!(result.status, PipelineOutcome::Failed);
    assert_eq!(result.error.as_ref().unwrap().error_type, FORCE_FAILED_ERROR);

    let run = store.require_run(&result.run_id).unwrap();
    assert!(run.is_force_failed());
    assert_eq!(run.last_error_message.as_deref(), Some("operator stopped the run"));

    // Only the attempt that was in flight ran
    let check_rows = store
        .stage_executions(run.id)
        .unwrap()
        .into_iter()
        .filter(|e| e.stage == "CHECK")
        .count();
    assert_eq!(check_rows, 1);

    let err = orchestrator.resume_pipeline(&result.run_id, None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled(_)));
}

#[tokio::test]
async fn test_secrets_are_redacted_in_persisted_payload() {
    let h = harness(vec![]);
    let result = h
        .orchestrator
        .run_pipeline(PipelineTrigger::new(json!({
            "alerts": [],
            "notify_config": {"api_key": "sk-live-123"}
        })))
        .await
        .unwrap();

    let run = h.store.require_run(&result.run_id).unwrap();
    let stored = serde_json::to_string(&run.trigger_payload).unwrap();
    assert!(!stored.contains("sk-live-123"));
}

/// Check executor that is force-failed while in flight and then succeeds
struct CancelledInFlight {
    store: Store,
}

#[async_trait]
impl StageExecutor for CancelledInFlight {
    fn stage(&self) -> Stage {
        Stage::Check
    }

    fn name(&self) -> &str {
        "cancelled-in-flight"
    }

    async fn execute(&self, ctx: StageContext) -> StageOutput {
        self.store.force_fail_run(&ctx.run_id, "operator abort").unwrap();
        StageOutput::Check(CheckResult::default())
    }
}

#[tokio::test]
async fn test_force_fail_during_successful_stage_is_kept() {
    let store = Store::in_memory().unwrap();
    let executors = ExecutorSet::from_collaborators(&Collaborators::local(), &ExecutorSettings::default())
        .with_executor(Arc::new(CancelledInFlight { store: store.clone() }));
    let orchestrator = PipelineOrchestrator::new(store.clone(), executors, Arc::new(MetricsSignalEmitter::new()))
        .with_retry_policy(RetryPolicy::new(3, 0.0));

    let result = orchestrator
        .run_pipeline(PipelineTrigger::new(json!({"alerts": []})))
        .await
        .unwrap();

    assert_eq!(result.status, PipelineOutcome::Failed);
    assert_eq!(result.stages_completed, vec![Stage::Ingest]);
    assert_eq!(result.error.as_ref().unwrap().error_type, FORCE_FAILED_ERROR);

    let run = store.require_run(&result.run_id).unwrap();
    assert!(run.is_force_failed());
    assert_eq!(run.status, PipelineStatus::Failed);
    assert_eq!(run.last_error_message.as_deref(), Some("operator abort"));

    // The in-flight attempt is closed, not left RUNNING or SUCCEEDED
    let check = store
        .stage_executions(run.id)
        .unwrap()
        .into_iter()
        .find(|e| e.stage == "CHECK")
        .unwrap();
    assert_eq!(check.status, StageStatus::Failed);
    assert_eq!(check.error_type.as_deref(), Some(FORCE_FAILED_ERROR));
    assert!(store.succeeded_execution(run.id, "CHECK").unwrap().is_none());

    let err = orchestrator.resume_pipeline(&result.run_id, None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled(_)));
}

/// Accept one HTTP request and answer 200
async fn serve_one_ok(listener: TcpListener) -> String {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut request = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buf[..n]);

        let text = String::from_utf8_lossy(&request).to_string();
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if request.len() >= end + 4 + length {
                break;
            }
        }
    }

    socket
        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nx-message-id: msg-1\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();
    String::from_utf8_lossy(&request).to_string()
}

#[tokio::test]
async fn test_generic_webhook_delivery_completes_run() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_one_ok(listener));

    let settings = ExecutorSettings {
        default_driver: "generic".to_string(),
        default_notify_config: json!({"endpoint": format!("http://{}/incidents", addr)}),
        ..Default::default()
    };
    let h = harness_with(Collaborators::local(), settings, vec![]);

    let result = h
        .orchestrator
        .run_pipeline(PipelineTrigger::new(alert_payload()))
        .await
        .unwrap();

    assert_eq!(result.status, PipelineOutcome::Completed);
    assert_eq!(result.stages_completed, Stage::ALL.to_vec());

    let notify = &result.results[Stage::Notify.result_key()];
    assert_eq!(notify["notifications_sent"], 1);
    assert_eq!(notify["deliveries"][0]["driver"], "generic");
    assert_eq!(notify["deliveries"][0]["status"], "sent");
    assert_eq!(notify["deliveries"][0]["provider_id"], "msg-1");

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /incidents"));
    assert!(request.contains(&result.run_id));

    let run = h.store.require_run(&result.run_id).unwrap();
    assert_eq!(run.status, PipelineStatus::Notified);
}
