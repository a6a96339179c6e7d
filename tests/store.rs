//! Store Persistence Integration Tests
//!
//! Runs recorded in an on-disk database must survive reopening it, so a
//! restarted process can inspect and resume them.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use respondr::adapters::Collaborators;
use respondr::core::{
    ExecutorSet, ExecutorSettings, NoopSignalEmitter, OrchestratorError, PipelineOrchestrator,
    PipelineTrigger, RetryPolicy, RunFilter, Store, StoreError,
};
use respondr::domain::{
    PipelineRun, PipelineStatus, Stage, StageExecution, StageStatus, STALE_RUN_ERROR,
};

fn orchestrator(store: Store, settings: ExecutorSettings) -> PipelineOrchestrator {
    let executors = ExecutorSet::from_collaborators(&Collaborators::local(), &settings);
    PipelineOrchestrator::new(store, executors, Arc::new(NoopSignalEmitter))
        .with_retry_policy(RetryPolicy::new(2, 0.0))
}

#[test]
fn test_runs_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("runs.db");

    let run_id = {
        let store = Store::open(&db_path).unwrap();
        let run = store
            .create_run(&PipelineRun::new("trace-1", "manual", "production", "fp", 3))
            .unwrap();
        let mut execution = store
            .create_stage_execution(&StageExecution::new(run.id, &run.run_id, "INGEST", 1))
            .unwrap();
        execution.mark_succeeded(json!({"alerts_created": 1}), 5);
        store.update_stage_execution(&execution).unwrap();
        run.run_id
    };

    let store = Store::open(&db_path).unwrap();
    let run = store.require_run(&run_id).unwrap();
    assert_eq!(run.trace_id, "trace-1");
    assert_eq!(run.status, PipelineStatus::Pending);

    let succeeded = store.succeeded_execution(run.id, "INGEST").unwrap().unwrap();
    assert_eq!(succeeded.output_snapshot, Some(json!({"alerts_created": 1})));
    assert_eq!(store.max_attempt(run.id, "INGEST").unwrap(), 1);
    assert_eq!(store.max_attempt(run.id, "CHECK").unwrap(), 0);
}

#[test]
fn test_idempotency_key_is_unique_across_handles() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("runs.db");

    let first = Store::open(&db_path).unwrap();
    let second = Store::open(&db_path).unwrap();

    let run = first
        .create_run(&PipelineRun::new("trace-2", "manual", "production", "fp", 3))
        .unwrap();
    first
        .create_stage_execution(&StageExecution::new(run.id, &run.run_id, "CHECK", 1))
        .unwrap();

    let err = second
        .create_stage_execution(&StageExecution::new(run.id, &run.run_id, "CHECK", 1))
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateExecution(_)));
}

#[tokio::test]
async fn test_resume_after_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("runs.db");

    // First process: notify driver is misconfigured, run fails at NOTIFY
    let failed = {
        let settings = ExecutorSettings {
            default_driver: "pager".to_string(),
            ..Default::default()
        };
        let orchestrator = orchestrator(Store::open(&db_path).unwrap(), settings);
        orchestrator
            .run_pipeline(PipelineTrigger::new(json!({"alerts": []})))
            .await
            .unwrap()
    };
    assert!(!failed.is_completed());
    assert_eq!(failed.error.as_ref().unwrap().stage, "NOTIFY");

    // Second process: fixed configuration, same database
    let store = Store::open(&db_path).unwrap();
    let orchestrator = orchestrator(store.clone(), ExecutorSettings::default());
    let resumed = orchestrator.resume_pipeline(&failed.run_id, None).await.unwrap();

    assert!(resumed.is_completed());
    assert_eq!(resumed.stages_reused, vec![Stage::Ingest, Stage::Check, Stage::Analyze]);

    let run = store.require_run(&failed.run_id).unwrap();
    assert_eq!(run.status, PipelineStatus::Notified);
    assert!(run.last_error_type.is_none());

    let notify_attempts: Vec<u32> = store
        .stage_executions(run.id)
        .unwrap()
        .into_iter()
        .filter(|e| e.stage == "NOTIFY")
        .map(|e| e.attempt)
        .collect();
    assert_eq!(notify_attempts, vec![1, 2]);
}

#[tokio::test]
async fn test_list_runs_by_status_and_trace() {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::open(temp_dir.path().join("runs.db")).unwrap();
    let orchestrator = orchestrator(store.clone(), ExecutorSettings::default());

    for trace in ["alpha", "beta", "beta"] {
        orchestrator
            .run_pipeline(PipelineTrigger::new(json!({"alerts": []})).with_trace_id(trace))
            .await
            .unwrap();
    }
    let alpha = store
        .list_runs(&RunFilter {
            trace_id: Some("alpha".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(alpha.len(), 1);

    // A completed run is terminal and cannot be force-failed
    let err = store.force_fail_run(&alpha[0].run_id, "manual stop").unwrap_err();
    assert!(matches!(err, StoreError::Transition(_)));

    let beta = store
        .list_runs(&RunFilter {
            trace_id: Some("beta".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(beta.len(), 2);
    assert!(beta[0].id > beta[1].id, "most recent first");

    let notified = store
        .list_runs(&RunFilter {
            status: Some(PipelineStatus::Notified),
            limit: 2,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(notified.len(), 2);
}

/// Leave a run the way a worker that died during ANALYZE would
fn crashed_during_analyze(store: &Store) -> PipelineRun {
    let mut run = store
        .create_run(&PipelineRun::new("trace-crash", "manual", "production", "fp", 3))
        .unwrap();

    for stage in [Stage::Ingest, Stage::Check] {
        let mut execution = store
            .create_stage_execution(&StageExecution::new(run.id, &run.run_id, stage.as_str(), 1))
            .unwrap();
        execution.mark_succeeded(json!({}), 1);
        store.update_stage_execution(&execution).unwrap();
        run.advance(stage).unwrap();
        store.update_run(&run).unwrap();
    }

    let mut analyze = store
        .create_stage_execution(&StageExecution::new(run.id, &run.run_id, "ANALYZE", 1))
        .unwrap();
    analyze.mark_running();
    store.update_stage_execution(&analyze).unwrap();
    run
}

#[tokio::test]
async fn test_crashed_run_can_be_failed_and_resumed() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("runs.db");
    let run = crashed_during_analyze(&Store::open(&db_path).unwrap());

    // Restarted process
    let store = Store::open(&db_path).unwrap();
    let orchestrator = orchestrator(store.clone(), ExecutorSettings::default());

    let err = orchestrator.resume_pipeline(&run.run_id, None).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::NotResumable {
            status: PipelineStatus::Checked,
            ..
        }
    ));

    let failed = store.fail_stale_run(&run.run_id, "worker lost").unwrap();
    assert_eq!(failed.status, PipelineStatus::Failed);
    assert_eq!(failed.last_error_type.as_deref(), Some(STALE_RUN_ERROR));
    assert!(!failed.is_force_failed());

    let orphan = store
        .stage_executions(run.id)
        .unwrap()
        .into_iter()
        .find(|e| e.stage == "ANALYZE")
        .unwrap();
    assert_eq!(orphan.status, StageStatus::Failed);
    assert_eq!(orphan.error_message.as_deref(), Some("worker lost"));

    let resumed = orchestrator.resume_pipeline(&run.run_id, None).await.unwrap();
    assert!(resumed.is_completed());
    assert_eq!(resumed.stages_reused, vec![Stage::Ingest, Stage::Check]);

    let analyze_attempts: Vec<(u32, StageStatus)> = store
        .stage_executions(run.id)
        .unwrap()
        .into_iter()
        .filter(|e| e.stage == "ANALYZE")
        .map(|e| (e.attempt, e.status))
        .collect();
    assert_eq!(
        analyze_attempts,
        vec![(1, StageStatus::Failed), (2, StageStatus::Succeeded)]
    );
}

#[test]
fn test_cancelled_run_cannot_be_marked_stale() {
    let store = Store::in_memory().unwrap();
    let run = crashed_during_analyze(&store);

    store.force_fail_run(&run.run_id, "stop").unwrap();
    let err = store.fail_stale_run(&run.run_id, "worker lost").unwrap_err();
    assert!(matches!(err, StoreError::RunCancelled(_)));
}
