//! In-process task queue for orchestrator invocations.
//!
//! `enqueue` is fire-and-forget: a job goes onto a bounded channel shared by
//! N worker tasks, and its status is published on a `watch` channel so
//! callers can poll it or `wait` for a terminal state. Delivery is
//! at-least-once: a fixed-pipeline job whose run failed with a retryable
//! error is delivered again as a `Resume` job, until `max_deliveries`
//! deliveries have been made. Finished jobs are remembered up to
//! `retain_finished` entries; older ones are forgotten once nobody waits on
//! them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::definition_orchestrator::DefinitionBasedOrchestrator;
use super::orchestrator::{PipelineOrchestrator, PipelineTrigger};

/// A unit of work for the workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// New run of the fixed pipeline
    Fixed(PipelineTrigger),

    /// Run of a stored definition (`name`) or an unsaved config
    Definition {
        name: Option<String>,
        config: Option<serde_json::Value>,
        trigger: PipelineTrigger,
    },

    /// Re-enter a failed fixed-pipeline run
    Resume {
        run_id: String,
        payload: Option<serde_json::Value>,
    },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fixed(_) => "fixed",
            Self::Definition { .. } => "definition",
            Self::Resume { .. } => "resume",
        }
    }

    /// Payload a redelivery should resume with.
    ///
    /// The stored trigger payload is redacted, so the caller's original
    /// payload is carried forward whenever the job still has it.
    fn resume_payload(&self) -> Option<serde_json::Value> {
        match self {
            Self::Fixed(trigger) => Some(trigger.payload.clone()),
            Self::Resume { payload, .. } => payload.clone(),
            Self::Definition { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded { run_id: String },
    Failed { error: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Task queue is shut down")]
    Closed,

    #[error("Unknown job: {0}")]
    UnknownJob(String),
}

/// Queue sizing and delivery policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Number of worker tasks
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Total deliveries allowed per job, including the first
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    /// Channel capacity
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Finished jobs whose status stays queryable
    #[serde(default = "default_retain_finished")]
    pub retain_finished: usize,
}

fn default_workers() -> usize {
    4
}
fn default_max_deliveries() -> u32 {
    1
}
fn default_capacity() -> usize {
    256
}
fn default_retain_finished() -> usize {
    1024
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_deliveries: default_max_deliveries(),
            capacity: default_capacity(),
            retain_finished: default_retain_finished(),
        }
    }
}

struct Envelope {
    job_id: String,
    job: Job,
    delivery: u32,
}

/// Why a job attempt failed
struct JobFailure {
    error: String,
    run_id: Option<String>,
    retryable: bool,
}

/// Status channels of known jobs
#[derive(Default)]
struct JobTable {
    statuses: HashMap<String, watch::Sender<JobStatus>>,
    /// Terminal jobs, oldest first
    finished: VecDeque<String>,
}

impl JobTable {
    /// Drop the oldest finished jobs beyond `retain` that have no waiters
    fn prune(&mut self, retain: usize) {
        let mut excess = self.finished.len().saturating_sub(retain);
        let mut idx = 0;
        while excess > 0 && idx < self.finished.len() {
            let watched = self
                .statuses
                .get(&self.finished[idx])
                .map_or(false, |tx| tx.receiver_count() > 0);
            if watched {
                idx += 1;
                continue;
            }
            if let Some(job_id) = self.finished.remove(idx) {
                self.statuses.remove(&job_id);
            }
            excess -= 1;
        }
    }
}

type Jobs = Arc<StdMutex<JobTable>>;

/// State shared by every worker
struct Shared {
    fixed: Arc<PipelineOrchestrator>,
    definitions: Arc<DefinitionBasedOrchestrator>,
    jobs: Jobs,
    max_deliveries: u32,
    retain_finished: usize,
}

impl Shared {
    fn publish(&self, job_id: &str, status: JobStatus) {
        let Ok(mut jobs) = self.jobs.lock() else {
            return;
        };
        let terminal = status.is_terminal();
        match jobs.statuses.get(job_id) {
            Some(tx) => {
                tx.send_replace(status);
            }
            None => return,
        }
        if terminal {
            jobs.finished.push_back(job_id.to_string());
            jobs.prune(self.retain_finished);
        }
    }
}

pub struct TaskQueue {
    sender: StdMutex<Option<mpsc::Sender<Envelope>>>,
    jobs: Jobs,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Spawn the workers; must be called inside a tokio runtime
    pub fn start(
        fixed: Arc<PipelineOrchestrator>,
        definitions: Arc<DefinitionBasedOrchestrator>,
        settings: QueueSettings,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.capacity.max(1));
        let receiver = Arc::new(Mutex::new(rx));
        let jobs: Jobs = Arc::new(StdMutex::new(JobTable::default()));
        let shared = Arc::new(Shared {
            fixed,
            definitions,
            jobs: jobs.clone(),
            max_deliveries: settings.max_deliveries.max(1),
            retain_finished: settings.retain_finished,
        });

        let workers = (0..settings.workers.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    receiver.clone(),
                    tx.downgrade(),
                    shared.clone(),
                ))
            })
            .collect();
        info!(workers = settings.workers.max(1), "Task queue started");

        Self {
            sender: StdMutex::new(Some(tx)),
            jobs,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a job and return its id
    pub async fn enqueue(&self, job: Job) -> Result<String, QueueError> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| QueueError::Closed)?
            .clone()
            .ok_or(QueueError::Closed)?;

        let job_id = Uuid::new_v4().to_string();
        let (status_tx, _) = watch::channel(JobStatus::Queued);
        self.jobs
            .lock()
            .map_err(|_| QueueError::Closed)?
            .statuses
            .insert(job_id.clone(), status_tx);

        debug!(job_id = %job_id, kind = job.kind(), "Enqueuing job");
        sender
            .send(Envelope {
                job_id: job_id.clone(),
                job,
                delivery: 1,
            })
            .await
            .map_err(|_| QueueError::Closed)?;
        Ok(job_id)
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        let jobs = self.jobs.lock().ok()?;
        jobs.statuses.get(job_id).map(|tx| tx.borrow().clone())
    }

    /// Wait until a job reaches a terminal status
    pub async fn wait(&self, job_id: &str) -> Result<JobStatus, QueueError> {
        let mut rx = {
            let jobs = self.jobs.lock().map_err(|_| QueueError::Closed)?;
            jobs.statuses
                .get(job_id)
                .map(|tx| tx.subscribe())
                .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?
        };

        // A closed channel leaves the last published status in place
        let _ = rx.wait_for(JobStatus::is_terminal).await;
        let status = rx.borrow().clone();
        Ok(status)
    }

    /// Stop accepting jobs and wait for queued ones to drain
    pub async fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Queue worker panicked");
            }
        }
        info!("Task queue stopped");
    }
}

async fn worker_loop(
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    redeliver: mpsc::WeakSender<Envelope>,
    shared: Arc<Shared>,
) {
    loop {
        let envelope = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        let Some(envelope) = envelope else {
            debug!(worker, "Queue closed, worker exiting");
            return;
        };

        info!(
            worker,
            job_id = %envelope.job_id,
            kind = envelope.job.kind(),
            delivery = envelope.delivery,
            "Job started"
        );
        shared.publish(&envelope.job_id, JobStatus::Running);

        match run_job(&shared, &envelope.job).await {
            Ok(run_id) => {
                info!(worker, job_id = %envelope.job_id, run_id = %run_id, "Job succeeded");
                shared.publish(&envelope.job_id, JobStatus::Succeeded { run_id });
            }
            Err(failure) => {
                let retry = match (&failure.run_id, failure.retryable) {
                    (Some(run_id), true) if envelope.delivery < shared.max_deliveries => {
                        Some(run_id.clone())
                    }
                    _ => None,
                };

                let redelivered = match (retry, redeliver.upgrade()) {
                    (Some(run_id), Some(tx)) => {
                        warn!(
                            worker,
                            job_id = %envelope.job_id,
                            run_id = %run_id,
                            delivery = envelope.delivery + 1,
                            error = %failure.error,
                            "Job failed, redelivering as resume"
                        );
                        shared.publish(&envelope.job_id, JobStatus::Queued);
                        // Never block a worker on its own queue: a full channel fails the job
                        let sent = tx.try_send(Envelope {
                            job_id: envelope.job_id.clone(),
                            job: Job::Resume {
                                run_id,
                                payload: envelope.job.resume_payload(),
                            },
                            delivery: envelope.delivery + 1,
                        });
                        if let Err(e) = &sent {
                            warn!(worker, job_id = %envelope.job_id, error = %e, "Redelivery not possible");
                        }
                        sent.is_ok()
                    }
                    _ => false,
                };

                if !redelivered {
                    error!(worker, job_id = %envelope.job_id, error = %failure.error, "Job failed");
                    shared.publish(
                        &envelope.job_id,
                        JobStatus::Failed {
                            error: failure.error,
                        },
                    );
                }
            }
        }
    }
}

async fn run_job(shared: &Shared, job: &Job) -> Result<String, JobFailure> {
    let outcome = match job {
        Job::Fixed(trigger) => shared.fixed.run_pipeline(trigger.clone()).await,
        Job::Resume { run_id, payload } => {
            shared.fixed.resume_pipeline(run_id, payload.clone()).await
        }
        Job::Definition {
            name,
            config,
            trigger,
        } => {
            let result = match (name, config) {
                (Some(name), _) => shared.definitions.run_definition(name, trigger.clone()).await,
                (None, Some(config)) => shared.definitions.run_config(config, trigger.clone()).await,
                (None, None) => {
                    return Err(JobFailure {
                        error: "definition job needs a name or a config".to_string(),
                        run_id: None,
                        retryable: false,
                    })
                }
            };
            return match result {
                Ok(result) if result.succeeded() => Ok(result.run_id),
                Ok(result) => Err(JobFailure {
                    error: result
                        .error
                        .unwrap_or_else(|| format!("definition run {}", result.status)),
                    run_id: Some(result.run_id),
                    retryable: false,
                }),
                Err(e) => Err(JobFailure {
                    error: e.to_string(),
                    run_id: None,
                    retryable: false,
                }),
            };
        }
    };

    let result = outcome.map_err(|e| JobFailure {
        retryable: e.is_retryable(),
        error: e.to_string(),
        run_id: None,
    })?;

    let run_id = result.run_id.clone();
    result.into_result().map(|r| r.run_id).map_err(|e| JobFailure {
        error: e.to_string(),
        run_id: Some(run_id),
        retryable: e.retryable,
    })
}
