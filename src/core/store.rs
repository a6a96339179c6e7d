//! SQLite-backed store for runs, stage executions and definitions.
//!
//! The store is the single source of truth: the orchestrators keep no
//! authoritative state in memory between stage boundaries. Uniqueness of
//! `(pipeline_run_id, stage, attempt)` and of the idempotency key is enforced
//! by the schema, so duplicate attempts surface as
//! [`StoreError::DuplicateExecution`].

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

use crate::domain::{
    PipelineDefinition, PipelineRun, PipelineStatus, StageExecution, StageStatus, TransitionError,
    FORCE_FAILED_ERROR, STALE_RUN_ERROR,
};

const SCHEMA_VERSION: i64 = 2;

const RUN_COLUMNS: &str = "id, trace_id, run_id, status, current_stage, total_attempts, max_retries, \
     source, environment, alert_fingerprint, incident_id, definition_name, definition_version, \
     trigger_payload, ingest_output, check_output, analyze_output, notify_output, analyze_fallback_used, \
     last_error_type, last_error_message, last_error_retryable, \
     created_at, started_at, completed_at, updated_at, total_duration_ms";

const EXECUTION_COLUMNS: &str = "id, pipeline_run_id, stage, status, attempt, idempotency_key, \
     output_snapshot, error_type, error_message, started_at, completed_at, duration_ms";

const DEFINITION_COLUMNS: &str =
    "id, name, description, version, config, is_active, created_at, updated_at";

/// Errors that can occur in the store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Duplicate stage execution: {0}")]
    DuplicateExecution(String),

    #[error("Duplicate run id: {0}")]
    DuplicateRun(String),

    #[error("Pipeline run not found: {0}")]
    RunNotFound(String),

    #[error("Pipeline run {0} was force-failed by an operator")]
    RunCancelled(String),

    #[error("Stage execution not found: {0}")]
    ExecutionNotFound(i64),

    #[error("Stage execution {key} is already {status} and cannot change")]
    ImmutableExecution { key: String, status: StageStatus },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Pipeline definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Schema version {found} is newer than supported {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Filter for listing runs
#[derive(Debug, Clone)]
pub struct RunFilter {
    pub status: Option<PipelineStatus>,
    pub trace_id: Option<String>,
    pub limit: usize,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            status: None,
            trace_id: None,
            limit: 20,
        }
    }
}

/// Shared handle to the relational store
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) a database file and apply migrations
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );",
        )?;

        let current: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |r| r.get(0),
        )?;
        if current > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }
        if current < 1 {
            apply_migration_v1(&conn)?;
            record_migration(&conn, 1, "runs_and_stage_executions")?;
        }
        if current < 2 {
            apply_migration_v2(&conn)?;
            record_migration(&conn, 2, "pipeline_definitions")?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pipeline runs
    // ------------------------------------------------------------------

    /// Insert a new run; returns it with its row id assigned
    pub fn create_run(&self, run: &PipelineRun) -> Result<PipelineRun, StoreError> {
        let conn = self.conn()?;
        let insert = conn.execute(
            "INSERT INTO pipeline_runs (
                trace_id, run_id, status, current_stage, total_attempts, max_retries,
                source, environment, alert_fingerprint, incident_id, definition_name,
                definition_version, trigger_payload, ingest_output, check_output, analyze_output,
                notify_output, analyze_fallback_used, last_error_type, last_error_message,
                last_error_retryable, created_at, started_at, completed_at, updated_at,
                total_duration_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                      ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)",
            params![
                run.trace_id,
                run.run_id,
                run.status.as_str(),
                run.current_stage.map(|s| s.as_str()),
                run.total_attempts,
                run.max_retries,
                run.source,
                run.environment,
                run.alert_fingerprint,
                run.incident_id,
                run.definition_name,
                run.definition_version,
                json_text(&run.trigger_payload)?,
                json_text(&run.ingest_output)?,
                json_text(&run.check_output)?,
                json_text(&run.analyze_output)?,
                json_text(&run.notify_output)?,
                run.analyze_fallback_used,
                run.last_error_type,
                run.last_error_message,
                run.last_error_retryable,
                run.created_at.to_rfc3339(),
                run.started_at.map(|t| t.to_rfc3339()),
                run.completed_at.map(|t| t.to_rfc3339()),
                run.updated_at.to_rfc3339(),
                run.total_duration_ms.map(|d| d as i64),
            ],
        );

        match insert {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::DuplicateRun(run.run_id.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        let mut created = run.clone();
        created.id = conn.last_insert_rowid();
        debug!(run_id = %created.run_id, id = created.id, "Created pipeline run");
        Ok(created)
    }

    /// Load a run by its run id
    pub fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>, StoreError> {
        let conn = self.conn()?;
        let run = conn
            .query_row(
                &format!("SELECT {} FROM pipeline_runs WHERE run_id = ?1", RUN_COLUMNS),
                params![run_id],
                map_run,
            )
            .optional()?;
        Ok(run)
    }

    /// Load a run, failing if it does not exist
    pub fn require_run(&self, run_id: &str) -> Result<PipelineRun, StoreError> {
        self.get_run(run_id)?
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }

    /// Persist all mutable columns of a run.
    ///
    /// The status move is validated against the persisted row, not the
    /// caller's copy, so two writers cannot walk the state machine backwards.
    pub fn update_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let persisted: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT status, last_error_type FROM pipeline_runs WHERE run_id = ?1",
                params![run.run_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (persisted, last_error_type) =
            persisted.ok_or_else(|| StoreError::RunNotFound(run.run_id.clone()))?;
        let persisted = PipelineStatus::from_str(&persisted).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
        })?;

        // A force-failed row is only ever rewritten by another force-fail
        let cancelled = persisted == PipelineStatus::Failed
            && last_error_type.as_deref() == Some(FORCE_FAILED_ERROR);
        if cancelled && !run.is_force_failed() {
            return Err(StoreError::RunCancelled(run.run_id.clone()));
        }

        if !run.transition_allowed(persisted, run.status) {
            return Err(TransitionError {
                from: persisted,
                to: run.status,
            }
            .into());
        }

        tx.execute(
            "UPDATE pipeline_runs SET
                status = ?2, current_stage = ?3, total_attempts = ?4, max_retries = ?5,
                alert_fingerprint = ?6, incident_id = ?7,
                ingest_output = ?8, check_output = ?9, analyze_output = ?10, notify_output = ?11,
                analyze_fallback_used = ?12, last_error_type = ?13, last_error_message = ?14,
                last_error_retryable = ?15, started_at = ?16, completed_at = ?17,
                updated_at = ?18, total_duration_ms = ?19
             WHERE run_id = ?1",
            params![
                run.run_id,
                run.status.as_str(),
                run.current_stage.map(|s| s.as_str()),
                run.total_attempts,
                run.max_retries,
                run.alert_fingerprint,
                run.incident_id,
                json_text(&run.ingest_output)?,
                json_text(&run.check_output)?,
                json_text(&run.analyze_output)?,
                json_text(&run.notify_output)?,
                run.analyze_fallback_used,
                run.last_error_type,
                run.last_error_message,
                run.last_error_retryable,
                run.started_at.map(|t| t.to_rfc3339()),
                run.completed_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
                run.total_duration_ms.map(|d| d as i64),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// List runs, most recent first
    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<PipelineRun>, StoreError> {
        let mut sql = format!("SELECT {} FROM pipeline_runs WHERE 1 = 1", RUN_COLUMNS);
        let mut values: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            values.push(status.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", values.len()));
        }
        if let Some(ref trace_id) = filter.trace_id {
            values.push(trace_id.clone());
            sql.push_str(&format!(" AND trace_id = ?{}", values.len()));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", filter.limit));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), map_run)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Operator action: fail a run out of band.
    ///
    /// An in-flight orchestrator checks for this before each attempt and
    /// stops; resume refuses force-failed runs.
    pub fn force_fail_run(&self, run_id: &str, reason: &str) -> Result<PipelineRun, StoreError> {
        let mut run = self.require_run(run_id)?;
        if run.status != PipelineStatus::Failed {
            run.transition(PipelineStatus::Failed)?;
        }
        run.last_error_type = Some(FORCE_FAILED_ERROR.to_string());
        run.last_error_message = Some(reason.to_string());
        run.last_error_retryable = Some(false);
        run.completed_at = Some(Utc::now());
        self.update_run(&run)?;
        Ok(run)
    }

    /// Operator action: fail a run whose worker died mid-flight.
    ///
    /// Unlike [`Store::force_fail_run`] the run stays resumable. Attempt rows
    /// left PENDING or RUNNING by the dead worker are closed as FAILED.
    pub fn fail_stale_run(&self, run_id: &str, reason: &str) -> Result<PipelineRun, StoreError> {
        let mut run = self.require_run(run_id)?;
        if run.is_force_failed() {
            return Err(StoreError::RunCancelled(run_id.to_string()));
        }
        run.fail(STALE_RUN_ERROR, reason, true)?;
        self.update_run(&run)?;

        let closed = self.close_open_executions(run.id, STALE_RUN_ERROR, reason)?;
        debug!(run_id, closed, "Closed open stage executions of stale run");
        Ok(run)
    }

    // ------------------------------------------------------------------
    // Stage executions
    // ------------------------------------------------------------------

    /// Insert a new attempt row; duplicates violate the uniqueness constraints
    pub fn create_stage_execution(
        &self,
        execution: &StageExecution,
    ) -> Result<StageExecution, StoreError> {
        let conn = self.conn()?;
        let insert = conn.execute(
            "INSERT INTO stage_executions (
                pipeline_run_id, stage, status, attempt, idempotency_key, output_snapshot,
                error_type, error_message, started_at, completed_at, duration_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                execution.pipeline_run_id,
                execution.stage,
                execution.status.as_str(),
                execution.attempt,
                execution.idempotency_key,
                json_text(&execution.output_snapshot)?,
                execution.error_type,
                execution.error_message,
                execution.started_at.map(|t| t.to_rfc3339()),
                execution.completed_at.map(|t| t.to_rfc3339()),
                execution.duration_ms.map(|d| d as i64),
            ],
        );

        match insert {
            Ok(_) => {
                let mut created = execution.clone();
                created.id = conn.last_insert_rowid();
                Ok(created)
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateExecution(execution.idempotency_key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist an attempt's progress; terminal rows are immutable
    pub fn update_stage_execution(&self, execution: &StageExecution) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let persisted: Option<String> = tx
            .query_row(
                "SELECT status FROM stage_executions WHERE id = ?1",
                params![execution.id],
                |r| r.get(0),
            )
            .optional()?;
        let persisted = persisted.ok_or(StoreError::ExecutionNotFound(execution.id))?;
        let persisted = StageStatus::from_str(&persisted).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
        })?;
        if persisted.is_terminal() {
            return Err(StoreError::ImmutableExecution {
                key: execution.idempotency_key.clone(),
                status: persisted,
            });
        }

        tx.execute(
            "UPDATE stage_executions SET
                status = ?2, output_snapshot = ?3, error_type = ?4, error_message = ?5,
                started_at = ?6, completed_at = ?7, duration_ms = ?8
             WHERE id = ?1",
            params![
                execution.id,
                execution.status.as_str(),
                json_text(&execution.output_snapshot)?,
                execution.error_type,
                execution.error_message,
                execution.started_at.map(|t| t.to_rfc3339()),
                execution.completed_at.map(|t| t.to_rfc3339()),
                execution.duration_ms.map(|d| d as i64),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Mark every non-terminal attempt of a run FAILED; returns how many changed
    pub fn close_open_executions(
        &self,
        pipeline_run_id: i64,
        error_type: &str,
        message: &str,
    ) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE stage_executions
             SET status = ?2, error_type = ?3, error_message = ?4, completed_at = ?5
             WHERE pipeline_run_id = ?1 AND status IN (?6, ?7)",
            params![
                pipeline_run_id,
                StageStatus::Failed.as_str(),
                error_type,
                message,
                Utc::now().to_rfc3339(),
                StageStatus::Pending.as_str(),
                StageStatus::Running.as_str(),
            ],
        )?;
        Ok(changed)
    }

    /// All attempts of a run in creation order
    pub fn stage_executions(&self, pipeline_run_id: i64) -> Result<Vec<StageExecution>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM stage_executions WHERE pipeline_run_id = ?1 ORDER BY id ASC",
            EXECUTION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![pipeline_run_id], map_execution)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The succeeded attempt of a stage, if any (idempotency check)
    pub fn succeeded_execution(
        &self,
        pipeline_run_id: i64,
        stage: &str,
    ) -> Result<Option<StageExecution>, StoreError> {
        let conn = self.conn()?;
        let execution = conn
            .query_row(
                &format!(
                    "SELECT {} FROM stage_executions
                     WHERE pipeline_run_id = ?1 AND stage = ?2 AND status = 'SUCCEEDED'
                     ORDER BY attempt DESC LIMIT 1",
                    EXECUTION_COLUMNS
                ),
                params![pipeline_run_id, stage],
                map_execution,
            )
            .optional()?;
        Ok(execution)
    }

    /// Highest attempt number recorded for a stage (0 if none)
    pub fn max_attempt(&self, pipeline_run_id: i64, stage: &str) -> Result<u32, StoreError> {
        let conn = self.conn()?;
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(attempt), 0) FROM stage_executions
             WHERE pipeline_run_id = ?1 AND stage = ?2",
            params![pipeline_run_id, stage],
            |r| r.get(0),
        )?;
        Ok(max as u32)
    }

    // ------------------------------------------------------------------
    // Pipeline definitions
    // ------------------------------------------------------------------

    /// Create a definition at version 1, or bump its version when the
    /// config changed. Unchanged configs keep their version.
    pub fn upsert_definition(
        &self,
        name: &str,
        description: &str,
        config: &serde_json::Value,
    ) -> Result<PipelineDefinition, StoreError> {
        let config_text = serde_json::to_string(config)?;
        let now = Utc::now().to_rfc3339();

        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let existing: Option<(i64, String)> = tx
                .query_row(
                    "SELECT version, config FROM pipeline_definitions WHERE name = ?1",
                    params![name],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO pipeline_definitions
                            (name, description, version, config, is_active, created_at, updated_at)
                         VALUES (?1, ?2, 1, ?3, 1, ?4, ?4)",
                        params![name, description, config_text, now],
                    )?;
                }
                Some((version, stored)) => {
                    let stored: serde_json::Value = serde_json::from_str(&stored)?;
                    let version = if stored == *config { version } else { version + 1 };
                    tx.execute(
                        "UPDATE pipeline_definitions
                         SET description = ?2, version = ?3, config = ?4, updated_at = ?5
                         WHERE name = ?1",
                        params![name, description, version, config_text, now],
                    )?;
                }
            }
            tx.commit()?;
        }

        self.get_definition(name)?
            .ok_or_else(|| StoreError::DefinitionNotFound(name.to_string()))
    }

    pub fn get_definition(&self, name: &str) -> Result<Option<PipelineDefinition>, StoreError> {
        let conn = self.conn()?;
        let definition = conn
            .query_row(
                &format!(
                    "SELECT {} FROM pipeline_definitions WHERE name = ?1",
                    DEFINITION_COLUMNS
                ),
                params![name],
                map_definition,
            )
            .optional()?;
        Ok(definition)
    }

    pub fn list_definitions(&self) -> Result<Vec<PipelineDefinition>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pipeline_definitions ORDER BY name ASC",
            DEFINITION_COLUMNS
        ))?;
        let rows = stmt.query_map([], map_definition)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn set_definition_active(
        &self,
        name: &str,
        active: bool,
    ) -> Result<PipelineDefinition, StoreError> {
        {
            let conn = self.conn()?;
            let updated = conn.execute(
                "UPDATE pipeline_definitions SET is_active = ?2, updated_at = ?3 WHERE name = ?1",
                params![name, active, Utc::now().to_rfc3339()],
            )?;
            if updated == 0 {
                return Err(StoreError::DefinitionNotFound(name.to_string()));
            }
        }
        self.get_definition(name)?
            .ok_or_else(|| StoreError::DefinitionNotFound(name.to_string()))
    }
}

fn apply_migration_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trace_id TEXT NOT NULL,
            run_id TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            current_stage TEXT,
            total_attempts INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL,
            source TEXT NOT NULL,
            environment TEXT NOT NULL,
            alert_fingerprint TEXT NOT NULL,
            incident_id INTEGER,
            definition_name TEXT,
            definition_version INTEGER,
            trigger_payload TEXT,
            ingest_output TEXT,
            check_output TEXT,
            analyze_output TEXT,
            notify_output TEXT,
            analyze_fallback_used INTEGER NOT NULL DEFAULT 0,
            last_error_type TEXT,
            last_error_message TEXT,
            last_error_retryable INTEGER,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            updated_at TEXT NOT NULL,
            total_duration_ms INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_pipeline_runs_trace ON pipeline_runs(trace_id);
        CREATE INDEX IF NOT EXISTS idx_pipeline_runs_status ON pipeline_runs(status);

        CREATE TABLE IF NOT EXISTS stage_executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pipeline_run_id INTEGER NOT NULL REFERENCES pipeline_runs(id),
            stage TEXT NOT NULL,
            status TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            idempotency_key TEXT NOT NULL UNIQUE,
            output_snapshot TEXT,
            error_type TEXT,
            error_message TEXT,
            started_at TEXT,
            completed_at TEXT,
            duration_ms INTEGER,
            UNIQUE(pipeline_run_id, stage, attempt)
        );
        CREATE INDEX IF NOT EXISTS idx_stage_executions_run ON stage_executions(pipeline_run_id, stage);
        "#,
    )?;
    Ok(())
}

fn apply_migration_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_definitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            version INTEGER NOT NULL,
            config TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn record_migration(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
        params![version, name, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn json_text(value: &Option<serde_json::Value>) -> Result<Option<String>, StoreError> {
    Ok(match value {
        Some(v) => Some(serde_json::to_string(v)?),
        None => None,
    })
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn parse_opt_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn opt_u64_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    let raw: Option<i64> = row.get(idx)?;
    Ok(raw.map(|v| v.max(0) as u64))
}

fn map_run(row: &Row<'_>) -> rusqlite::Result<PipelineRun> {
    Ok(PipelineRun {
        id: row.get(0)?,
        trace_id: row.get(1)?,
        run_id: row.get(2)?,
        status: parse_col(row, 3)?,
        current_stage: parse_opt_col(row, 4)?,
        total_attempts: row.get(5)?,
        max_retries: row.get(6)?,
        source: row.get(7)?,
        environment: row.get(8)?,
        alert_fingerprint: row.get(9)?,
        incident_id: row.get(10)?,
        definition_name: row.get(11)?,
        definition_version: row.get(12)?,
        trigger_payload: json_col(row, 13)?,
        ingest_output: json_col(row, 14)?,
        check_output: json_col(row, 15)?,
        analyze_output: json_col(row, 16)?,
        notify_output: json_col(row, 17)?,
        analyze_fallback_used: row.get(18)?,
        last_error_type: row.get(19)?,
        last_error_message: row.get(20)?,
        last_error_retryable: row.get(21)?,
        created_at: time_col(row, 22)?,
        started_at: opt_time_col(row, 23)?,
        completed_at: opt_time_col(row, 24)?,
        updated_at: time_col(row, 25)?,
        total_duration_ms: opt_u64_col(row, 26)?,
    })
}

fn map_execution(row: &Row<'_>) -> rusqlite::Result<StageExecution> {
    Ok(StageExecution {
        id: row.get(0)?,
        pipeline_run_id: row.get(1)?,
        stage: row.get(2)?,
        status: parse_col(row, 3)?,
        attempt: row.get(4)?,
        idempotency_key: row.get(5)?,
        output_snapshot: json_col(row, 6)?,
        error_type: row.get(7)?,
        error_message: row.get(8)?,
        started_at: opt_time_col(row, 9)?,
        completed_at: opt_time_col(row, 10)?,
        duration_ms: opt_u64_col(row, 11)?,
    })
}

fn map_definition(row: &Row<'_>) -> rusqlite::Result<PipelineDefinition> {
    let config: String = row.get(4)?;
    Ok(PipelineDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        version: row.get(3)?,
        config: serde_json::from_str(&config).map_err(|e| conversion_error(4, e))?,
        is_active: row.get(5)?,
        created_at: time_col(row, 6)?,
        updated_at: time_col(row, 7)?,
    })
}
