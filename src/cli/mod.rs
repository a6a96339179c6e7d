//! Command-line interface for respondr.
//!
//! Provides commands for running the fixed pipeline or a definition,
//! resuming and force-failing runs, inspecting past runs and managing
//! stored definitions.

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};

use crate::adapters::Collaborators;
use crate::config::{self, ResolvedConfig};
use crate::core::{
    build_emitter, DefinitionBasedOrchestrator, DefinitionResult, ExecutorSet, NodeRegistry,
    PipelineOrchestrator, PipelineTrigger, RunFilter, Store,
};
use crate::domain::{PipelineResult, PipelineStatus};

pub mod definitions;

/// respondr - Incident response pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "respondr")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the fixed INGEST -> CHECK -> ANALYZE -> NOTIFY pipeline
    Run {
        #[command(flatten)]
        payload: PayloadArgs,

        #[command(flatten)]
        trigger: TriggerArgs,

        /// Override the retry limit for this run
        #[arg(long)]
        max_retries: Option<u32>,

        /// Print the stages without executing
        #[arg(long)]
        dry_run: bool,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Run a stored definition or an ad-hoc definition config
    #[command(group(
        ArgGroup::new("definition")
            .required(true)
            .args(["name", "config_file", "config"])
    ))]
    RunDefinition {
        /// Stored definition name
        #[arg(long)]
        name: Option<String>,

        /// Definition config file (JSON)
        #[arg(long)]
        config_file: Option<PathBuf>,

        /// Definition config as literal JSON
        #[arg(long)]
        config: Option<String>,

        #[command(flatten)]
        payload: PayloadArgs,

        #[command(flatten)]
        trigger: TriggerArgs,

        /// Validate and print the nodes without executing
        #[arg(long)]
        dry_run: bool,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Resume a failed run; succeeded stages are not executed again
    Resume {
        /// Run ID to resume
        run_id: String,

        #[command(flatten)]
        payload: PayloadArgs,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Fail a run (operator action)
    ///
    /// By default the run is cancelled and can no longer be resumed. With
    /// --resumable the run is marked FAILED so `resume` can restart it, which
    /// is how a run left behind by a crashed worker is recovered.
    Fail {
        /// Run ID to fail
        run_id: String,

        /// Reason recorded on the run
        #[arg(long)]
        reason: String,

        /// Leave the run resumable instead of cancelling it
        #[arg(long)]
        resumable: bool,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Filter by status (e.g. FAILED)
        #[arg(long)]
        status: Option<String>,

        /// Filter by trace ID
        #[arg(long)]
        trace_id: Option<String>,
    },

    /// Show a run and its stage executions
    Show {
        /// Run ID
        run_id: String,

        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Manage pipeline definitions
    Definitions {
        #[command(subcommand)]
        command: definitions::DefinitionCommands,
    },

    /// Show resolved configuration
    Config,
}

/// Where the trigger payload comes from
#[derive(Args, Debug, Clone, Default)]
pub struct PayloadArgs {
    /// Payload as literal JSON
    #[arg(long, conflicts_with = "payload_file")]
    pub payload: Option<String>,

    /// Payload file (JSON); "-" reads stdin
    #[arg(long)]
    pub payload_file: Option<PathBuf>,
}

impl PayloadArgs {
    /// Parsed payload, if one was given
    pub fn read(&self) -> Result<Option<serde_json::Value>> {
        let text = match (&self.payload, &self.payload_file) {
            (Some(text), _) => text.clone(),
            (None, Some(path)) if path == Path::new("-") => {
                let mut buffer = String::new();
                io::stdin()
                    .read_to_string(&mut buffer)
                    .context("Failed to read payload from stdin")?;
                buffer
            }
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read payload file: {}", path.display()))?,
            (None, None) => return Ok(None),
        };

        let payload = serde_json::from_str(&text).context("Payload is not valid JSON")?;
        Ok(Some(payload))
    }

    fn read_or_empty(&self) -> Result<serde_json::Value> {
        Ok(self.read()?.unwrap_or_else(|| serde_json::json!({})))
    }
}

/// Trigger metadata shared by run commands
#[derive(Args, Debug, Clone)]
pub struct TriggerArgs {
    /// Correlation ID (generated when omitted)
    #[arg(long)]
    pub trace_id: Option<String>,

    /// Trigger source
    #[arg(long, default_value = "manual")]
    pub source: String,

    /// Target environment
    #[arg(long, default_value = "production")]
    pub environment: String,
}

impl TriggerArgs {
    fn trigger(&self, payload: serde_json::Value) -> PipelineTrigger {
        let trigger = PipelineTrigger::new(payload)
            .with_source(self.source.clone())
            .with_environment(self.environment.clone());
        match &self.trace_id {
            Some(trace_id) => trigger.with_trace_id(trace_id.clone()),
            None => trigger,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Store, orchestrators and collaborators wired from configuration
pub struct Runtime {
    pub store: Store,
    pub pipeline: PipelineOrchestrator,
    pub definitions: DefinitionBasedOrchestrator,
}

impl Runtime {
    /// Open the configured database with the local collaborators
    pub fn from_config(cfg: &ResolvedConfig) -> Result<Self> {
        if let Some(parent) = cfg.database.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let store = Store::open(&cfg.database)
            .with_context(|| format!("Failed to open database: {}", cfg.database.display()))?;
        Ok(Self::build(store, Collaborators::local(), cfg))
    }

    pub fn build(store: Store, collaborators: Collaborators, cfg: &ResolvedConfig) -> Self {
        let providers = collaborators.providers.clone().with_active(cfg.provider.clone());
        let collaborators = collaborators.with_providers(providers);

        // Selected once here and injected into both orchestrators
        let signals = build_emitter(cfg.signals);
        let executors = ExecutorSet::from_collaborators(&collaborators, &cfg.executor_settings());
        let registry = NodeRegistry::with_builtin(&executors, collaborators.diagnostics.clone());

        let pipeline = PipelineOrchestrator::new(store.clone(), executors, signals.clone())
            .with_retry_policy(cfg.retry.clone())
            .with_safety_limits(cfg.safety.clone());
        let definitions = DefinitionBasedOrchestrator::new(store.clone(), registry, signals)
            .with_safety_limits(cfg.safety.clone());

        Self {
            store,
            pipeline,
            definitions,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;

        match self.command {
            Commands::Config => show_config(cfg),
            Commands::Run {
                payload,
                trigger,
                max_retries,
                dry_run,
                format,
            } => {
                let runtime = Runtime::from_config(cfg)?;
                run_pipeline(&runtime, &payload, &trigger, max_retries, dry_run, format).await
            }
            Commands::RunDefinition {
                name,
                config_file,
                config,
                payload,
                trigger,
                dry_run,
                format,
            } => {
                let runtime = Runtime::from_config(cfg)?;
                let source = DefinitionSource::from_args(name, config_file, config)?;
                run_definition(&runtime, source, &payload, &trigger, dry_run, format).await
            }
            Commands::Resume {
                run_id,
                payload,
                format,
            } => {
                let runtime = Runtime::from_config(cfg)?;
                resume_run(&runtime, &run_id, &payload, format).await
            }
            Commands::Fail {
                run_id,
                reason,
                resumable,
            } => {
                let runtime = Runtime::from_config(cfg)?;
                let run = if resumable {
                    runtime
                        .store
                        .fail_stale_run(&run_id, &reason)
                        .with_context(|| format!("Failed to mark run {} as failed", run_id))?
                } else {
                    runtime
                        .store
                        .force_fail_run(&run_id, &reason)
                        .with_context(|| format!("Failed to force-fail run {}", run_id))?
                };
                let next = if resumable { "resumable" } else { "cancelled" };
                println!("Run {} is now {}, {} ({})", run.run_id, run.status, next, reason);
                Ok(())
            }
            Commands::Runs {
                limit,
                status,
                trace_id,
            } => {
                let runtime = Runtime::from_config(cfg)?;
                list_runs(&runtime, limit, status, trace_id)
            }
            Commands::Show { run_id, format } => {
                let runtime = Runtime::from_config(cfg)?;
                show_run(&runtime, &run_id, format)
            }
            Commands::Definitions { command } => {
                let runtime = Runtime::from_config(cfg)?;
                definitions::execute(&runtime, command)
            }
        }
    }
}

/// Which definition a `run-definition` invocation targets
enum DefinitionSource {
    Stored(String),
    Config(serde_json::Value),
}

impl DefinitionSource {
    fn from_args(
        name: Option<String>,
        config_file: Option<PathBuf>,
        config: Option<String>,
    ) -> Result<Self> {
        if let Some(name) = name {
            return Ok(Self::Stored(name));
        }
        if let Some(path) = config_file {
            return Ok(Self::Config(definitions::read_config_file(&path)?));
        }
        let text = config.context("One of --name, --config-file or --config is required")?;
        let value = serde_json::from_str(&text).context("Definition config is not valid JSON")?;
        Ok(Self::Config(value))
    }
}

async fn run_pipeline(
    runtime: &Runtime,
    payload: &PayloadArgs,
    trigger_args: &TriggerArgs,
    max_retries: Option<u32>,
    dry_run: bool,
    format: OutputFormat,
) -> Result<()> {
    if dry_run {
        let plan = runtime.pipeline.plan();
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
            OutputFormat::Text => {
                println!("Dry run: fixed pipeline");
                for (idx, step) in plan.iter().enumerate() {
                    println!(
                        "  {}. {:<8} executor={} max_retries={}",
                        idx + 1,
                        step.stage,
                        step.executor,
                        max_retries.unwrap_or(step.max_retries)
                    );
                }
            }
        }
        return Ok(());
    }

    let mut trigger = trigger_args.trigger(payload.read_or_empty()?);
    if let Some(max_retries) = max_retries {
        trigger = trigger.with_max_retries(max_retries);
    }

    let result = runtime.pipeline.run_pipeline(trigger).await?;
    print_pipeline_result(&result, format)?;
    if !result.is_completed() {
        std::process::exit(1);
    }
    Ok(())
}

async fn resume_run(
    runtime: &Runtime,
    run_id: &str,
    payload: &PayloadArgs,
    format: OutputFormat,
) -> Result<()> {
    let result = runtime
        .pipeline
        .resume_pipeline(run_id, payload.read()?)
        .await?;
    print_pipeline_result(&result, format)?;
    if !result.is_completed() {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_definition(
    runtime: &Runtime,
    source: DefinitionSource,
    payload: &PayloadArgs,
    trigger_args: &TriggerArgs,
    dry_run: bool,
    format: OutputFormat,
) -> Result<()> {
    let orchestrator = &runtime.definitions;

    if dry_run {
        let config = match &source {
            DefinitionSource::Config(config) => config.clone(),
            DefinitionSource::Stored(name) => {
                runtime
                    .store
                    .get_definition(name)?
                    .with_context(|| format!("Definition '{}' not found", name))?
                    .config
            }
        };
        let plan = orchestrator.plan(&config)?;
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
            OutputFormat::Text => {
                println!("Dry run: {} node(s)", plan.len());
                for (idx, node) in plan.iter().enumerate() {
                    println!(
                        "  {}. {:<16} type={:<12} required={}",
                        idx + 1,
                        node.node_id,
                        node.node_type,
                        node.required
                    );
                }
            }
        }
        return Ok(());
    }

    let trigger = trigger_args.trigger(payload.read_or_empty()?);
    let result = match source {
        DefinitionSource::Stored(name) => orchestrator.run_definition(&name, trigger).await?,
        DefinitionSource::Config(config) => orchestrator.run_config(&config, trigger).await?,
    };

    print_definition_result(&result, format)?;
    if !result.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_pipeline_result(result: &PipelineResult, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    let stages: Vec<String> = result.stages_completed.iter().map(|s| s.to_string()).collect();
    println!("Run ID:    {}", result.run_id);
    println!("Trace ID:  {}", result.trace_id);
    println!("Status:    {}", result.status.as_str());
    println!("Stages:    {}", stages.join(" -> "));
    if !result.stages_reused.is_empty() {
        let reused: Vec<String> = result.stages_reused.iter().map(|s| s.to_string()).collect();
        println!("Reused:    {}", reused.join(", "));
    }
    if let Some(incident_id) = result.incident_id {
        println!("Incident:  #{}", incident_id);
    }
    if result.fallback_used {
        println!("Analysis:  fallback used");
    }
    println!("Duration:  {}ms", result.duration_ms);
    if let Some(err) = &result.error {
        println!("Error:     [{}] {}", err.stage, err.message());
    }
    Ok(())
}

fn print_definition_result(result: &DefinitionResult, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("Run ID:      {}", result.run_id);
    println!(
        "Definition:  {} (v{})",
        result.definition_name, result.definition_version
    );
    println!("Status:      {}", result.status);
    println!("Executed:    {}", result.executed_nodes.join(", "));
    if !result.skipped_nodes.is_empty() {
        println!("Skipped:     {}", result.skipped_nodes.join(", "));
    }
    if !result.failed_nodes.is_empty() {
        println!("Failed:      {}", result.failed_nodes.join(", "));
    }
    println!("Duration:    {}ms", result.duration_ms);
    if let Some(err) = &result.error {
        println!("Error:       {}", err);
    }
    Ok(())
}

fn list_runs(
    runtime: &Runtime,
    limit: usize,
    status: Option<String>,
    trace_id: Option<String>,
) -> Result<()> {
    let status = status
        .map(|s| s.to_ascii_uppercase().parse::<PipelineStatus>())
        .transpose()?;
    let runs = runtime.store.list_runs(&RunFilter {
        status,
        trace_id,
        limit,
    })?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!(
        "{:<38} {:<10} {:<10} {:<9} {:<20}",
        "RUN ID", "STATUS", "STAGE", "ATTEMPTS", "DEFINITION"
    );
    println!("{}", "-".repeat(90));

    for run in runs {
        let stage = run
            .current_stage
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let definition = run.definition_name.as_deref().unwrap_or("(fixed)");
        println!(
            "{:<38} {:<10} {:<10} {:<9} {:<20}",
            run.run_id, run.status, stage, run.total_attempts, definition
        );
    }

    Ok(())
}

fn show_run(runtime: &Runtime, run_id: &str, format: OutputFormat) -> Result<()> {
    let run = runtime
        .store
        .get_run(run_id)?
        .with_context(|| format!("Run not found: {}", run_id))?;
    let executions = runtime.store.stage_executions(run.id)?;

    if format == OutputFormat::Json {
        let doc = serde_json::json!({ "run": run, "stage_executions": executions });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("Run ID:     {}", run.run_id);
    println!("Trace ID:   {}", run.trace_id);
    println!("Status:     {}", run.status);
    if let Some(name) = &run.definition_name {
        println!("Definition: {} (v{})", name, run.definition_version.unwrap_or_default());
    }
    println!("Source:     {} / {}", run.source, run.environment);
    println!("Attempts:   {} (max {} per stage)", run.total_attempts, run.max_retries);
    if let Some(incident_id) = run.incident_id {
        println!("Incident:   #{}", incident_id);
    }
    println!("Created:    {}", run.created_at);
    if let Some(completed) = run.completed_at {
        println!("Completed:  {}", completed);
    }
    if let Some(error_type) = &run.last_error_type {
        println!(
            "Last error: [{}] {} (retryable: {})",
            error_type,
            run.last_error_message.as_deref().unwrap_or(""),
            run.last_error_retryable.unwrap_or(false)
        );
    }

    println!("\nStage executions:");
    for execution in executions {
        println!(
            "  {:<12} attempt={} {:<10} {}",
            execution.stage,
            execution.attempt,
            execution.status,
            execution.error_message.as_deref().unwrap_or("")
        );
    }

    Ok(())
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("respondr configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.database.display());
    println!();
    println!("Pipeline:");
    println!("  Max retries:    {}", cfg.retry.max_retries);
    println!("  Backoff factor: {}", cfg.retry.backoff_factor);
    println!();
    println!("Analyze:");
    println!("  Provider: {}", cfg.provider);
    println!("  Fallback: {}", cfg.fallback_enabled);
    println!();
    println!("Notify:");
    println!("  Driver: {}", cfg.notify_driver);
    println!("  Config: {}", cfg.safety.redact(&cfg.notify_config));
    println!();
    println!("Signals backend: {}", cfg.signals);
    println!(
        "Queue: {} worker(s), {} delivery(ies) per job",
        cfg.queue.workers, cfg.queue.max_deliveries
    );
    println!();
    println!("Safety limits:");
    println!("  Max payload size: {} bytes", cfg.safety.max_payload_bytes);
    println!("  Redacted keys:    {}", cfg.safety.redact_patterns.join(", "));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "respondr",
            "run",
            "--payload",
            r#"{"alerts": []}"#,
            "--environment",
            "staging",
            "--dry-run",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                payload,
                trigger,
                dry_run,
                format,
                ..
            } => {
                assert!(dry_run);
                assert_eq!(format, OutputFormat::Text);
                assert_eq!(trigger.environment, "staging");
                assert_eq!(trigger.source, "manual");
                assert_eq!(
                    payload.read().unwrap(),
                    Some(serde_json::json!({"alerts": []}))
                );
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_run_definition_requires_a_source() {
        assert!(Cli::try_parse_from(["respondr", "run-definition"]).is_err());
        assert!(Cli::try_parse_from(["respondr", "run-definition", "--name", "triage"]).is_ok());
    }

    #[test]
    fn test_payload_conflicts() {
        let parsed = Cli::try_parse_from([
            "respondr",
            "run",
            "--payload",
            "{}",
            "--payload-file",
            "p.json",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_parse_fail_command() {
        let cli = Cli::try_parse_from(["respondr", "fail", "run-1", "--reason", "worker died", "--resumable"])
            .unwrap();
        match cli.command {
            Commands::Fail {
                run_id,
                reason,
                resumable,
            } => {
                assert_eq!(run_id, "run-1");
                assert_eq!(reason, "worker died");
                assert!(resumable);
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let cli = Cli::try_parse_from(["respondr", "fail", "run-1", "--reason", "stop"]).unwrap();
        assert!(matches!(cli.command, Commands::Fail { resumable: false, .. }));
    }

    #[test]
    fn test_invalid_payload_json() {
        let args = PayloadArgs {
            payload: Some("{not json".to_string()),
            payload_file: None,
        };
        assert!(args.read().is_err());
    }
}
