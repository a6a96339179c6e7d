//! Configuration for respondr.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (RESPONDR_HOME, RESPONDR_DATABASE)
//! 2. Config file (.respondr/config.yaml)
//! 3. Defaults (~/.respondr, ~/.respondr/runs.db)
//!
//! Config file discovery:
//! - Searches current directory and parents for .respondr/config.yaml
//! - Paths in config file are relative to the .respondr/ directory
//!
//! ```yaml
//! version: "1"
//! paths:
//!   home: ./
//!   database: runs.db
//! pipeline:
//!   max_retries: 3
//!   backoff_factor: 2.0
//! analyze:
//!   fallback_enabled: true
//!   provider: local
//! notify:
//!   driver: generic
//!   config:
//!     endpoint: https://hooks.example.com/incidents
//! signals:
//!   backend: log
//! queue:
//!   workers: 4
//!   max_deliveries: 1
//! safety:
//!   max_payload_bytes: 1048576
//! ```

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::executors::ExecutorSettings;
use crate::core::queue::QueueSettings;
use crate::core::retry::RetryPolicy;
use crate::core::safety::SafetyLimits;
use crate::core::signals::SignalBackend;

/// Resolved once per process; a load error is cached as its message
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const HOME_ENV: &str = "RESPONDR_HOME";
const DATABASE_ENV: &str = "RESPONDR_DATABASE";

/// `.respondr/config.yaml` as written on disk
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub pipeline: Option<PipelineConfig>,
    #[serde(default)]
    pub analyze: Option<AnalyzeConfig>,
    #[serde(default)]
    pub notify: Option<NotifyConfig>,
    #[serde(default)]
    pub signals: Option<SignalsConfig>,
    #[serde(default)]
    pub queue: Option<QueueConfig>,
    #[serde(default)]
    pub safety: Option<SafetyConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .respondr/)
    pub home: Option<String>,
    /// SQLite database (relative to .respondr/)
    pub database: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub max_retries: Option<u32>,
    pub backoff_factor: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeConfig {
    pub fallback_enabled: Option<bool>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    pub driver: Option<String>,
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalsConfig {
    pub backend: Option<SignalBackend>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub workers: Option<usize>,
    pub max_deliveries: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SafetyConfig {
    pub max_payload_bytes: Option<u64>,
    pub redact_patterns: Option<Vec<String>>,
}

/// Effective settings after env, file and defaults are merged
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// SQLite database path
    pub database: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub fallback_enabled: bool,
    /// Active recommendation provider
    pub provider: String,
    pub notify_driver: String,
    pub notify_config: serde_json::Value,
    pub signals: SignalBackend,
    pub queue: QueueSettings,
    pub safety: SafetyLimits,
}

impl ResolvedConfig {
    /// Settings for the built-in stage executors
    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            fallback_enabled: self.fallback_enabled,
            default_driver: self.notify_driver.clone(),
            default_notify_config: self.notify_config.clone(),
        }
    }
}

/// Walk from the working directory up to the root looking for `.respondr/config.yaml`
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".respondr").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Parse a YAML config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Paths in the config file are relative to its `.respondr/` directory
fn resolve_path(config_dir: &Path, value: &str) -> PathBuf {
    let path = Path::new(value);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    config_dir.join(path)
}

/// Merge defaults, an optional config file and environment overrides
fn resolve(
    default_home: PathBuf,
    file: Option<(&Path, ConfigFile)>,
    env: impl Fn(&str) -> Option<String>,
) -> ResolvedConfig {
    let (config_dir, config) = match file {
        Some((path, config)) => (
            path.parent().map(Path::to_path_buf),
            config,
        ),
        None => (None, ConfigFile::default()),
    };
    let from_file = |value: &Option<String>| -> Option<PathBuf> {
        match (&config_dir, value) {
            (Some(dir), Some(p)) => Some(resolve_path(dir, p)),
            _ => None,
        }
    };

    let home = env(HOME_ENV)
        .map(PathBuf::from)
        .or_else(|| from_file(&config.paths.home))
        .unwrap_or(default_home);

    let database = env(DATABASE_ENV)
        .map(PathBuf::from)
        .or_else(|| from_file(&config.paths.database))
        .unwrap_or_else(|| home.join("runs.db"));

    let mut retry = RetryPolicy::default();
    if let Some(pipeline) = &config.pipeline {
        retry.max_retries = pipeline.max_retries.unwrap_or(retry.max_retries);
        retry.backoff_factor = pipeline.backoff_factor.unwrap_or(retry.backoff_factor);
    }

    let executor_defaults = ExecutorSettings::default();
    let analyze = config.analyze.as_ref();
    let notify = config.notify.as_ref();

    let mut queue = QueueSettings::default();
    if let Some(q) = &config.queue {
        queue.workers = q.workers.unwrap_or(queue.workers);
        queue.max_deliveries = q.max_deliveries.unwrap_or(queue.max_deliveries);
    }

    let mut safety = SafetyLimits::default();
    if let Some(s) = &config.safety {
        safety.max_payload_bytes = s.max_payload_bytes.unwrap_or(safety.max_payload_bytes);
        if let Some(patterns) = &s.redact_patterns {
            safety.redact_patterns = patterns.clone();
        }
    }

    ResolvedConfig {
        home,
        database,
        config_file: file_path(config_dir),
        retry,
        fallback_enabled: analyze
            .and_then(|a| a.fallback_enabled)
            .unwrap_or(executor_defaults.fallback_enabled),
        provider: analyze
            .and_then(|a| a.provider.clone())
            .unwrap_or_else(|| "local".to_string()),
        notify_driver: notify
            .and_then(|n| n.driver.clone())
            .unwrap_or(executor_defaults.default_driver),
        notify_config: notify
            .and_then(|n| n.config.clone())
            .unwrap_or(executor_defaults.default_notify_config),
        signals: config
            .signals
            .and_then(|s| s.backend)
            .unwrap_or_default(),
        queue,
        safety,
    }
}

fn file_path(config_dir: Option<PathBuf>) -> Option<PathBuf> {
    config_dir.map(|dir| dir.join("config.yaml"))
}

/// Resolve configuration for this process
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".respondr");

    let file = match find_config_file() {
        Some(path) => {
            let config = load_config_file(&path)?;
            Some((path, config))
        }
        None => None,
    };

    Ok(resolve(
        default_home,
        file.as_ref().map(|(path, config)| (path.as_path(), config.clone())),
        |key| std::env::var(key).ok(),
    ))
}

/// Process configuration, loaded on first use
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the respondr home directory
pub fn respondr_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the SQLite database path
pub fn database_path() -> Result<PathBuf> {
    Ok(config()?.database.clone())
}
