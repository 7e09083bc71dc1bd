//! Service configuration.
//!
//! Process settings come from environment variables (optionally loaded from
//! a `.env` file). Per-pipeline settings come from a YAML file and are held
//! in a [`ConfigCache`] that readers snapshot without locking.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::consumer::{RetryPolicy, WorkerSettings};
#[cfg(feature = "postgres")]
use crate::diesel_runtime::DatabaseConfig;
use crate::nats::NatsConfig;

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    Io { path: String, source: std::io::Error },
    Parse { path: String, message: String },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "Failed to read {}: {}", path, source),
            ConfigError::Parse { path, message } => write!(f, "Failed to parse {}: {}", path, message),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Load `.env` if present. Variables already set in the environment win.
pub fn load_dotenv() {
    match dotenv::dotenv() {
        Ok(path) => tracing::debug!("Loaded environment from {}", path.display()),
        Err(_) => tracing::debug!("No .env file found"),
    }
}

pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an environment variable, falling back to `default` when it is
/// unset or unparseable.
pub fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

/// `true`/`1`/`yes`/`on`, case-insensitive
pub fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => split_list(&raw),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Where transformed graphs go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Log,
    Database,
}

impl FromStr for OutputMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "log" => Ok(OutputMode::Log),
            "database" | "db" => Ok(OutputMode::Database),
            other => Err(ConfigError::Invalid(format!("unknown output mode '{}'", other))),
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMode::Log => write!(f, "log"),
            OutputMode::Database => write!(f, "database"),
        }
    }
}

/// Rule-driven or hand-coded Microsoft strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Dynamic,
    Static,
}

impl FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dynamic" => Ok(StrategyKind::Dynamic),
            "static" => Ok(StrategyKind::Static),
            other => Err(ConfigError::Invalid(format!("unknown strategy '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformerConfig {
    /// Off means records are only logged
    pub enabled: bool,
    pub output_mode: OutputMode,
    pub microsoft_strategy: StrategyKind,
    /// Rule file or directory of rule files
    pub mappings_path: PathBuf,
    /// Read rules from the `field_mappings` table instead of files
    pub mappings_from_database: bool,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_mode: OutputMode::Log,
            microsoft_strategy: StrategyKind::Dynamic,
            mappings_path: PathBuf::from("config/mappings"),
            mappings_from_database: false,
        }
    }
}

impl TransformerConfig {
    /// `TRANSFORMERS_ENABLED`, `OUTPUT_MODE`, `MICROSOFT_STRATEGY`,
    /// `MAPPINGS_PATH`, `MAPPINGS_FROM_DATABASE`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_flag("TRANSFORMERS_ENABLED", defaults.enabled),
            output_mode: env_parse("OUTPUT_MODE", defaults.output_mode),
            microsoft_strategy: env_parse("MICROSOFT_STRATEGY", defaults.microsoft_strategy),
            mappings_path: std::env::var("MAPPINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.mappings_path),
            mappings_from_database: env_flag("MAPPINGS_FROM_DATABASE", defaults.mappings_from_database),
        }
    }
}

/// Worker pool and retry tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    pub service_name: String,
    pub pipeline_id: String,
    pub topics: Vec<String>,
    pub thread_count: usize,
    pub poll_timeout_ms: u64,
    pub max_poll_records: usize,
    /// Attempts per batch, the first one included
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub init_max_attempts: u32,
    pub init_backoff_ms: u64,
    pub init_max_backoff_ms: u64,
    pub max_poll_failures: u32,
    pub shutdown_grace_ms: u64,
    pub dlq_enabled: bool,
    pub dlq_topic: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            service_name: "entity-fabric".to_string(),
            pipeline_id: "identity-users".to_string(),
            topics: vec!["entities".to_string()],
            thread_count: 4,
            poll_timeout_ms: 1000,
            max_poll_records: 100,
            max_retries: 3,
            retry_backoff_ms: 1000,
            init_max_attempts: 5,
            init_backoff_ms: 500,
            init_max_backoff_ms: 30_000,
            max_poll_failures: 10,
            shutdown_grace_ms: 10_000,
            dlq_enabled: true,
            dlq_topic: "dlq.entities".to_string(),
        }
    }
}

impl ConsumerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let topic_defaults: Vec<&str> = d.topics.iter().map(String::as_str).collect();
        Self {
            service_name: env_or("SERVICE_NAME", &d.service_name),
            pipeline_id: env_or("PIPELINE_ID", &d.pipeline_id),
            topics: env_list("SOURCE_TOPICS", &topic_defaults),
            thread_count: env_parse("THREAD_COUNT", d.thread_count),
            poll_timeout_ms: env_parse("POLL_TIMEOUT_MS", d.poll_timeout_ms),
            max_poll_records: env_parse("MAX_POLL_RECORDS", d.max_poll_records),
            max_retries: env_parse("MAX_RETRIES", d.max_retries),
            retry_backoff_ms: env_parse("RETRY_BACKOFF_MS", d.retry_backoff_ms),
            init_max_attempts: env_parse("INIT_MAX_ATTEMPTS", d.init_max_attempts),
            init_backoff_ms: env_parse("INIT_BACKOFF_MS", d.init_backoff_ms),
            init_max_backoff_ms: env_parse("INIT_MAX_BACKOFF_MS", d.init_max_backoff_ms),
            max_poll_failures: env_parse("MAX_POLL_FAILURES", d.max_poll_failures),
            shutdown_grace_ms: env_parse("SHUTDOWN_GRACE_MS", d.shutdown_grace_ms),
            dlq_enabled: env_flag("DLQ_ENABLED", d.dlq_enabled),
            dlq_topic: env_or("DLQ_TOPIC", &d.dlq_topic),
        }
    }

    /// Overlay the values a pipeline entry sets.
    pub fn apply_pipeline(&mut self, pipeline: &PipelineConfig) {
        self.service_name = pipeline.service_name.clone();
        self.pipeline_id = pipeline.pipeline_id.clone();
        if !pipeline.source_topics.is_empty() {
            self.topics = pipeline.source_topics.clone();
        }
        if let Some(threads) = pipeline.thread_count {
            self.thread_count = threads;
        }
        if let Some(retries) = pipeline.max_retries {
            self.max_retries = retries;
        }
        if let Some(backoff) = pipeline.retry_backoff_ms {
            self.retry_backoff_ms = backoff;
        }
        if let Some(timeout) = pipeline.poll_timeout_ms {
            self.poll_timeout_ms = timeout;
        }
        if let Some(max) = pipeline.max_poll_records {
            self.max_poll_records = max;
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            topics: self.topics.clone(),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            max_poll_records: self.max_poll_records.max(1),
            init_retry: RetryPolicy::exponential(
                self.init_max_attempts,
                Duration::from_millis(self.init_backoff_ms),
                Duration::from_millis(self.init_max_backoff_ms),
            ),
            batch_retry: RetryPolicy::fixed(self.max_retries, Duration::from_millis(self.retry_backoff_ms)),
            max_poll_failures: self.max_poll_failures.max(1),
            dlq_topic: self.dlq_enabled.then(|| self.dlq_topic.clone()),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Everything the binary needs.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    pub consumer: ConsumerConfig,
    pub transformer: TransformerConfig,
    pub nats: NatsConfig,
    #[cfg(feature = "postgres")]
    pub database: DatabaseConfig,
    /// YAML pipeline file (`PIPELINES_PATH`)
    pub pipelines_path: Option<PathBuf>,
}

impl FabricConfig {
    pub fn from_env() -> Self {
        Self {
            consumer: ConsumerConfig::from_env(),
            transformer: TransformerConfig::from_env(),
            nats: NatsConfig::from_env(),
            #[cfg(feature = "postgres")]
            database: DatabaseConfig::from_env(),
            pipelines_path: std::env::var("PIPELINES_PATH").ok().map(PathBuf::from),
        }
    }
}

/// One pipeline's property bag.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Filled from the enclosing keys
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub pipeline_id: String,
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub source_topics: Vec<String>,
    #[serde(default)]
    pub thread_count: Option<usize>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_backoff_ms: Option<u64>,
    #[serde(default)]
    pub poll_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_poll_records: Option<usize>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// service name → pipeline id → pipeline
pub type PipelineMap = BTreeMap<String, BTreeMap<String, PipelineConfig>>;

/// Parse a pipeline file of the form `service: { pipeline: {...} }`.
pub fn load_pipelines(path: &Path) -> Result<PipelineMap, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    parse_pipelines(&content).map_err(|message| ConfigError::Parse {
        path: path.display().to_string(),
        message,
    })
}

fn parse_pipelines(content: &str) -> Result<PipelineMap, String> {
    let mut map: PipelineMap = serde_yaml::from_str(content).map_err(|e| e.to_string())?;
    for (service, pipelines) in map.iter_mut() {
        for (pipeline_id, pipeline) in pipelines.iter_mut() {
            pipeline.service_name = service.clone();
            pipeline.pipeline_id = pipeline_id.clone();
            if pipeline.thread_count == Some(0) {
                return Err(format!("{}/{}: thread_count must be positive", service, pipeline_id));
            }
        }
    }
    Ok(map)
}

/// Pipeline configuration shared by every worker.
///
/// Reads take a snapshot without locking. `refresh` loads a complete new map
/// and swaps it in; readers holding the old snapshot keep it until they drop
/// it.
pub struct ConfigCache {
    source: Option<PathBuf>,
    current: ArcSwap<PipelineMap>,
    refresh_lock: Mutex<()>,
}

impl ConfigCache {
    pub fn new(pipelines: PipelineMap) -> Self {
        Self {
            source: None,
            current: ArcSwap::from_pointee(pipelines),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Load from a YAML file; `refresh` re-reads the same file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let pipelines = load_pipelines(&path)?;
        tracing::info!("Loaded {} services from {}", pipelines.len(), path.display());
        Ok(Self {
            source: Some(path),
            current: ArcSwap::from_pointee(pipelines),
            refresh_lock: Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> Arc<PipelineMap> {
        self.current.load_full()
    }

    pub fn get(&self, service: &str, pipeline_id: &str) -> Option<PipelineConfig> {
        self.current
            .load()
            .get(service)
            .and_then(|pipelines| pipelines.get(pipeline_id))
            .cloned()
    }

    pub fn pipelines(&self, service: &str) -> Vec<PipelineConfig> {
        self.current
            .load()
            .get(service)
            .map(|pipelines| pipelines.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Re-read the source file and swap. On error the previous snapshot
    /// stays in place.
    pub fn refresh(&self) -> Result<usize, ConfigError> {
        let Some(path) = &self.source else {
            return Err(ConfigError::Invalid("cache was not loaded from a file".to_string()));
        };
        let _writer = self
            .refresh_lock
            .lock()
            .map_err(|_| ConfigError::Invalid("refresh lock poisoned".to_string()))?;
        let pipelines = load_pipelines(path)?;
        let count = pipelines.values().map(BTreeMap::len).sum();
        self.current.store(Arc::new(pipelines));
        tracing::info!("Pipeline configuration refreshed: {} pipelines", count);
        Ok(count)
    }

    /// Swap in a map built elsewhere.
    pub fn replace(&self, pipelines: PipelineMap) {
        if let Ok(_writer) = self.refresh_lock.lock() {
            self.current.store(Arc::new(pipelines));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PIPELINES: &str = r#"
entity-fabric:
  identity-users:
    cluster_name: primary
    source_topics: [entities.microsoft]
    thread_count: 8
    max_retries: 5
    properties:
      region: eu
  identity-apps:
    source_topics: [entities.apps]
"#;

    #[test]
    fn test_parse_fills_keys() {
        let map = parse_pipelines(PIPELINES).unwrap();
        let users = &map["entity-fabric"]["identity-users"];
        assert_eq!(users.service_name, "entity-fabric");
        assert_eq!(users.pipeline_id, "identity-users");
        assert_eq!(users.thread_count, Some(8));
        assert_eq!(users.properties.get("region").map(String::as_str), Some("eu"));
    }

    #[test]
    fn test_zero_threads_rejected() {
        let err = parse_pipelines("svc:\n  p:\n    thread_count: 0\n").unwrap_err();
        assert!(err.contains("thread_count"));
    }

    #[test]
    fn test_apply_pipeline_overrides_only_set_values() {
        let map = parse_pipelines(PIPELINES).unwrap();
        let mut consumer = ConsumerConfig::default();
        consumer.apply_pipeline(&map["entity-fabric"]["identity-apps"]);
        assert_eq!(consumer.topics, vec!["entities.apps".to_string()]);
        assert_eq!(consumer.thread_count, 4);
        assert_eq!(consumer.pipeline_id, "identity-apps");

        consumer.apply_pipeline(&map["entity-fabric"]["identity-users"]);
        assert_eq!(consumer.thread_count, 8);
        assert_eq!(consumer.worker_settings().batch_retry.max_attempts, 5);
    }

    #[test]
    fn test_refresh_swaps_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", PIPELINES).unwrap();
        let cache = ConfigCache::load(file.path()).unwrap();

        let before = cache.snapshot();
        assert_eq!(cache.pipelines("entity-fabric").len(), 2);

        std::fs::write(file.path(), "entity-fabric:\n  identity-users:\n    thread_count: 2\n").unwrap();
        assert_eq!(cache.refresh().unwrap(), 1);

        // The old snapshot is untouched
        assert_eq!(before["entity-fabric"].len(), 2);
        assert_eq!(cache.get("entity-fabric", "identity-users").unwrap().thread_count, Some(2));
        assert!(cache.get("entity-fabric", "identity-apps").is_none());
    }

    #[test]
    fn test_failed_refresh_keeps_previous() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", PIPELINES).unwrap();
        let cache = ConfigCache::load(file.path()).unwrap();

        std::fs::write(file.path(), "entity-fabric: [not, a, map").unwrap();
        assert!(cache.refresh().is_err());
        assert_eq!(cache.pipelines("entity-fabric").len(), 2);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Database".parse::<OutputMode>().unwrap(), OutputMode::Database);
        assert_eq!("static".parse::<StrategyKind>().unwrap(), StrategyKind::Static);
        assert!("kafka".parse::<OutputMode>().is_err());
    }
}
