//! Configuration loading for the ingestion core.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `INGESTOR_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application configuration derived from `INGESTOR_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default)]
    pub fetch: FetchPolicyConfig,
    #[serde(default)]
    pub jobs: JobRunnerConfig,
    #[serde(default)]
    pub upsert: UpsertConfig,
}

/// Outbound fetch policy: concurrency cap, pacing and retry behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FetchPolicyConfig {
    /// Maximum in-flight requests per source (default: 3)
    ///
    /// Environment variable: `INGESTOR_FETCH_MAX_CONCURRENCY`
    #[serde(default = "default_fetch_max_concurrency")]
    pub max_concurrency: usize,

    /// Minimum spacing between two request starts against one source (default: 250)
    ///
    /// Environment variable: `INGESTOR_FETCH_MIN_INTERVAL_MS`
    #[serde(default = "default_fetch_min_interval_ms")]
    pub min_interval_ms: u64,

    /// Retries after the first attempt before giving up (default: 5)
    ///
    /// Environment variable: `INGESTOR_FETCH_MAX_RETRIES`
    #[serde(default = "default_fetch_max_retries")]
    pub max_retries: u32,

    /// Backoff base delay (default: 500)
    ///
    /// Environment variable: `INGESTOR_FETCH_BASE_DELAY_MS`
    #[serde(default = "default_fetch_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Multiplier applied per attempt (default: 2.0)
    ///
    /// Environment variable: `INGESTOR_FETCH_BACKOFF_FACTOR`
    #[serde(default = "default_fetch_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound on a computed backoff delay (default: 60000)
    ///
    /// Environment variable: `INGESTOR_FETCH_MAX_DELAY_MS`
    #[serde(default = "default_fetch_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Longest server-supplied `Retry-After` the client will wait out (default: 300000).
    /// A larger hint fails the fetch instead.
    ///
    /// Environment variable: `INGESTOR_FETCH_MAX_RETRY_AFTER_MS`
    #[serde(default = "default_fetch_max_retry_after_ms")]
    pub max_retry_after_ms: u64,

    /// Symmetric jitter as a fraction of the computed delay (default: 0.25)
    ///
    /// Environment variable: `INGESTOR_FETCH_JITTER_FACTOR`
    #[serde(default = "default_fetch_jitter_factor")]
    pub jitter_factor: f64,

    /// Per-request timeout (default: 30000)
    ///
    /// Environment variable: `INGESTOR_FETCH_REQUEST_TIMEOUT_MS`
    #[serde(default = "default_fetch_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Environment variable: `INGESTOR_FETCH_USER_AGENT`
    #[serde(default = "default_fetch_user_agent")]
    pub user_agent: String,

    /// Source-specific overrides, keyed by lowercase source name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_overrides: BTreeMap<String, FetchSourceOverride>,
}

/// Source-specific fetch policy overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FetchSourceOverride {
    /// Environment variable: `INGESTOR_FETCH_OVERRIDE_{SOURCE}_MAX_CONCURRENCY`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    /// Environment variable: `INGESTOR_FETCH_OVERRIDE_{SOURCE}_MIN_INTERVAL_MS`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_interval_ms: Option<u64>,

    /// Environment variable: `INGESTOR_FETCH_OVERRIDE_{SOURCE}_MAX_RETRIES`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// Effective limits for one source after overrides are applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceLimits {
    pub max_concurrency: usize,
    pub min_interval: Duration,
    pub max_retries: u32,
}

/// Job worker pool and dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct JobRunnerConfig {
    /// Concurrently running jobs (default: 4)
    #[serde(default = "default_jobs_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Dispatcher poll interval for pending jobs (default: 5000)
    #[serde(default = "default_jobs_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Running jobs are stopped at the next batch boundary past this (default: 3600)
    #[serde(default = "default_jobs_max_run_seconds")]
    pub max_run_seconds: u64,
    /// Bounded queue between adapter fetch and the writer (default: 4)
    #[serde(default = "default_jobs_batch_queue_depth")]
    pub batch_queue_depth: usize,
}

/// Upsert engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct UpsertConfig {
    /// Rows per independently committed chunk (default: 500)
    #[serde(default = "default_upsert_chunk_size")]
    pub chunk_size: usize,
    /// Retries of a chunk after a connection-level failure (default: 2)
    #[serde(default = "default_upsert_storage_retries")]
    pub storage_retries: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            fetch: FetchPolicyConfig::default(),
            jobs: JobRunnerConfig::default(),
            upsert: UpsertConfig::default(),
        }
    }
}

impl Default for FetchPolicyConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_fetch_max_concurrency(),
            min_interval_ms: default_fetch_min_interval_ms(),
            max_retries: default_fetch_max_retries(),
            base_delay_ms: default_fetch_base_delay_ms(),
            backoff_factor: default_fetch_backoff_factor(),
            max_delay_ms: default_fetch_max_delay_ms(),
            max_retry_after_ms: default_fetch_max_retry_after_ms(),
            jitter_factor: default_fetch_jitter_factor(),
            request_timeout_ms: default_fetch_request_timeout_ms(),
            user_agent: default_fetch_user_agent(),
            source_overrides: BTreeMap::new(),
        }
    }
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: default_jobs_worker_concurrency(),
            poll_interval_ms: default_jobs_poll_interval_ms(),
            max_run_seconds: default_jobs_max_run_seconds(),
            batch_queue_depth: default_jobs_batch_queue_depth(),
        }
    }
}

impl Default for UpsertConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_upsert_chunk_size(),
            storage_retries: default_upsert_storage_retries(),
        }
    }
}

impl FetchPolicyConfig {
    /// Resolve the limits for `source`, applying any override.
    pub fn limits_for(&self, source: &str) -> SourceLimits {
        let policy = self.source_overrides.get(&source.to_lowercase());
        SourceLimits {
            max_concurrency: policy
                .and_then(|p| p.max_concurrency)
                .unwrap_or(self.max_concurrency),
            min_interval: Duration::from_millis(
                policy
                    .and_then(|p| p.min_interval_ms)
                    .unwrap_or(self.min_interval_ms),
            ),
            max_retries: policy
                .and_then(|p| p.max_retries)
                .unwrap_or(self.max_retries),
        }
    }

    /// Validate fetch policy bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidFetchConcurrency {
                source_name: "default".to_string(),
                value: self.max_concurrency,
            });
        }

        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::InvalidFetchDelayBounds {
                base: self.base_delay_ms,
                max: self.max_delay_ms,
            });
        }

        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::InvalidBackoffFactor {
                value: self.backoff_factor,
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidFetchJitter {
                value: self.jitter_factor,
            });
        }

        if self.max_retry_after_ms == 0 {
            return Err(ConfigError::InvalidMaxRetryAfter {
                value: self.max_retry_after_ms,
            });
        }

        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidRequestTimeout {
                value: self.request_timeout_ms,
            });
        }

        for (source, override_config) in &self.source_overrides {
            if override_config.max_concurrency == Some(0) {
                return Err(ConfigError::InvalidFetchConcurrency {
                    source_name: source.clone(),
                    value: 0,
                });
            }
        }

        Ok(())
    }
}

impl JobRunnerConfig {
    /// Validate job runner bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 || self.worker_concurrency > 256 {
            return Err(ConfigError::InvalidWorkerConcurrency {
                value: self.worker_concurrency,
            });
        }

        if self.batch_queue_depth == 0 {
            return Err(ConfigError::InvalidBatchQueueDepth {
                value: self.batch_queue_depth,
            });
        }

        if self.max_run_seconds == 0 {
            return Err(ConfigError::InvalidMaxRunSeconds {
                value: self.max_run_seconds,
            });
        }

        if self.poll_interval_ms < 100 {
            return Err(ConfigError::InvalidPollInterval {
                value: self.poll_interval_ms,
            });
        }

        Ok(())
    }
}

impl UpsertConfig {
    /// Validate upsert bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > 10_000 {
            return Err(ConfigError::InvalidChunkSize {
                value: self.chunk_size,
            });
        }
        Ok(())
    }
}

impl AppConfig {
    /// Returns a redacted JSON representation (credentials in the database URL are masked).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        config.database_url = redact_url_password(&config.database_url);
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        self.fetch.validate()?;
        self.jobs.validate()?;
        self.upsert.validate()?;

        Ok(())
    }
}

fn redact_url_password(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(Some("[REDACTED]")).is_ok() {
                parsed.to_string()
            } else {
                raw.to_string()
            }
        }
        _ => raw.to_string(),
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "postgres://localhost:5432/ingestor".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_fetch_max_concurrency() -> usize {
    3
}

fn default_fetch_min_interval_ms() -> u64 {
    250
}

fn default_fetch_max_retries() -> u32 {
    5
}

fn default_fetch_base_delay_ms() -> u64 {
    500
}

fn default_fetch_backoff_factor() -> f64 {
    2.0
}

fn default_fetch_max_delay_ms() -> u64 {
    60_000
}

fn default_fetch_max_retry_after_ms() -> u64 {
    300_000
}

fn default_fetch_jitter_factor() -> f64 {
    0.25
}

fn default_fetch_request_timeout_ms() -> u64 {
    30_000
}

fn default_fetch_user_agent() -> String {
    format!("ingestor/{}", env!("CARGO_PKG_VERSION"))
}

fn default_jobs_worker_concurrency() -> usize {
    4
}

fn default_jobs_poll_interval_ms() -> u64 {
    5000
}

fn default_jobs_max_run_seconds() -> u64 {
    3600
}

fn default_jobs_batch_queue_depth() -> usize {
    4
}

fn default_upsert_chunk_size() -> usize {
    500
}

fn default_upsert_storage_retries() -> u32 {
    2
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("database url is missing; set INGESTOR_DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("fetch max concurrency for {source_name} must be at least 1, got {value}")]
    InvalidFetchConcurrency { source_name: String, value: usize },
    #[error("fetch base delay ({base}ms) cannot be greater than max delay ({max}ms)")]
    InvalidFetchDelayBounds { base: u64, max: u64 },
    #[error("fetch backoff factor must be a finite number >= 1.0, got {value}")]
    InvalidBackoffFactor { value: f64 },
    #[error("fetch jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidFetchJitter { value: f64 },
    #[error("fetch max retry-after must be positive, got {value}")]
    InvalidMaxRetryAfter { value: u64 },
    #[error("fetch request timeout must be positive, got {value}")]
    InvalidRequestTimeout { value: u64 },
    #[error("job worker concurrency must be between 1 and 256, got {value}")]
    InvalidWorkerConcurrency { value: usize },
    #[error("job batch queue depth must be at least 1, got {value}")]
    InvalidBatchQueueDepth { value: usize },
    #[error("job max run seconds must be positive, got {value}")]
    InvalidMaxRunSeconds { value: u64 },
    #[error("job poll interval must be at least 100ms, got {value}")]
    InvalidPollInterval { value: u64 },
    #[error("upsert chunk size must be between 1 and 10000, got {value}")]
    InvalidChunkSize { value: usize },
}

/// Loads configuration using layered `.env` files and `INGESTOR_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("INGESTOR_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);

        // Parse fetch policy
        let mut fetch = FetchPolicyConfig {
            max_concurrency: layered
                .remove("FETCH_MAX_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_fetch_max_concurrency),
            min_interval_ms: layered
                .remove("FETCH_MIN_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_fetch_min_interval_ms),
            max_retries: layered
                .remove("FETCH_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_fetch_max_retries),
            base_delay_ms: layered
                .remove("FETCH_BASE_DELAY_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_fetch_base_delay_ms),
            backoff_factor: layered
                .remove("FETCH_BACKOFF_FACTOR")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_fetch_backoff_factor),
            max_delay_ms: layered
                .remove("FETCH_MAX_DELAY_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_fetch_max_delay_ms),
            max_retry_after_ms: layered
                .remove("FETCH_MAX_RETRY_AFTER_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_fetch_max_retry_after_ms),
            jitter_factor: layered
                .remove("FETCH_JITTER_FACTOR")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_fetch_jitter_factor),
            request_timeout_ms: layered
                .remove("FETCH_REQUEST_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_fetch_request_timeout_ms),
            user_agent: layered
                .remove("FETCH_USER_AGENT")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(default_fetch_user_agent),
            source_overrides: BTreeMap::new(),
        };

        // Source overrides: FETCH_OVERRIDE_<SOURCE>_<SETTING>
        for (key, value) in &layered {
            let Some(suffix) = key.strip_prefix("FETCH_OVERRIDE_") else {
                continue;
            };
            let Some((source, setting)) = split_override_key(suffix) else {
                continue;
            };

            let entry = fetch.source_overrides.entry(source).or_default();
            match setting {
                "MAX_CONCURRENCY" => entry.max_concurrency = value.parse().ok(),
                "MIN_INTERVAL_MS" => entry.min_interval_ms = value.parse().ok(),
                "MAX_RETRIES" => entry.max_retries = value.parse().ok(),
                _ => {}
            }
        }

        let jobs = JobRunnerConfig {
            worker_concurrency: layered
                .remove("JOBS_WORKER_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_jobs_worker_concurrency),
            poll_interval_ms: layered
                .remove("JOBS_POLL_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_jobs_poll_interval_ms),
            max_run_seconds: layered
                .remove("JOBS_MAX_RUN_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_jobs_max_run_seconds),
            batch_queue_depth: layered
                .remove("JOBS_BATCH_QUEUE_DEPTH")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_jobs_batch_queue_depth),
        };

        let upsert = UpsertConfig {
            chunk_size: layered
                .remove("UPSERT_CHUNK_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_upsert_chunk_size),
            storage_retries: layered
                .remove("UPSERT_STORAGE_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_upsert_storage_retries),
        };

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            fetch,
            jobs,
            upsert,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("INGESTOR_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix("INGESTOR_") {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Split `<SOURCE>_<SETTING>` where the setting is one of the known suffixes.
/// Sources may themselves contain underscores.
fn split_override_key(suffix: &str) -> Option<(String, &str)> {
    const SETTINGS: [&str; 3] = ["MAX_CONCURRENCY", "MIN_INTERVAL_MS", "MAX_RETRIES"];
    SETTINGS.iter().find_map(|setting| {
        suffix
            .strip_suffix(setting)
            .and_then(|rest| rest.strip_suffix('_'))
            .filter(|source| !source.is_empty())
            .map(|source| (source.to_lowercase(), *setting))
    })
}
