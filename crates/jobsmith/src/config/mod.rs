use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub mod defaults;
pub mod duration_serde;

use crate::errors::{QueueError, QueueResult};
use crate::job_scheduling::types::{RetryPolicy, WorkerKind};
use defaults::*;

/// Top-level configuration
///
/// Resolution order, lowest to highest: built-in defaults, the TOML file,
/// then `JOBSMITH_*` environment variables (`__` separates nested keys, e.g.
/// `JOBSMITH_WORKER__NUM_WORKERS=8`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub jobs: JobDefaultsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection settings for the job store
///
/// Either `uri` is set, or the URI is assembled from the discrete fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend type tag: memory, sqlite, postgresql, mysql, redis, mongodb
    #[serde(rename = "type", default = "default_backend_type")]
    pub kind: String,
    pub uri: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    /// Namespace created inside the database before first use (PostgreSQL only)
    pub schema: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Channels the pool leases from, in priority order
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,
    /// Execution slots started by `start_worker_pool` when no count is given
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Upper bound on leased-but-unfinished jobs; defaults to the slot count
    pub max_concurrent_jobs: Option<usize>,
    #[serde(default)]
    pub default_job_executor: WorkerKind,
    /// How often expired results are purged
    #[serde(with = "duration_serde::duration", default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,
    /// Upper bound on a single lease call
    #[serde(with = "duration_serde::duration", default = "default_poll_timeout")]
    pub poll_timeout: Duration,
    /// How long shutdown waits for in-flight jobs before forcing termination
    #[serde(with = "duration_serde::duration", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,
    /// How often due schedules are turned into jobs
    #[serde(with = "duration_serde::duration", default = "default_scheduler_interval")]
    pub scheduler_interval: Duration,
    /// Poll interval while a caller waits on a job result
    #[serde(with = "duration_serde::duration", default = "default_result_poll_interval")]
    pub result_poll_interval: Duration,
    /// Executable spawned for process-kind slots; defaults to the current executable
    pub worker_program: Option<PathBuf>,
    /// Arguments passed to `worker_program`; defaults to `["child"]`
    pub worker_args: Option<Vec<String>>,
}

/// System-wide job defaults, the last tier of option resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaultsConfig {
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(with = "duration_serde::duration", default = "default_result_ttl")]
    pub result_ttl: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_backend_type() -> String {
    DEFAULT_BACKEND_TYPE.to_string()
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_queues() -> Vec<String> {
    vec![DEFAULT_QUEUE.to_string()]
}

fn default_num_workers() -> usize {
    DEFAULT_NUM_WORKERS
}

fn default_cleanup_interval() -> Duration {
    duration_serde::parse_default(DEFAULT_CLEANUP_INTERVAL)
}

fn default_poll_timeout() -> Duration {
    duration_serde::parse_default(DEFAULT_POLL_TIMEOUT)
}

fn default_shutdown_grace() -> Duration {
    duration_serde::parse_default(DEFAULT_SHUTDOWN_GRACE)
}

fn default_scheduler_interval() -> Duration {
    duration_serde::parse_default(DEFAULT_SCHEDULER_INTERVAL)
}

fn default_result_poll_interval() -> Duration {
    duration_serde::parse_default(DEFAULT_RESULT_POLL_INTERVAL)
}

fn default_channel() -> String {
    DEFAULT_QUEUE.to_string()
}

fn default_result_ttl() -> Duration {
    duration_serde::parse_default(DEFAULT_RESULT_TTL)
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_type(),
            uri: None,
            username: None,
            password: None,
            host: None,
            port: None,
            database: None,
            schema: None,
            ssl: false,
            max_connections: default_max_connections(),
        }
    }
}

impl BackendConfig {
    /// Configuration for an explicit connection URI; the type tag is taken from its scheme
    pub fn from_uri<S: Into<String>>(uri: S) -> Self {
        let uri = uri.into();
        let kind = uri
            .split_once(':')
            .map(|(scheme, _)| scheme.to_string())
            .unwrap_or_else(default_backend_type);
        Self {
            kind,
            uri: Some(uri),
            ..Self::default()
        }
    }

    pub fn memory() -> Self {
        Self::default()
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            num_workers: default_num_workers(),
            max_concurrent_jobs: None,
            default_job_executor: WorkerKind::default(),
            cleanup_interval: default_cleanup_interval(),
            poll_timeout: default_poll_timeout(),
            shutdown_grace: default_shutdown_grace(),
            scheduler_interval: default_scheduler_interval(),
            result_poll_interval: default_result_poll_interval(),
            worker_program: None,
            worker_args: None,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> QueueResult<()> {
        if self.queues.is_empty() {
            return Err(QueueError::configuration(
                "worker.queues must name at least one channel",
            ));
        }
        if self.num_workers == 0 {
            return Err(QueueError::configuration("worker.num_workers must be at least 1"));
        }
        if self.max_concurrent_jobs == Some(0) {
            return Err(QueueError::configuration(
                "worker.max_concurrent_jobs must be at least 1",
            ));
        }
        for (name, value) in [
            ("poll_timeout", self.poll_timeout),
            ("scheduler_interval", self.scheduler_interval),
            ("cleanup_interval", self.cleanup_interval),
            ("result_poll_interval", self.result_poll_interval),
        ] {
            if value.is_zero() {
                return Err(QueueError::configuration(format!(
                    "worker.{name} must be non-zero"
                )));
            }
        }
        Ok(())
    }
}

impl Default for JobDefaultsConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            result_ttl: default_result_ttl(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional TOML file and the environment
    pub fn load(config_file: Option<&Path>) -> QueueResult<Self> {
        let path = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> QueueResult<()> {
        self.worker.validate()?;
        self.jobs.retry.validate()?;
        Ok(())
    }

    /// Write the default configuration to `path`, refusing to clobber an existing file
    pub fn write_default(path: &Path) -> QueueResult<()> {
        if path.exists() {
            return Err(QueueError::configuration(format!(
                "config file already exists: {}",
                path.display()
            )));
        }
        let contents = toml::to_string_pretty(&Self::default())
            .map_err(|e| QueueError::configuration(format!("failed to render config: {e}")))?;
        std::fs::write(path, contents)?;
        info!("Created default config file: {}", path.display());
        Ok(())
    }
}
