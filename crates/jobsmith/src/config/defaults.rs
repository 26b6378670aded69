/// Configuration default values
///
/// This module contains all the default values for configuration options,
/// making them easily changeable in one central location.
// Backend defaults
pub const DEFAULT_BACKEND_TYPE: &str = "memory";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_POSTGRES_PORT: u16 = 5432;
pub const DEFAULT_MYSQL_PORT: u16 = 3306;
pub const DEFAULT_REDIS_PORT: u16 = 6379;
pub const DEFAULT_DATABASE_NAME: &str = "jobsmith";

// Worker pool defaults
pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_NUM_WORKERS: usize = 4;
pub const DEFAULT_CLEANUP_INTERVAL: &str = "5m";
pub const DEFAULT_POLL_TIMEOUT: &str = "1s";
pub const DEFAULT_SHUTDOWN_GRACE: &str = "30s";
pub const DEFAULT_SCHEDULER_INTERVAL: &str = "1s";
pub const DEFAULT_RESULT_POLL_INTERVAL: &str = "250ms";

// Job defaults
pub const DEFAULT_RESULT_TTL: &str = "1h";
pub const DEFAULT_MAX_RETRIES: u32 = 0;
pub const DEFAULT_RETRY_BASE_DELAY: &str = "1s";
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;

// Logging defaults
pub const DEFAULT_LOG_LEVEL: &str = "info";

// Environment
pub const ENV_PREFIX: &str = "JOBSMITH_";
pub const DEFAULT_CONFIG_FILE: &str = "jobsmith.toml";
