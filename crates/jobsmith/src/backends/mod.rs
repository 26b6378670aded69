//! Backend connection layer
//!
//! A type tag selects the substrate. [`BackendConnector`] resolves it once,
//! failing fast on anything unsupported, then hands out a memoized client and
//! the [`JobBackend`] built on top of it.
//!
//! Two execution models sit behind the one trait:
//! - queue model (memory, broker): ready jobs are popped and leased
//! - trigger model (relational): ready rows are claimed by a conditional update

pub mod events;
pub mod memory;
pub mod uri;

#[cfg(feature = "redis")]
pub mod broker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;
use strum::{AsRefStr, Display};
use tokio::sync::OnceCell;
use tracing::info;

use crate::config::BackendConfig;
use crate::database::{Database, RelationalBackend};
use crate::errors::{QueueError, QueueResult};
use crate::job_scheduling::types::{Job, JobCompletion, JobFilter, JobId, Schedule};
use events::{EventBroker, LocalEventBroker, PostgresEventBroker};
use memory::MemoryBackend;
use uri::ConnectionUri;

/// Supported substrate kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Sqlite,
    Postgres,
    Mysql,
    Redis,
    /// Recognized but not provided
    Document,
}

impl BackendKind {
    /// Map a type tag or URI scheme to a kind
    pub fn from_tag(tag: &str) -> QueueResult<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "memory" | "inmemory" | "in-memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::Mysql),
            "redis" | "rediss" => Ok(Self::Redis),
            "mongodb" | "mongodb+srv" | "document" => Ok(Self::Document),
            other => Err(QueueError::configuration(format!(
                "unknown backend type '{other}' (expected memory, sqlite, postgresql, mysql, redis)"
            ))),
        }
    }

    pub fn is_relational(self) -> bool {
        matches!(self, Self::Sqlite | Self::Postgres | Self::Mysql)
    }

    /// Reject kinds this build cannot serve
    fn ensure_supported(self) -> QueueResult<()> {
        match self {
            Self::Document => Err(QueueError::unsupported("job storage", "document")),
            #[cfg(not(feature = "redis"))]
            Self::Redis => Err(QueueError::configuration(
                "the redis backend requires building with the `redis` feature",
            )),
            _ => Ok(()),
        }
    }
}

/// Storage contract shared by every backend
#[async_trait]
pub trait JobBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn enqueue(&self, job: Job) -> QueueResult<()>;

    /// Lease the oldest ready job from the first channel that has one, waiting up to `timeout`
    async fn lease(
        &self,
        channels: &[String],
        worker_id: &str,
        timeout: Duration,
    ) -> QueueResult<Option<Job>>;

    async fn record_attempt(&self, id: JobId, attempt: u32) -> QueueResult<()>;

    /// Store a terminal outcome; `false` when the job is no longer running
    async fn complete(&self, id: JobId, outcome: JobCompletion) -> QueueResult<bool>;

    async fn get_job(&self, id: JobId) -> QueueResult<Option<Job>>;

    async fn list_jobs(&self, filter: &JobFilter) -> QueueResult<Vec<Job>>;

    /// Cancel a pending job; `false` for unknown or terminal jobs
    async fn cancel_job(&self, id: JobId) -> QueueResult<bool>;

    async fn delete_job(&self, id: JobId) -> QueueResult<bool>;

    /// Drop terminal jobs whose result TTL has passed
    async fn purge_expired(&self, now: DateTime<Utc>) -> QueueResult<u64>;

    /// Store a schedule; `false` when the id is taken and `replace` is not set
    async fn insert_schedule(&self, schedule: &Schedule, replace: bool) -> QueueResult<bool>;

    async fn get_schedule(&self, id: &str) -> QueueResult<Option<Schedule>>;

    async fn list_schedules(&self) -> QueueResult<Vec<Schedule>>;

    async fn update_schedule(&self, schedule: &Schedule) -> QueueResult<bool>;

    /// Claim one firing and enqueue its job as a single step
    ///
    /// `schedule` is persisted and `job` enqueued only if the stored schedule
    /// is still active with `next_fire_time == expected`. On error neither
    /// change is kept, so the firing stays due.
    async fn fire_schedule(
        &self,
        schedule: &Schedule,
        expected: DateTime<Utc>,
        job: Job,
    ) -> QueueResult<bool>;

    async fn delete_schedule(&self, id: &str) -> QueueResult<bool>;
}

/// An open connection to the selected substrate
#[derive(Clone)]
pub enum BackendConnection {
    Memory(Arc<MemoryBackend>),
    Relational(Database),
    #[cfg(feature = "redis")]
    Broker(redis::aio::MultiplexedConnection),
}

impl BackendConnection {
    /// Async engine handle, for relational connections only
    pub fn engine(&self) -> Option<&DatabaseConnection> {
        match self {
            BackendConnection::Relational(db) => Some(db.connection()),
            _ => None,
        }
    }
}

/// Resolves configuration to a backend and owns its connection
pub struct BackendConnector {
    kind: BackendKind,
    uri: ConnectionUri,
    config: BackendConfig,
    client: OnceCell<BackendConnection>,
}

impl std::fmt::Debug for BackendConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnector")
            .field("kind", &self.kind)
            .field("uri", &self.uri.redacted())
            .field("connected", &self.client.initialized())
            .finish()
    }
}

impl BackendConnector {
    /// Validate configuration without connecting
    pub fn new(config: &BackendConfig) -> QueueResult<Self> {
        let uri = ConnectionUri::from_config(config)?;
        uri.kind.ensure_supported()?;
        Ok(Self {
            kind: uri.kind,
            uri,
            config: config.clone(),
            client: OnceCell::new(),
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn uri(&self) -> &ConnectionUri {
        &self.uri
    }

    /// Open a brand-new connection, bootstrapping database and schema for relational kinds
    pub async fn setup(&self) -> QueueResult<BackendConnection> {
        info!("Opening {} backend at {}", self.kind, self.uri.redacted());
        match self.kind {
            BackendKind::Memory => Ok(BackendConnection::Memory(Arc::new(MemoryBackend::new()))),
            BackendKind::Sqlite | BackendKind::Postgres | BackendKind::Mysql => {
                let database = Database::new(&self.uri, &self.config).await?;
                database.migrate().await?;
                Ok(BackendConnection::Relational(database))
            }
            #[cfg(feature = "redis")]
            BackendKind::Redis => {
                let client = redis::Client::open(self.uri.as_str())?;
                let conn = client.get_multiplexed_async_connection().await?;
                Ok(BackendConnection::Broker(conn))
            }
            other => {
                other.ensure_supported()?;
                Err(QueueError::unsupported("job storage", other.as_ref()))
            }
        }
    }

    /// The shared connection, opened on first use
    pub async fn client(&self) -> QueueResult<&BackendConnection> {
        self.client.get_or_try_init(|| self.setup()).await
    }

    /// Job backend over the shared connection
    pub async fn backend(&self) -> QueueResult<Arc<dyn JobBackend>> {
        let backend: Arc<dyn JobBackend> = match self.client().await? {
            BackendConnection::Memory(store) => store.clone(),
            BackendConnection::Relational(db) => Arc::new(RelationalBackend::new(db.clone())),
            #[cfg(feature = "redis")]
            BackendConnection::Broker(conn) => Arc::new(broker::BrokerBackend::new(conn.clone())),
        };
        Ok(backend)
    }

    /// Event layer for job state changes
    ///
    /// PostgreSQL composes LISTEN/NOTIFY on the data-store connection; every
    /// other kind uses an in-process channel.
    pub async fn events(&self) -> QueueResult<Arc<dyn EventBroker>> {
        let broker: Arc<dyn EventBroker> = match self.client().await? {
            BackendConnection::Relational(db) if self.kind == BackendKind::Postgres => {
                Arc::new(PostgresEventBroker::from_connection(db.connection()).await?)
            }
            _ => Arc::new(LocalEventBroker::new()),
        };
        Ok(broker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_mapping() {
        assert_eq!(BackendKind::from_tag("PostgreSQL").unwrap(), BackendKind::Postgres);
        assert_eq!(BackendKind::from_tag("mariadb").unwrap(), BackendKind::Mysql);
        assert_eq!(BackendKind::from_tag("rediss").unwrap(), BackendKind::Redis);
        assert_eq!(BackendKind::from_tag("mongodb+srv").unwrap(), BackendKind::Document);
        assert!(BackendKind::from_tag("cassandra").unwrap_err().is_configuration());
    }

    #[test]
    fn test_unknown_type_fails_at_construction() {
        let config = BackendConfig {
            kind: "etcd".to_string(),
            ..BackendConfig::default()
        };
        assert!(BackendConnector::new(&config).is_err());
    }

    #[test]
    fn test_document_store_is_rejected_up_front() {
        let config = BackendConfig::from_uri("mongodb://localhost/jobs");
        match BackendConnector::new(&config) {
            Err(QueueError::Unsupported { backend, .. }) => assert_eq!(backend, "document"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("document backend should be rejected"),
        }
    }

    #[cfg(not(feature = "redis"))]
    #[test]
    fn test_redis_without_feature_is_a_configuration_error() {
        let config = BackendConfig::from_uri("redis://localhost:6379/0");
        assert!(BackendConnector::new(&config).unwrap_err().is_configuration());
    }

    #[test]
    fn test_debug_output_redacts_credentials() {
        let connector =
            BackendConnector::new(&BackendConfig::from_uri("postgresql://app:hunter2@db/jobs")).unwrap();
        let rendered = format!("{connector:?}");
        assert!(rendered.contains("Postgres"));
        assert!(rendered.contains("connected: false"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_memory_client_is_memoized_and_setup_is_fresh() {
        let connector = BackendConnector::new(&BackendConfig::memory()).unwrap();
        let first = match connector.client().await.unwrap() {
            BackendConnection::Memory(store) => store.clone(),
            _ => panic!("expected memory connection"),
        };
        let second = match connector.client().await.unwrap() {
            BackendConnection::Memory(store) => store.clone(),
            _ => panic!("expected memory connection"),
        };
        assert!(Arc::ptr_eq(&first, &second));

        let fresh = match connector.setup().await.unwrap() {
            BackendConnection::Memory(store) => store,
            _ => panic!("expected memory connection"),
        };
        assert!(!Arc::ptr_eq(&first, &fresh));
    }

    #[tokio::test]
    async fn test_sqlite_engine_handle_is_exposed() {
        let connector = BackendConnector::new(&BackendConfig::from_uri("sqlite::memory:")).unwrap();
        let client = connector.client().await.unwrap();
        assert!(client.engine().is_some());
    }
}
