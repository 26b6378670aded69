//! SeaORM-based relational backend
//!
//! One code path serves SQLite, PostgreSQL and MySQL:
//! - SQLite files are created on first use, parent directories included
//! - PostgreSQL and MySQL databases are created when missing
//! - a PostgreSQL schema is created when missing and put on the search path

use sea_orm::{ConnectOptions, Database as SeaOrmDatabase, DatabaseBackend, DatabaseConnection};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::backends::BackendKind;
use crate::backends::uri::ConnectionUri;
use crate::config::BackendConfig;
use crate::errors::{QueueError, QueueResult};

pub mod bootstrap;
pub mod migrations;
pub mod store;

pub use store::RelationalBackend;

/// Connection pool for one relational database
#[derive(Clone)]
pub struct Database {
    connection: Arc<DatabaseConnection>,
    backend: DatabaseBackend,
    kind: BackendKind,
}

impl Database {
    /// Bootstrap the target database and schema, then connect
    pub async fn new(uri: &ConnectionUri, config: &BackendConfig) -> QueueResult<Self> {
        let (kind, backend) = match uri.kind {
            BackendKind::Sqlite => (uri.kind, DatabaseBackend::Sqlite),
            BackendKind::Postgres => (uri.kind, DatabaseBackend::Postgres),
            BackendKind::Mysql => (uri.kind, DatabaseBackend::MySql),
            other => {
                return Err(QueueError::configuration(format!(
                    "{other} is not a relational backend"
                )));
            }
        };

        info!("Connecting to {} database", kind);

        let connection_url = match kind {
            BackendKind::Sqlite => Self::ensure_sqlite_auto_creation(uri.as_str())?,
            _ => {
                bootstrap::ensure_database(uri).await?;
                uri.as_str().to_string()
            }
        };
        let in_memory = connection_url.contains(":memory:");

        let mut connect_options = ConnectOptions::new(connection_url);
        connect_options
            .min_connections(1)
            .connect_timeout(Duration::from_secs(5))
            .acquire_timeout(Duration::from_secs(3))
            .sqlx_logging_level(tracing::log::LevelFilter::Debug);

        if in_memory {
            // Every pooled connection would otherwise see its own empty database
            connect_options.max_connections(1);
        } else {
            connect_options
                .max_connections(config.max_connections)
                .idle_timeout(Duration::from_secs(600))
                .max_lifetime(Duration::from_secs(1800));
        }

        let schema = config.schema.as_deref().filter(|s| !s.is_empty());
        if let (BackendKind::Postgres, Some(schema)) = (kind, schema) {
            connect_options.set_schema_search_path(schema);
        }

        let connection = match SeaOrmDatabase::connect(connect_options).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Database connection failed: {:?}", e);
                let mut source = e.source();
                let mut level = 0;
                while let Some(err) = source {
                    error!("  Level {}: {}", level, err);
                    source = err.source();
                    level += 1;
                }
                return Err(QueueError::backend(format!(
                    "failed to connect to database at '{}': {e}",
                    uri.redacted()
                )));
            }
        };

        if let (BackendKind::Postgres, Some(schema)) = (kind, schema) {
            bootstrap::ensure_schema(&connection, schema).await?;
        }

        debug!("Database connection established successfully");

        Ok(Self {
            connection: Arc::new(connection),
            backend,
            kind,
        })
    }

    /// Ensure a SQLite URL creates its file when missing
    fn ensure_sqlite_auto_creation(url: &str) -> QueueResult<String> {
        if url.contains("mode=") || url.contains(":memory:") {
            debug!("SQLite URL needs no modification: {}", url);
            return Ok(url.to_string());
        }

        let file_path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .ok_or_else(|| QueueError::configuration(format!("invalid SQLite URL: {url}")))?;
        let file_path = file_path.split('?').next().unwrap_or(file_path);

        let path = std::path::Path::new(file_path);
        if path.exists() {
            debug!("SQLite database file already exists: {}", file_path);
            return Ok(url.to_string());
        }

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
            info!("Created directory for SQLite database: {}", parent.display());
        }

        let auto_create_url = if url.contains('?') {
            format!("{url}&mode=rwc")
        } else {
            format!("{url}?mode=rwc")
        };
        debug!("SQLite URL set to auto-create: {}", auto_create_url);
        Ok(auto_create_url)
    }

    /// Run database migrations
    pub async fn migrate(&self) -> QueueResult<()> {
        use migrations::Migrator;
        use sea_orm_migration::MigratorTrait;

        info!("Running database migrations for {}", self.kind);
        Migrator::up(self.connection.as_ref(), None).await?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Async engine handle
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }
}
