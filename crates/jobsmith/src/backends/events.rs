//! Job event layer
//!
//! Waiters on job results subscribe here so they wake as soon as a job
//! finishes instead of waiting out a poll interval.

use async_trait::async_trait;
use sea_orm::sqlx::postgres::PgListener;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, Statement};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::{QueueError, QueueResult};
use crate::job_scheduling::types::JobEvent;

const EVENT_BUFFER: usize = 1024;
/// NOTIFY channel shared by every process using the same database
pub const NOTIFY_CHANNEL: &str = "jobsmith_events";

#[async_trait]
pub trait EventBroker: Send + Sync {
    async fn publish(&self, event: JobEvent) -> QueueResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<JobEvent>;
}

/// In-process broadcast; events never leave the process
pub struct LocalEventBroker {
    sender: broadcast::Sender<JobEvent>,
}

impl LocalEventBroker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }
}

impl Default for LocalEventBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBroker for LocalEventBroker {
    async fn publish(&self, event: JobEvent) -> QueueResult<()> {
        // No subscribers is not an error
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

/// LISTEN/NOTIFY on the same PostgreSQL pool that stores the jobs
pub struct PostgresEventBroker {
    connection: DatabaseConnection,
    local: broadcast::Sender<JobEvent>,
    listener: JoinHandle<()>,
}

impl PostgresEventBroker {
    /// Compose the event layer on an existing data-store connection
    ///
    /// Fails unless the connection is the sqlx PostgreSQL pool, the only
    /// driver here that can LISTEN.
    pub async fn from_connection(connection: &DatabaseConnection) -> QueueResult<Self> {
        if !matches!(connection, DatabaseConnection::SqlxPostgresPoolConnection(_)) {
            return Err(QueueError::configuration(format!(
                "event notifications need the async PostgreSQL driver, got a {:?} connection",
                connection.get_database_backend()
            )));
        }

        let pool = connection.get_postgres_connection_pool();
        let mut listener = PgListener::connect_with(pool)
            .await
            .map_err(|e| QueueError::backend(format!("failed to open LISTEN connection: {e}")))?;
        listener
            .listen(NOTIFY_CHANNEL)
            .await
            .map_err(|e| QueueError::backend(format!("LISTEN {NOTIFY_CHANNEL} failed: {e}")))?;

        let (local, _) = broadcast::channel(EVENT_BUFFER);
        let forward = local.clone();
        let listener = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => match serde_json::from_str::<JobEvent>(notification.payload()) {
                        Ok(event) => {
                            let _ = forward.send(event);
                        }
                        Err(e) => debug!("Ignoring malformed job event: {}", e),
                    },
                    Err(e) => {
                        warn!("Job event listener error, reconnecting: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self {
            connection: connection.clone(),
            local,
            listener,
        })
    }
}

impl Drop for PostgresEventBroker {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl EventBroker for PostgresEventBroker {
    async fn publish(&self, event: JobEvent) -> QueueResult<()> {
        let payload = serde_json::to_string(&event)?;
        self.connection
            .execute(Statement::from_sql_and_values(
                DbBackend::Postgres,
                "SELECT pg_notify($1, $2)",
                [NOTIFY_CHANNEL.into(), payload.into()],
            ))
            .await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.local.subscribe()
    }
}
