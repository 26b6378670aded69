//! Database and schema bootstrap for server-based engines
//!
//! Runs before the main pool opens: the target database is created through a
//! short-lived connection to the server's maintenance database, and the
//! PostgreSQL schema inside a transaction on the new pool.

use sea_orm::{
    ConnectionTrait, Database as SeaOrmDatabase, DatabaseConnection, DbBackend, Statement,
    TransactionTrait,
};
use tracing::{debug, info};

use crate::backends::BackendKind;
use crate::backends::uri::ConnectionUri;
use crate::errors::{QueueError, QueueResult};

const POSTGRES_MAINTENANCE_DB: &str = "postgres";

/// Identifiers are spliced into DDL, so only plain names are accepted
fn validate_identifier(kind: &str, name: &str) -> QueueResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(QueueError::configuration(format!(
            "invalid {kind} name '{name}': use letters, digits, '_' or '-'"
        )))
    }
}

/// Create the target database when it does not exist yet
pub async fn ensure_database(uri: &ConnectionUri) -> QueueResult<()> {
    let Some(name) = uri.database_name() else {
        return Ok(());
    };
    validate_identifier("database", &name)?;

    match uri.kind {
        BackendKind::Postgres => {
            let admin = SeaOrmDatabase::connect(uri.with_database(POSTGRES_MAINTENANCE_DB)?).await?;
            let exists = admin
                .query_one(Statement::from_sql_and_values(
                    DbBackend::Postgres,
                    "SELECT 1 FROM pg_database WHERE datname = $1",
                    [name.clone().into()],
                ))
                .await?
                .is_some();
            if exists {
                debug!("Database '{}' already exists", name);
            } else {
                admin
                    .execute_unprepared(&format!("CREATE DATABASE \"{name}\""))
                    .await?;
                info!("Created database '{}'", name);
            }
            admin.close().await?;
        }
        BackendKind::Mysql => {
            let admin = SeaOrmDatabase::connect(uri.with_database("")?).await?;
            admin
                .execute_unprepared(&format!("CREATE DATABASE IF NOT EXISTS `{name}`"))
                .await?;
            debug!("Ensured database '{}' exists", name);
            admin.close().await?;
        }
        _ => {}
    }
    Ok(())
}

/// Create a PostgreSQL schema inside a transaction
pub async fn ensure_schema(connection: &DatabaseConnection, schema: &str) -> QueueResult<()> {
    validate_identifier("schema", schema)?;
    let txn = connection.begin().await?;
    txn.execute_unprepared(&format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""))
        .await?;
    txn.commit().await?;
    debug!("Ensured schema '{}' exists", schema);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("database", "jobsmith").is_ok());
        assert!(validate_identifier("schema", "queue_v2").is_ok());
        assert!(validate_identifier("database", "").is_err());
        assert!(validate_identifier("database", "x\"; DROP TABLE jobs; --").is_err());
    }

    #[tokio::test]
    async fn test_sqlite_needs_no_database_bootstrap() {
        let uri = ConnectionUri::parse("sqlite::memory:").unwrap();
        assert!(ensure_database(&uri).await.is_ok());
    }
}
