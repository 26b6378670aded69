use std::collections::HashSet;

use sea_orm::{ConnectionTrait, DbBackend, Statement};
use sea_orm_migration::MigratorTrait;

use jobsmith::backends::uri::ConnectionUri;
use jobsmith::config::BackendConfig;
use jobsmith::database::Database;
use jobsmith::database::migrations::Migrator;

/// Migration names must be unique and shaped `mYYYYMMDD_HHMMSS_description`
#[test]
fn migration_names_are_unique_and_well_formed() {
    let mut seen = HashSet::new();
    let mut problems = Vec::new();

    for migration in Migrator::migrations() {
        let name = migration.name().to_string();
        if !is_valid_migration_name(&name) {
            problems.push(format!("invalid name: {name}"));
        }
        if !seen.insert(name.clone()) {
            problems.push(format!("duplicate name: {name}"));
        }
    }

    assert!(problems.is_empty(), "Migration naming guard failed:\n{}", problems.join("\n"));
}

fn is_valid_migration_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('m') else {
        return false;
    };
    let mut parts = rest.splitn(3, '_');
    let (Some(date), Some(time), Some(desc)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    date.len() == 8
        && date.chars().all(|c| c.is_ascii_digit())
        && time.len() == 6
        && time.chars().all(|c| c.is_ascii_digit())
        && !desc.is_empty()
        && desc
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[tokio::test]
async fn test_migrations_create_tables_and_are_repeatable() -> anyhow::Result<()> {
    let config = BackendConfig::from_uri("sqlite::memory:");
    let uri = ConnectionUri::from_config(&config)?;
    let database = Database::new(&uri, &config).await?;
    database.migrate().await?;
    database.migrate().await?;

    let rows = database
        .connection()
        .query_all(Statement::from_string(
            DbBackend::Sqlite,
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        ))
        .await?;
    let tables: Vec<String> = rows
        .iter()
        .map(|row| row.try_get::<String>("", "name"))
        .collect::<Result<_, _>>()?;
    assert!(tables.contains(&"jobs".to_string()), "{tables:?}");
    assert!(tables.contains(&"schedules".to_string()), "{tables:?}");
    Ok(())
}
