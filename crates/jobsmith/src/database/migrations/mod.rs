//! SeaORM migrations shared by SQLite, PostgreSQL and MySQL

use sea_orm_migration::prelude::*;

pub mod m20251001_000001_create_job_tables;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20251001_000001_create_job_tables::Migration)]
    }
}
