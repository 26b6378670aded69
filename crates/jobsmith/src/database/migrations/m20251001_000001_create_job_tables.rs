use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        self.create_jobs_table(manager).await?;
        self.create_schedules_table(manager).await?;
        self.create_indexes(manager).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Schedules::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await?;
        Ok(())
    }
}

impl Migration {
    fn create_timestamp_column(&self, manager: &SchemaManager, column: impl IntoIden) -> ColumnDef {
        let mut col = ColumnDef::new(column);
        match manager.get_database_backend() {
            sea_orm::DatabaseBackend::Postgres => col.timestamp_with_time_zone().not_null(),
            sea_orm::DatabaseBackend::MySql => col.timestamp().not_null(),
            sea_orm::DatabaseBackend::Sqlite => col.string().not_null(),
        };
        col
    }

    async fn create_jobs_table(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Jobs::Id)
                            .string_len(36)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Jobs::Function).string().not_null())
                    .col(ColumnDef::new(Jobs::Channel).string().not_null())
                    .col(ColumnDef::new(Jobs::State).string_len(16).not_null())
                    .col(ColumnDef::new(Jobs::ReadyAt).big_integer().not_null())
                    .col(self.create_timestamp_column(manager, Jobs::CreatedAt))
                    .col(ColumnDef::new(Jobs::ScheduleId).string())
                    .col(ColumnDef::new(Jobs::LeasedBy).string())
                    .col(ColumnDef::new(Jobs::ExpiresAt).big_integer())
                    .col(ColumnDef::new(Jobs::Document).text().not_null())
                    .to_owned(),
            )
            .await
    }

    async fn create_schedules_table(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Schedules::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Schedules::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Schedules::Name).string().not_null())
                    .col(ColumnDef::new(Schedules::Status).string_len(16).not_null())
                    .col(ColumnDef::new(Schedules::NextFireAt).big_integer())
                    .col(ColumnDef::new(Schedules::Document).text().not_null())
                    .col(self.create_timestamp_column(manager, Schedules::CreatedAt))
                    .col(self.create_timestamp_column(manager, Schedules::UpdatedAt))
                    .to_owned(),
            )
            .await
    }

    async fn create_indexes(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        // Lease scan: pending jobs on a channel, oldest ready first
        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_lease")
                    .table(Jobs::Table)
                    .col(Jobs::State)
                    .col(Jobs::Channel)
                    .col(Jobs::ReadyAt)
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_expires_at")
                    .table(Jobs::Table)
                    .col(Jobs::ExpiresAt)
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_schedule_id")
                    .table(Jobs::Table)
                    .col(Jobs::ScheduleId)
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_schedules_name")
                    .table(Schedules::Table)
                    .col(Schedules::Name)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
    Function,
    Channel,
    State,
    ReadyAt,
    CreatedAt,
    ScheduleId,
    LeasedBy,
    ExpiresAt,
    Document,
}

#[derive(DeriveIden)]
enum Schedules {
    Table,
    Id,
    Name,
    Status,
    NextFireAt,
    Document,
    CreatedAt,
    UpdatedAt,
}
