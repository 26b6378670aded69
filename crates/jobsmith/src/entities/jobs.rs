use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub function: String,
    pub channel: String,
    pub state: String,
    /// Earliest lease time, epoch milliseconds
    pub ready_at: i64,
    pub created_at: DateTimeUtc,
    pub schedule_id: Option<String>,
    pub leased_by: Option<String>,
    /// Result purge time, epoch milliseconds
    pub expires_at: Option<i64>,
    #[sea_orm(column_type = "Text")]
    pub document: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
