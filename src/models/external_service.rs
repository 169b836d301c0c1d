//! ExternalService entity model
//!
//! One configured connection to a code host. Scheduling bookkeeping
//! (`last_sync_at`, `next_sync_at`) is written at the end of every
//! reconciliation pass.

use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "external_services")]
pub struct Model {
    /// Unique identifier (primary key)
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Code host kind, e.g. `GITHUB` or `OTHER`
    pub kind: String,

    /// Human readable name shown in errors and logs
    pub display_name: String,

    /// Kind-specific connection settings
    #[sea_orm(column_type = "JsonBinary")]
    pub config: JsonValue,

    /// Owning user for user-added services; `None` for site-owned ones
    pub namespace_user_id: Option<i32>,

    /// Whether this is the default service for its kind in cloud mode
    pub cloud_default: bool,

    pub last_sync_at: Option<DateTimeWithTimeZone>,

    pub next_sync_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    pub deleted_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::NamespaceUserId",
        to = "super::user::Column::Id"
    )]
    User,
    #[sea_orm(has_many = "super::external_service_repo::Entity")]
    ExternalServiceRepo,
    #[sea_orm(has_many = "super::sync_job::Entity")]
    SyncJob,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::external_service_repo::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExternalServiceRepo.def()
    }
}

impl Related<super::sync_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
