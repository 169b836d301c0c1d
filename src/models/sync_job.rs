//! SyncJob entity model
//!
//! This module contains the SeaORM entity model for the
//! external_service_sync_jobs table, which records one reconciliation request
//! per row.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

/// Sync job row consumed by the worker pool
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "external_service_sync_jobs")]
pub struct Model {
    /// Unique identifier for the sync job (primary key)
    #[sea_orm(primary_key)]
    pub id: i32,

    /// One of queued, processing, completed, errored, failed
    pub state: String,

    /// Last handler or resetter failure, if any
    pub failure_message: Option<String>,

    /// Timestamp when the job was enqueued
    pub queued_at: DateTimeWithTimeZone,

    /// Timestamp when a worker claimed the job
    pub started_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the job reached a terminal state
    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Earliest time the job may be dequeued again
    pub process_after: Option<DateTimeWithTimeZone>,

    /// Last liveness signal from the worker processing the job
    pub last_heartbeat_at: Option<DateTimeWithTimeZone>,

    /// Number of times the resetter returned this job to the queue
    pub num_resets: i32,

    /// Number of handler failures recorded for this job
    pub num_failures: i32,

    /// External service to reconcile
    pub external_service_id: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::external_service::Entity",
        from = "Column::ExternalServiceId",
        to = "super::external_service::Column::Id"
    )]
    ExternalService,
}

impl Related<super::external_service::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExternalService.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
