//! Migration to create the external_service_sync_jobs table.
//!
//! Each row is one reconciliation request for an external service. Workers move
//! rows through queued -> processing -> completed | errored | failed.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ExternalServiceSyncJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ExternalServiceSyncJobs::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ExternalServiceSyncJobs::State)
                            .text()
                            .not_null()
                            .default("queued"),
                    )
                    .col(
                        ColumnDef::new(ExternalServiceSyncJobs::FailureMessage)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServiceSyncJobs::QueuedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ExternalServiceSyncJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServiceSyncJobs::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServiceSyncJobs::ProcessAfter)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServiceSyncJobs::LastHeartbeatAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServiceSyncJobs::NumResets)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ExternalServiceSyncJobs::NumFailures)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ExternalServiceSyncJobs::ExternalServiceId)
                            .integer()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_external_service_sync_jobs_external_service_id")
                            .from(
                                ExternalServiceSyncJobs::Table,
                                ExternalServiceSyncJobs::ExternalServiceId,
                            )
                            .to(ExternalServices::Table, ExternalServices::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_external_service_sync_jobs_state_queued_at")
                    .table(ExternalServiceSyncJobs::Table)
                    .col(ExternalServiceSyncJobs::State)
                    .col(ExternalServiceSyncJobs::QueuedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_external_service_sync_jobs_service_state")
                    .table(ExternalServiceSyncJobs::Table)
                    .col(ExternalServiceSyncJobs::ExternalServiceId)
                    .col(ExternalServiceSyncJobs::State)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_external_service_sync_jobs_service_state")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_external_service_sync_jobs_state_queued_at")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(
                Table::drop()
                    .table(ExternalServiceSyncJobs::Table)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum ExternalServiceSyncJobs {
    Table,
    Id,
    State,
    FailureMessage,
    QueuedAt,
    StartedAt,
    FinishedAt,
    ProcessAfter,
    LastHeartbeatAt,
    NumResets,
    NumFailures,
    ExternalServiceId,
}

#[derive(DeriveIden)]
enum ExternalServices {
    Table,
    Id,
}
