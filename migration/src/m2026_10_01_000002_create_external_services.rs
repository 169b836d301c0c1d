//! Migration to create the external_services table.
//!
//! An external service is one configured connection to a code host. Rows with a
//! `namespace_user_id` are user-owned and subject to repository quotas.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ExternalServices::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ExternalServices::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ExternalServices::Kind).text().not_null())
                    .col(
                        ColumnDef::new(ExternalServices::DisplayName)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ExternalServices::Config).json_binary().not_null())
                    .col(
                        ColumnDef::new(ExternalServices::NamespaceUserId)
                            .integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::CloudDefault)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::NextSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ExternalServices::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_external_services_namespace_user_id")
                            .from(ExternalServices::Table, ExternalServices::NamespaceUserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // The enqueue loop scans for services that are due.
        manager
            .create_index(
                Index::create()
                    .name("idx_external_services_next_sync_at")
                    .table(ExternalServices::Table)
                    .col(ExternalServices::NextSyncAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_external_services_next_sync_at")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(ExternalServices::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ExternalServices {
    Table,
    Id,
    Kind,
    DisplayName,
    Config,
    NamespaceUserId,
    CloudDefault,
    LastSyncAt,
    NextSyncAt,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
}
