//! Migration to create the repos table.
//!
//! Repository identity is the external spec triple. Names are unique
//! case-insensitively among rows that are not soft-deleted.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Repos::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Repos::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Repos::Name).text().not_null())
                    .col(ColumnDef::new(Repos::Uri).text().not_null().default(""))
                    .col(
                        ColumnDef::new(Repos::Description)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Repos::Fork).boolean().not_null().default(false))
                    .col(
                        ColumnDef::new(Repos::Archived)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Repos::Private)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Repos::ExternalServiceType).text().not_null())
                    .col(ColumnDef::new(Repos::ExternalServiceId).text().not_null())
                    .col(ColumnDef::new(Repos::ExternalId).text().not_null())
                    .col(
                        ColumnDef::new(Repos::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Repos::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Repos::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_repos_external_repo_unique")
                    .table(Repos::Table)
                    .col(Repos::ExternalServiceType)
                    .col(Repos::ExternalServiceId)
                    .col(Repos::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Expression and partial indexes are not expressible through the index builder.
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_repos_name_unique ON repos (lower(name)) WHERE deleted_at IS NULL".to_string(),
            ))
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_repos_name_unique").to_owned())
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_repos_external_repo_unique")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Repos::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Repos {
    Table,
    Id,
    Name,
    Uri,
    Description,
    Fork,
    Archived,
    Private,
    ExternalServiceType,
    ExternalServiceId,
    ExternalId,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}
