//! Migration to create the external_service_repos table.
//!
//! One row per service-membership: the claim an external service holds on a repo.
//! `user_id` is copied from the owning service so user-added repos can be counted
//! without a join.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ExternalServiceRepos::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ExternalServiceRepos::ExternalServiceId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServiceRepos::RepoId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServiceRepos::CloneUrl)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServiceRepos::UserId)
                            .integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExternalServiceRepos::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(
                        Index::create()
                            .col(ExternalServiceRepos::ExternalServiceId)
                            .col(ExternalServiceRepos::RepoId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_external_service_repos_external_service_id")
                            .from(
                                ExternalServiceRepos::Table,
                                ExternalServiceRepos::ExternalServiceId,
                            )
                            .to(ExternalServices::Table, ExternalServices::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_external_service_repos_repo_id")
                            .from(ExternalServiceRepos::Table, ExternalServiceRepos::RepoId)
                            .to(Repos::Table, Repos::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_external_service_repos_repo_id")
                    .table(ExternalServiceRepos::Table)
                    .col(ExternalServiceRepos::RepoId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_external_service_repos_user_id")
                    .table(ExternalServiceRepos::Table)
                    .col(ExternalServiceRepos::UserId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_external_service_repos_user_id")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_external_service_repos_repo_id")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(ExternalServiceRepos::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ExternalServiceRepos {
    Table,
    ExternalServiceId,
    RepoId,
    CloneUrl,
    UserId,
    CreatedAt,
}

#[derive(DeriveIden)]
enum ExternalServices {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum Repos {
    Table,
    Id,
}
