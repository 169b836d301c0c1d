//! Database migrations for the repository sync service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_10_01_000001_create_users;
mod m2026_10_01_000002_create_external_services;
mod m2026_10_01_000003_create_repos;
mod m2026_10_01_000004_create_external_service_repos;
mod m2026_10_01_000005_create_external_service_sync_jobs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_10_01_000001_create_users::Migration),
            Box::new(m2026_10_01_000002_create_external_services::Migration),
            Box::new(m2026_10_01_000003_create_repos::Migration),
            Box::new(m2026_10_01_000004_create_external_service_repos::Migration),
            Box::new(m2026_10_01_000005_create_external_service_sync_jobs::Migration),
        ]
    }
}
