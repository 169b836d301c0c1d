//! # Data Models
//!
//! SeaORM entities backing the repository catalog and the sync job queue.

pub mod external_service;
pub mod external_service_repo;
pub mod repo;
pub mod sync_job;
pub mod user;

pub use external_service::Entity as ExternalService;
pub use external_service_repo::Entity as ExternalServiceRepo;
pub use repo::Entity as Repo;
pub use sync_job::Entity as SyncJob;
pub use user::Entity as User;
