//! # Repository Layer
//!
//! Data access for the repo catalog and the sync job queue. The engine only
//! talks to the [`Store`] and [`JobQueue`] traits; the SeaORM types are the
//! production implementations.

pub mod sea_store;
pub mod store;
pub mod sync_job;

pub use sea_store::SeaOrmStore;
pub use store::{
    ExternalServicesListOptions, ReposListOptions, Store, Transaction, finish,
};
pub use sync_job::{JobQueue, JobState, Record, ResetOutcome, SyncJob, SyncJobRepository};
