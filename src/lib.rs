//! # Reposync Library
//!
//! Keeps a catalog of code host repositories in sync with the external
//! services that source them: diffing, conflict resolution, scheduling and
//! the background job queue that drives it all.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod repositories;
pub mod scheduler;
pub mod sources;
pub mod sync;
pub mod sync_worker;
pub mod telemetry;
pub mod types;
pub use migration;
