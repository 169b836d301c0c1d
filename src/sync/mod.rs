//! # Reconciliation
//!
//! Pure diffing and scheduling arithmetic plus the [`Syncer`] that applies
//! them against the store.

pub mod diff;
pub mod interval;
pub mod quota;
pub mod sources_diff;
pub mod syncer;

pub use diff::{Diff, new_diff, resolve_name_conflicts};
pub use interval::{MAX_SYNC_INTERVAL_SECONDS, calc_streaming_sync_interval, calc_sync_interval};
pub use quota::{QuotaError, QuotaGuard, RepoCounter};
pub use sources_diff::{SourceChanges, SourcesByRepo, SourcesDiff, diff_sources, sources_upserts};
pub use syncer::{SyncHandler, Syncer};
