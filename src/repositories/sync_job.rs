//! # SyncJob Repository
//!
//! Job queue over the external_service_sync_jobs table. Jobs move through
//! `queued -> processing -> completed | errored | failed`; errored jobs are
//! retried until the failure budget is spent, and stalled jobs are returned
//! to the queue by the resetter.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::{Expr, Query};
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, Condition, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use tracing::{debug, info, instrument};

use crate::error::StoreError;
use crate::models::external_service;
use crate::models::sync_job::{self, Column, Entity};
use crate::types::ExternalServiceId;

/// Attempts made to claim a job before giving up for this tick.
const MAX_CLAIM_ATTEMPTS: usize = 3;

/// Lifecycle state of a sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Errored,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Failed => "failed",
        }
    }

    /// States that block enqueueing another job for the same service.
    pub fn in_flight() -> [JobState; 3] {
        [Self::Queued, Self::Processing, Self::Errored]
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "errored" => Ok(Self::Errored),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Invalid(format!("unknown job state {other}"))),
        }
    }
}

/// A queued unit of work, identified by a single record ID.
pub trait Record {
    fn record_id(&self) -> i32;
}

/// One reconciliation request for an external service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    pub id: i32,
    pub state: JobState,
    pub external_service_id: ExternalServiceId,
    pub failure_message: Option<String>,
    pub num_resets: i32,
    pub num_failures: i32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Scheduled resync time of the service when the job was claimed
    pub next_sync_at: Option<DateTime<Utc>>,
}

impl Record for SyncJob {
    fn record_id(&self) -> i32 {
        self.id
    }
}

impl SyncJob {
    fn from_model(m: sync_job::Model) -> Result<Self, StoreError> {
        Ok(Self {
            id: m.id,
            state: m.state.parse()?,
            external_service_id: m.external_service_id,
            failure_message: m.failure_message,
            num_resets: m.num_resets,
            num_failures: m.num_failures,
            queued_at: m.queued_at.with_timezone(&Utc),
            started_at: m.started_at.map(|t| t.with_timezone(&Utc)),
            finished_at: m.finished_at.map(|t| t.with_timezone(&Utc)),
            next_sync_at: None,
        })
    }
}

/// Outcome of one stalled-job reset sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetOutcome {
    pub reset: u64,
    pub failed: u64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues a job for every due service without one in flight.
    async fn enqueue_sync_jobs(&self, is_cloud: bool) -> Result<u64, StoreError>;

    /// Enqueues a job for one service unless one is already in flight.
    /// Returns whether a job was created.
    async fn enqueue_single_sync_job(&self, id: ExternalServiceId) -> Result<bool, StoreError>;

    /// Claims the oldest runnable job.
    async fn dequeue(&self) -> Result<Option<SyncJob>, StoreError>;

    async fn heartbeat(&self, id: i32) -> Result<(), StoreError>;

    async fn mark_completed(&self, id: i32) -> Result<(), StoreError>;

    /// Records a handler failure and returns the resulting state.
    async fn mark_errored(&self, id: i32, message: &str) -> Result<JobState, StoreError>;

    /// Returns processing jobs without a recent heartbeat to the queue, or
    /// fails them once they have been reset `max_resets` times.
    async fn reset_stalled(
        &self,
        max_age: Duration,
        max_resets: u32,
    ) -> Result<ResetOutcome, StoreError>;

    /// Deletes completed and errored jobs finished before the retention window.
    async fn purge_finished(&self, retention: Duration) -> Result<u64, StoreError>;
}

/// Repository for sync job database operations
#[derive(Clone)]
pub struct SyncJobRepository {
    db: DatabaseConnection,
    max_num_retries: u32,
}

impl SyncJobRepository {
    /// Create a new SyncJobRepository with the given database connection
    pub fn new(db: DatabaseConnection, max_num_retries: u32) -> Self {
        Self {
            db,
            max_num_retries,
        }
    }

    /// Find a sync job by ID
    pub async fn find(&self, id: i32) -> Result<Option<SyncJob>, StoreError> {
        Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .map(SyncJob::from_model)
            .transpose()
    }

    /// List jobs for a service, oldest first
    pub async fn list_for_service(
        &self,
        external_service_id: ExternalServiceId,
    ) -> Result<Vec<SyncJob>, StoreError> {
        Entity::find()
            .filter(Column::ExternalServiceId.eq(external_service_id))
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(SyncJob::from_model)
            .collect()
    }

    fn in_flight_services() -> sea_orm::sea_query::SelectStatement {
        Query::select()
            .column(Column::ExternalServiceId)
            .from(Entity)
            .and_where(Column::State.is_in(JobState::in_flight().map(|s| s.as_str())))
            .to_owned()
    }

    fn new_job(external_service_id: ExternalServiceId, now: DateTime<Utc>) -> sync_job::ActiveModel {
        sync_job::ActiveModel {
            id: NotSet,
            state: Set(JobState::Queued.as_str().to_string()),
            failure_message: Set(None),
            queued_at: Set(now.fixed_offset()),
            started_at: Set(None),
            finished_at: Set(None),
            process_after: Set(None),
            last_heartbeat_at: Set(None),
            num_resets: Set(0),
            num_failures: Set(0),
            external_service_id: Set(external_service_id),
        }
    }
}

#[async_trait]
impl JobQueue for SyncJobRepository {
    #[instrument(skip(self))]
    async fn enqueue_sync_jobs(&self, is_cloud: bool) -> Result<u64, StoreError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let mut due = external_service::Entity::find()
            .select_only()
            .column(external_service::Column::Id)
            .filter(external_service::Column::DeletedAt.is_null())
            .filter(
                Condition::any()
                    .add(external_service::Column::NextSyncAt.is_null())
                    .add(external_service::Column::NextSyncAt.lte(now.fixed_offset())),
            )
            .filter(external_service::Column::Id.not_in_subquery(Self::in_flight_services()));
        if is_cloud {
            due = due.filter(
                Condition::any()
                    .add(external_service::Column::NamespaceUserId.gt(0))
                    .add(external_service::Column::CloudDefault.eq(true)),
            );
        }
        let ids: Vec<ExternalServiceId> = due
            .order_by_asc(external_service::Column::Id)
            .into_tuple()
            .all(&txn)
            .await?;

        if ids.is_empty() {
            txn.commit().await?;
            return Ok(0);
        }

        Entity::insert_many(ids.iter().map(|id| Self::new_job(*id, now)))
            .exec_without_returning(&txn)
            .await?;
        txn.commit().await?;

        info!(count = ids.len(), "Enqueued sync jobs");
        Ok(ids.len() as u64)
    }

    #[instrument(skip(self))]
    async fn enqueue_single_sync_job(&self, id: ExternalServiceId) -> Result<bool, StoreError> {
        let txn = self.db.begin().await?;

        let in_flight = Entity::find()
            .filter(Column::ExternalServiceId.eq(id))
            .filter(Column::State.is_in([JobState::Queued.as_str(), JobState::Processing.as_str()]))
            .one(&txn)
            .await?;
        if in_flight.is_some() {
            txn.commit().await?;
            debug!(external_service_id = id, "Sync job already in flight");
            return Ok(false);
        }

        Self::new_job(id, Utc::now()).insert(&txn).await?;
        txn.commit().await?;
        Ok(true)
    }

    async fn dequeue(&self) -> Result<Option<SyncJob>, StoreError> {
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let now = Utc::now().fixed_offset();
            let candidate = Entity::find()
                .filter(Column::State.is_in([JobState::Queued.as_str(), JobState::Errored.as_str()]))
                .filter(
                    Condition::any()
                        .add(Column::ProcessAfter.is_null())
                        .add(Column::ProcessAfter.lte(now)),
                )
                .order_by_asc(Column::QueuedAt)
                .order_by_asc(Column::Id)
                .one(&self.db)
                .await?;
            let Some(candidate) = candidate else {
                return Ok(None);
            };

            let claimed = Entity::update_many()
                .col_expr(Column::State, Expr::value(JobState::Processing.as_str()))
                .col_expr(Column::StartedAt, Expr::value(now))
                .col_expr(Column::LastHeartbeatAt, Expr::value(now))
                .col_expr(Column::FinishedAt, Expr::value(Option::<DateTime<Utc>>::None))
                .filter(Column::Id.eq(candidate.id))
                .filter(Column::State.eq(candidate.state.as_str()))
                .exec(&self.db)
                .await?;
            if claimed.rows_affected == 0 {
                debug!(job_id = candidate.id, "Lost claim race, retrying");
                continue;
            }

            let mut job = SyncJob::from_model(candidate)?;
            job.state = JobState::Processing;
            job.started_at = Some(now.with_timezone(&Utc));
            job.next_sync_at = external_service::Entity::find_by_id(job.external_service_id)
                .one(&self.db)
                .await?
                .and_then(|svc| svc.next_sync_at)
                .map(|t| t.with_timezone(&Utc));
            return Ok(Some(job));
        }
        Ok(None)
    }

    async fn heartbeat(&self, id: i32) -> Result<(), StoreError> {
        Entity::update_many()
            .col_expr(Column::LastHeartbeatAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .filter(Column::State.eq(JobState::Processing.as_str()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn mark_completed(&self, id: i32) -> Result<(), StoreError> {
        Entity::update_many()
            .col_expr(Column::State, Expr::value(JobState::Completed.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn mark_errored(&self, id: i32, message: &str) -> Result<JobState, StoreError> {
        let job = Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::Invalid(format!("sync job {id} not found")))?;

        let num_failures = job.num_failures + 1;
        let state = if num_failures as i64 > self.max_num_retries as i64 {
            JobState::Failed
        } else {
            JobState::Errored
        };

        let mut active: sync_job::ActiveModel = job.into();
        active.state = Set(state.as_str().to_string());
        active.num_failures = Set(num_failures);
        active.failure_message = Set(Some(message.to_string()));
        active.finished_at = Set(Some(Utc::now().fixed_offset()));
        active.update(&self.db).await?;

        Ok(state)
    }

    #[instrument(skip(self))]
    async fn reset_stalled(
        &self,
        max_age: Duration,
        max_resets: u32,
    ) -> Result<ResetOutcome, StoreError> {
        let now = Utc::now().fixed_offset();
        let cutoff = (Utc::now() - max_age).fixed_offset();
        let stalled = Condition::all()
            .add(Column::State.eq(JobState::Processing.as_str()))
            .add(
                Condition::any()
                    .add(Column::LastHeartbeatAt.is_null())
                    .add(Column::LastHeartbeatAt.lt(cutoff)),
            );

        let failed = Entity::update_many()
            .col_expr(Column::State, Expr::value(JobState::Failed.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(now))
            .col_expr(
                Column::FailureMessage,
                Expr::value("job processor died while handling this message too many times"),
            )
            .filter(stalled.clone())
            .filter(Column::NumResets.gte(max_resets as i32))
            .exec(&self.db)
            .await?
            .rows_affected;

        let reset = Entity::update_many()
            .col_expr(Column::State, Expr::value(JobState::Queued.as_str()))
            .col_expr(Column::StartedAt, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(
                Column::NumResets,
                Expr::col(Column::NumResets).add(1),
            )
            .filter(stalled)
            .filter(Column::NumResets.lt(max_resets as i32))
            .exec(&self.db)
            .await?
            .rows_affected;

        Ok(ResetOutcome { reset, failed })
    }

    #[instrument(skip(self))]
    async fn purge_finished(&self, retention: Duration) -> Result<u64, StoreError> {
        let cutoff = (Utc::now() - retention).fixed_offset();
        let result = Entity::delete_many()
            .filter(Column::State.is_in([JobState::Completed.as_str(), JobState::Errored.as_str()]))
            .filter(Column::FinishedAt.lt(cutoff))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_round_trips_through_strings() {
        for state in [
            JobState::Queued,
            JobState::Processing,
            JobState::Completed,
            JobState::Errored,
            JobState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("running".parse::<JobState>().is_err());
    }
}
