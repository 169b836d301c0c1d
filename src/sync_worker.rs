//! Sync Worker
//!
//! Background loops around the sync job queue: a pool of workers that claim
//! jobs and run a [`Handler`] while heartbeating, a resetter that reclaims
//! stalled jobs, and a cleaner that purges finished jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, instrument, warn};

use crate::config::WorkerConfig;
use crate::error::{StoreError, SyncError};
use crate::repositories::{JobQueue, JobState, SyncJob};
use crate::telemetry::current_dispatch;

/// Work performed for one claimed job
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, job: &SyncJob, cancel: &CancellationToken) -> Result<(), SyncError>;
}

/// Pool of workers draining the sync job queue
pub struct SyncWorker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn Handler>,
    config: WorkerConfig,
}

impl SyncWorker {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn Handler>, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    /// Run `concurrent_external_service_syncers` worker loops until shutdown.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        let workers = self.config.concurrent_external_service_syncers.max(1);
        info!(workers, "Starting sync workers");

        let this = Arc::new(self);
        let mut loops = JoinSet::new();
        for worker in 0..workers {
            let this = this.clone();
            let shutdown = shutdown.clone();
            loops.spawn(
                async move { this.worker_loop(worker, shutdown).await }
                    .with_subscriber(current_dispatch()),
            );
        }
        while let Some(joined) = loops.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Sync worker panicked");
            }
        }

        info!("Sync workers stopped");
    }

    async fn worker_loop(&self, worker: usize, shutdown: CancellationToken) {
        let idle = Duration::from_secs(self.config.dequeue_interval_seconds);
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.process_next(&shutdown).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    counter!("reposync_worker_dequeue_errors_total").increment(1);
                    error!(worker, error = %err, "Failed to claim sync job");
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(idle) => {}
            }
        }
        debug!(worker, "Sync worker loop exited");
    }

    /// Claims and runs one job. Returns whether a job was found.
    pub async fn process_next(&self, shutdown: &CancellationToken) -> Result<bool, StoreError> {
        let Some(job) = self.queue.dequeue().await? else {
            return Ok(false);
        };
        self.process(job, shutdown).await?;
        Ok(true)
    }

    #[instrument(skip(self, job, shutdown), fields(job_id = job.id, external_service_id = job.external_service_id))]
    async fn process(&self, job: SyncJob, shutdown: &CancellationToken) -> Result<(), StoreError> {
        let started = Instant::now();
        let heartbeat_stop = shutdown.child_token();
        let heartbeat = tokio::spawn(
            heartbeat_loop(
                self.queue.clone(),
                job.id,
                Duration::from_secs(self.config.heartbeat_interval_seconds),
                heartbeat_stop.clone(),
            )
            .with_subscriber(current_dispatch()),
        );

        let result = self.handler.handle(&job, shutdown).await;

        heartbeat_stop.cancel();
        if let Err(err) = heartbeat.await {
            warn!(error = %err, "Heartbeat task failed");
        }
        histogram!("reposync_job_duration_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                self.queue.mark_completed(job.id).await?;
                counter!("reposync_jobs_total", "state" => "completed").increment(1);
                info!("Sync job completed");
            }
            Err(SyncError::Cancelled) if shutdown.is_cancelled() => {
                // Left processing; the resetter returns it to the queue.
                info!("Sync job interrupted by shutdown");
            }
            Err(err) => {
                let state = self.queue.mark_errored(job.id, &err.to_string()).await?;
                counter!("reposync_jobs_total", "state" => state.as_str()).increment(1);
                if state == JobState::Failed {
                    error!(error = %err, "Sync job failed permanently");
                } else {
                    warn!(error = %err, "Sync job errored, will retry");
                }
            }
        }
        Ok(())
    }
}

async fn heartbeat_loop(
    queue: Arc<dyn JobQueue>,
    job_id: i32,
    interval: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = sleep(interval) => {
                if let Err(err) = queue.heartbeat(job_id).await {
                    warn!(job_id, error = %err, "Failed to record heartbeat");
                }
            }
        }
    }
}

/// Returns stalled jobs to the queue
pub struct SyncJobResetter {
    queue: Arc<dyn JobQueue>,
    config: WorkerConfig,
}

impl SyncJobResetter {
    pub fn new(queue: Arc<dyn JobQueue>, config: WorkerConfig) -> Self {
        Self { queue, config }
    }

    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting sync job resetter");
        let interval = Duration::from_secs(self.config.resetter_interval_seconds);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(interval) => {
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "Resetter tick failed");
                    }
                }
            }
        }
        info!("Sync job resetter stopped");
    }

    pub async fn tick(&self) -> Result<(), StoreError> {
        let max_age = chrono::Duration::seconds(self.config.stalled_max_age_seconds as i64);
        let outcome = self
            .queue
            .reset_stalled(max_age, self.config.max_num_resets)
            .await?;
        counter!("reposync_jobs_reset_total").increment(outcome.reset);
        counter!("reposync_jobs_total", "state" => "failed").increment(outcome.failed);
        if outcome.reset > 0 || outcome.failed > 0 {
            warn!(
                reset = outcome.reset,
                failed = outcome.failed,
                "Reclaimed stalled sync jobs"
            );
        }
        Ok(())
    }
}

/// Deletes finished jobs past the retention window
pub struct JobCleaner {
    queue: Arc<dyn JobQueue>,
    config: WorkerConfig,
}

impl JobCleaner {
    pub fn new(queue: Arc<dyn JobQueue>, config: WorkerConfig) -> Self {
        Self { queue, config }
    }

    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting sync job cleaner");
        let interval = Duration::from_secs(self.config.cleanup_interval_seconds);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(interval) => {
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "Cleaner tick failed");
                    }
                }
            }
        }
        info!("Sync job cleaner stopped");
    }

    pub async fn tick(&self) -> Result<u64, StoreError> {
        let retention = chrono::Duration::seconds(self.config.job_retention_seconds as i64);
        let purged = self.queue.purge_finished(retention).await?;
        gauge!("reposync_jobs_purged_last").set(purged as f64);
        if purged > 0 {
            debug!(purged, "Purged finished sync jobs");
        }
        Ok(purged)
    }
}
