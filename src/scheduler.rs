//! # Sync Scheduler
//!
//! Background task that periodically enqueues sync jobs for every external
//! service whose next sync time has passed. At most one job per service is in
//! flight; the queue enforces that on insert, so several instances may tick
//! concurrently.

use std::sync::Arc;

use metrics::{counter, histogram};
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::SyncConfig;
use crate::error::StoreError;
use crate::repositories::JobQueue;

/// Background scheduler service.
pub struct SyncScheduler {
    queue: Arc<dyn JobQueue>,
    config: Arc<SyncConfig>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub jobs_enqueued: u64,
    pub skipped_disabled: bool,
}

impl SyncScheduler {
    pub fn new(queue: Arc<dyn JobQueue>, config: Arc<SyncConfig>) -> Self {
        Self { queue, config }
    }

    /// Run the scheduler loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting sync scheduler");
        let tick_interval = Duration::from_secs(self.config.enqueue_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync scheduler shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick().await {
                        counter!("reposync_scheduler_errors_total").increment(1);
                        error!(error = %err, "Scheduler tick failed");
                    }
                    histogram!("reposync_scheduler_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    pub async fn tick(&self) -> Result<TickStats, StoreError> {
        let mut stats = TickStats::default();

        if self.config.disable_auto_code_host_syncs {
            stats.skipped_disabled = true;
            debug!("Automatic code host syncs disabled; skipping enqueue");
            return Ok(stats);
        }

        stats.jobs_enqueued = self.queue.enqueue_sync_jobs(self.config.cloud_mode).await?;
        counter!("reposync_scheduler_jobs_enqueued_total").increment(stats.jobs_enqueued);

        debug!(
            enqueued = stats.jobs_enqueued,
            cloud_mode = self.config.cloud_mode,
            "Scheduler tick completed"
        );
        Ok(stats)
    }
}
