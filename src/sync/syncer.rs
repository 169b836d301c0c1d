//! # Syncer
//!
//! Drives reconciliation passes for external services. A batch pass sources
//! every repository of a service and applies the resulting [`Diff`] in one
//! transaction; a streaming pass reconciles each sourced repository in its own
//! transaction and finishes with a sweep of everything it did not see.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument, debug, dispatcher, error, info, info_span, warn};

use crate::config::{ExternalServiceUserMode, SyncConfig, WorkerConfig};
use crate::error::{MultiError, StoreError, SyncError};
use crate::repositories::{
    ExternalServicesListOptions, JobQueue, ReposListOptions, Store, SyncJob, finish,
};
use crate::scheduler::SyncScheduler;
use crate::sources::{self, OnSourced, Sourcer};
use crate::sync::diff::{Diff, new_diff, resolve_name_conflicts};
use crate::sync::interval::{calc_streaming_sync_interval, calc_sync_interval};
use crate::sync::quota::{QuotaGuard, RepoCounter};
use crate::sync::sources_diff::{SourcesByRepo, sources_upserts};
use crate::sync_worker::{Handler, JobCleaner, SyncJobResetter, SyncWorker};
use crate::types::{
    ExternalRepoSpec, ExternalService, ExternalServiceId, ExternalServiceKind, Repo, RepoId,
};

/// Sourced repos looked up per store query when searching for collisions.
const LOOKUP_CHUNK_SIZE: usize = 200;

/// Reconciles external services against the repo catalog
pub struct Syncer {
    store: Arc<dyn Store>,
    sourcer: Arc<dyn Sourcer>,
    config: Arc<SyncConfig>,
    quota: QuotaGuard,
    synced: Option<mpsc::Sender<Diff>>,
    logger: Dispatch,
    clock: fn() -> DateTime<Utc>,
    streaming: bool,
}

impl Syncer {
    pub fn new(store: Arc<dyn Store>, sourcer: Arc<dyn Sourcer>, config: Arc<SyncConfig>) -> Self {
        Self {
            quota: QuotaGuard::from_config(&config),
            streaming: config.streaming_sync,
            store,
            sourcer,
            config,
            synced: None,
            logger: Dispatch::none(),
            clock: Utc::now,
        }
    }

    /// Publish every diff on `synced`.
    pub fn with_synced(mut self, synced: mpsc::Sender<Diff>) -> Self {
        self.synced = Some(synced);
        self
    }

    /// Route this syncer's events and spans to `logger`.
    pub fn with_logger(mut self, logger: Dispatch) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Reconciles every repository of one external service.
    ///
    /// Credential failures from the source reconcile the service to zero
    /// repositories; the typed error is returned once the pass has committed.
    pub async fn sync_external_service(
        &self,
        id: ExternalServiceId,
        min_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let span = dispatcher::with_default(&self.logger, || {
            info_span!("sync_external_service", external_service_id = id)
        });
        self.sync_external_service_inner(id, min_interval, cancel)
            .instrument(span)
            .with_subscriber(self.logger.clone())
            .await
    }

    async fn sync_external_service_inner(
        &self,
        id: ExternalServiceId,
        min_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let started = Instant::now();
        counter!("reposync_sync_started_total").increment(1);

        let result = async {
            let svc = self
                .store
                .get_external_service(id)
                .await
                .map_err(SyncError::store("fetching external service"))?;
            if self.streaming {
                self.stream_external_service(svc, min_interval, cancel).await
            } else {
                self.batch_external_service(svc, min_interval, cancel).await
            }
        }
        .await;

        histogram!("reposync_sync_duration_seconds").record(started.elapsed().as_secs_f64());
        match &result {
            Ok(()) => {
                gauge!("reposync_last_sync_timestamp").set((self.clock)().timestamp() as f64);
            }
            Err(err) => {
                counter!("reposync_sync_errors_total").increment(1);
                warn!(error = %err, "Reconciliation pass finished with errors");
            }
        }
        result
    }

    async fn batch_external_service(
        &self,
        mut svc: ExternalService,
        min_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let counter = match svc.user_id() {
            Some(_) => {
                let site_added = self
                    .store
                    .count_user_added_repos(&[])
                    .await
                    .map_err(SyncError::store("counting user added repos"))?;
                self.quota.check_site(site_added)?;
                Some(self.quota.sourced_counter())
            }
            None => None,
        };

        // Site-owned repos that are clearly new are inserted while sourcing so
        // they are visible before the pass commits.
        let known = match &counter {
            None if self.config.streaming_insert => Some(
                self.store
                    .list_external_repo_specs()
                    .await
                    .map_err(SyncError::store("listing external repo specs"))?,
            ),
            _ => None,
        };

        let source = self
            .sourcer
            .source(&svc)
            .map_err(|e| SyncError::source(&svc.display_name, e))?;
        let mut hook = BatchHook {
            syncer: self,
            svc: &svc,
            cancel,
            counter,
            known,
        };
        let listing = sources::list_all(
            source,
            self.config.source_channel_capacity,
            cancel,
            &mut hook,
        )
        .await?;

        let mut errs = MultiError::default();
        for err in listing.errors {
            errs.push(SyncError::source(&svc.display_name, err));
        }
        let mut sourced = listing.repos;
        let mut credential_err = None;
        if !errs.is_empty() {
            let err = SyncError::Multi(errs);
            match err.credential_failure() {
                Some(typed) => {
                    warn!(error = %err, "Source rejected credentials, reconciling to zero repos");
                    sourced.clear();
                    credential_err = Some(typed);
                }
                None => return Err(err),
            }
        }

        if !self.allows_private(&svc).await? {
            sourced.retain(|repo| !repo.private);
        }

        let tx = self
            .store
            .transact()
            .await
            .map_err(SyncError::store("opening transaction"))?;
        let result = self
            .apply_batch(tx.as_store(), &mut svc, sourced, min_interval, cancel)
            .await;
        let diff = finish(tx, result).await?;

        info!(
            added = diff.added.len(),
            modified = diff.modified.len(),
            deleted = diff.deleted.len(),
            unmodified = diff.unmodified.len(),
            "Reconciled external service"
        );
        record_diff(&diff);
        self.publish(diff, cancel).await;

        credential_err.map_or(Ok(()), Err)
    }

    /// Writes one batch pass inside `store`, which must be a transaction.
    async fn apply_batch(
        &self,
        store: &dyn Store,
        svc: &mut ExternalService,
        mut sourced: Vec<Repo>,
        min_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<Diff, SyncError> {
        let mut stored = store
            .list_repos(ReposListOptions {
                external_service_ids: vec![svc.id],
                ..Default::default()
            })
            .await
            .map_err(SyncError::store("listing stored repos"))?;
        let stored_ids: HashSet<RepoId> = stored.iter().map(|r| r.id).collect();

        // Rows held by other services: the same repo becomes part of the
        // stored set, anything else sharing a name is a conflict.
        let sourced_specs: HashSet<_> = sourced.iter().map(|r| r.external_repo.clone()).collect();
        let mut conflicting = Vec::new();
        for repo in list_related(store, &sourced).await? {
            if stored_ids.contains(&repo.id) {
                continue;
            }
            if sourced_specs.contains(&repo.external_repo) {
                stored.push(repo);
            } else {
                conflicting.push(repo);
            }
        }

        // Keep the memberships other services hold on sourced repos.
        let stored_sources: HashMap<_, _> = stored
            .iter()
            .map(|r| (r.external_repo.clone(), &r.sources))
            .collect();
        for repo in &mut sourced {
            if let Some(sources) = stored_sources.get(&repo.external_repo) {
                for (urn, info) in sources.iter() {
                    repo.sources.entry(urn.clone()).or_insert_with(|| info.clone());
                }
            }
        }

        let previous: Vec<Repo> = stored.iter().chain(conflicting.iter()).cloned().collect();
        let mut diff = new_diff(Some(&*svc), sourced, stored);
        resolve_name_conflicts(&mut diff, &conflicting);

        let empty = SourcesByRepo::new();
        let stale = sources_upserts(&diff, &previous);
        store
            .upsert_sources(&empty, &empty, &stale.deleted)
            .await
            .map_err(SyncError::store("deleting stale memberships"))?;

        let now = (self.clock)();
        let orphaned: Vec<RepoId> = diff
            .deleted
            .iter_mut()
            .filter(|r| r.id != 0 && r.sources.is_empty())
            .map(|r| {
                r.deleted_at = Some(now);
                r.id
            })
            .collect();
        store
            .delete_repos(&orphaned)
            .await
            .map_err(SyncError::store("deleting repos"))?;

        for repo in &mut diff.modified {
            repo.updated_at = Some(now);
            repo.deleted_at = None;
        }
        for repo in &mut diff.added {
            repo.created_at = Some(now);
            repo.updated_at = Some(now);
            repo.deleted_at = None;
        }
        store
            .upsert_repos(&mut diff.modified)
            .await
            .map_err(SyncError::store("updating repos"))?;
        store
            .upsert_repos(&mut diff.added)
            .await
            .map_err(SyncError::store("inserting repos"))?;

        let fresh = sources_upserts(&diff, &previous);
        store
            .upsert_sources(&fresh.added, &fresh.modified, &empty)
            .await
            .map_err(SyncError::store("upserting memberships"))?;

        let interval = calc_sync_interval(now, svc.last_sync_at, min_interval, &diff);
        svc.last_sync_at = Some(now);
        svc.next_sync_at = Some(now + interval);
        store
            .upsert_external_service(svc)
            .await
            .map_err(SyncError::store("updating external service"))?;

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        diff.sort();
        Ok(diff)
    }

    async fn stream_external_service(
        &self,
        mut svc: ExternalService,
        min_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let allow_private = self.allows_private(&svc).await?;
        let source = self
            .sourcer
            .source(&svc)
            .map_err(|e| SyncError::source(&svc.display_name, e))?;

        let producer_cancel = cancel.child_token();
        let (mut rx, producer) = sources::spawn_listing(
            source,
            self.config.source_channel_capacity,
            producer_cancel.clone(),
        );

        let mut errs = MultiError::default();
        let mut seen: HashSet<RepoId> = HashSet::new();
        let mut modified = false;
        let mut cancelled = false;

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                item = rx.recv() => item,
            };
            let Some(item) = item else {
                break;
            };

            let sourced = match item {
                Ok(repo) => repo,
                Err(err) => {
                    let err = SyncError::source(&svc.display_name, err);
                    let credential = err.credential_failure().is_some();
                    errs.push(err);
                    if credential {
                        warn!("Source rejected credentials, sweeping every repo of the service");
                        seen.clear();
                        break;
                    }
                    continue;
                }
            };

            if sourced.private && !allow_private {
                continue;
            }

            match self.sync(&svc, sourced, cancel).await {
                Ok(diff) => {
                    seen.extend(diff.repos().map(|r| r.id).filter(|id| *id != 0));
                    modified |= !diff.added.is_empty() || !diff.modified.is_empty();
                }
                Err(err) => {
                    if err.is_quota() {
                        warn!(error = %err, "Repo quota reached, skipping insertion");
                    } else {
                        debug!(error = %err, "Failed to reconcile sourced repo");
                    }
                    errs.push(err);
                }
            }
        }

        sources::drain(&producer_cancel, rx, producer).await;
        if cancelled {
            return Err(SyncError::Cancelled);
        }

        let tx = self
            .store
            .transact()
            .await
            .map_err(SyncError::store("opening transaction"))?;
        let swept = tx.delete_external_service_repos_not_in(&svc, &seen).await;
        let swept = finish(tx, swept)
            .await
            .map_err(SyncError::store("sweeping unseen repos"))?;

        if !swept.is_empty() {
            modified = true;
            let deleted = self
                .store
                .list_repos(ReposListOptions {
                    ids: swept,
                    include_deleted: true,
                    ..Default::default()
                })
                .await
                .map_err(SyncError::store("listing swept repos"))?;
            let diff = Diff {
                deleted,
                ..Default::default()
            };
            record_diff(&diff);
            self.publish(diff, cancel).await;
        }

        let now = (self.clock)();
        let interval = calc_streaming_sync_interval(
            now,
            svc.last_sync_at,
            min_interval,
            modified,
            !errs.is_empty(),
        );
        svc.last_sync_at = Some(now);
        svc.next_sync_at = Some(now + interval);
        self.store
            .upsert_external_service(&mut svc)
            .await
            .map_err(SyncError::store("updating external service"))?;

        info!(
            seen = seen.len(),
            errors = errs.len(),
            modified,
            "Streamed external service"
        );
        errs.into_result()
    }

    /// Reconciles one sourced repo in its own transaction and publishes the
    /// result.
    pub async fn sync(
        &self,
        svc: &ExternalService,
        sourced: Repo,
        cancel: &CancellationToken,
    ) -> Result<Diff, SyncError> {
        let tx = self
            .store
            .transact()
            .await
            .map_err(SyncError::store("opening transaction"))?;
        let result = self.sync_in(tx.as_store(), svc, sourced).await;
        let diff = finish(tx, result).await?;

        record_diff(&diff);
        if !diff.is_empty() {
            self.publish(diff.clone(), cancel).await;
        }
        Ok(diff)
    }

    async fn sync_in(
        &self,
        store: &dyn Store,
        svc: &ExternalService,
        mut sourced: Repo,
    ) -> Result<Diff, SyncError> {
        let matching = store
            .list_repos(ReposListOptions {
                names: vec![sourced.name.clone()],
                external_repos: vec![sourced.external_repo.clone()],
                use_or: true,
                include_deleted: true,
                ..Default::default()
            })
            .await
            .map_err(SyncError::store("listing matching repos"))?;
        // Tombstones that only share the name are unrelated to this repo.
        let mut stored: Vec<Repo> = matching
            .into_iter()
            .filter(|r| r.deleted_at.is_none() || r.external_repo == sourced.external_repo)
            .collect();

        let now = (self.clock)();
        let mut diff = Diff::default();

        let existing = match stored.len() {
            0 => None,
            1 => stored.pop(),
            2 => {
                // The name belongs to another identity; that row loses it.
                let pos = stored
                    .iter()
                    .position(|r| r.external_repo != sourced.external_repo)
                    .unwrap_or_else(|| {
                        unreachable!("two rows share identity {}", sourced.external_repo)
                    });
                let mut conflicting = stored.remove(pos);
                store
                    .delete_repos(&[conflicting.id])
                    .await
                    .map_err(SyncError::store("deleting conflicting repo"))?;
                conflicting.sources.clear();
                conflicting.deleted_at = Some(now);
                diff.deleted.push(conflicting);
                stored.pop()
            }
            n => unreachable!("{n} rows match repo {} by name or identity", sourced.name),
        };

        match existing {
            Some(mut existing) => {
                for (urn, info) in &existing.sources {
                    sourced
                        .sources
                        .entry(urn.clone())
                        .or_insert_with(|| info.clone());
                }
                if existing.update(&sourced) {
                    existing.updated_at = Some(now);
                    store
                        .update_external_service_repo(svc, &existing)
                        .await
                        .map_err(SyncError::store("updating repo"))?;
                    diff.modified.push(existing);
                } else {
                    diff.unmodified.push(existing);
                }
            }
            None => {
                if let Some(user_id) = svc.user_id() {
                    let site_added = store
                        .count_user_added_repos(&[])
                        .await
                        .map_err(SyncError::store("counting user added repos"))?;
                    let user_added = store
                        .count_user_added_repos(&[user_id])
                        .await
                        .map_err(SyncError::store("counting user added repos"))?;
                    self.quota.check_insert(site_added, user_added)?;
                }
                sourced.id = 0;
                sourced.created_at = Some(now);
                sourced.updated_at = Some(now);
                sourced.deleted_at = None;
                store
                    .create_external_service_repo(svc, &mut sourced)
                    .await
                    .map_err(SyncError::store("inserting repo"))?;
                diff.added.push(sourced);
            }
        }

        Ok(diff)
    }

    /// Inserts `sourced` in its own transaction unless a live repo already
    /// holds its name or identity.
    async fn insert_if_new(
        &self,
        svc: &ExternalService,
        sourced: &Repo,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let tx = self
            .store
            .transact()
            .await
            .map_err(SyncError::store("opening transaction"))?;
        let result = self.insert_in(tx.as_store(), svc, sourced.clone()).await;
        let diff = finish(tx, result).await?;

        if !diff.is_empty() {
            debug!(name = %sourced.name, "Inserted new repo ahead of batch write");
            record_diff(&diff);
            self.publish(diff, cancel).await;
        }
        Ok(())
    }

    async fn insert_in(
        &self,
        store: &dyn Store,
        svc: &ExternalService,
        mut sourced: Repo,
    ) -> Result<Diff, SyncError> {
        let related = store
            .list_repos(ReposListOptions {
                names: vec![sourced.name.clone()],
                external_repos: vec![sourced.external_repo.clone()],
                use_or: true,
                ..Default::default()
            })
            .await
            .map_err(SyncError::store("listing matching repos"))?;
        if !related.is_empty() {
            return Ok(Diff::default());
        }

        let now = (self.clock)();
        sourced.id = 0;
        sourced.created_at = Some(now);
        sourced.updated_at = Some(now);
        sourced.deleted_at = None;
        store
            .create_external_service_repo(svc, &mut sourced)
            .await
            .map_err(SyncError::store("inserting repo"))?;
        Ok(Diff {
            added: vec![sourced],
            ..Default::default()
        })
    }

    /// Reconciles one sourced repo against the cloud default service of its
    /// kind.
    pub async fn sync_repo(
        &self,
        sourced: Repo,
        cancel: &CancellationToken,
    ) -> Result<Diff, SyncError> {
        let span = dispatcher::with_default(&self.logger, || {
            info_span!("sync_repo", name = %sourced.name)
        });
        async {
            let service_type = sourced.external_repo.service_type.clone();
            let kind = ExternalServiceKind::from_service_type(&service_type).ok_or_else(|| {
                SyncError::Store {
                    context: "resolving service kind",
                    source: StoreError::Invalid(format!("unknown service type {service_type}")),
                }
            })?;
            let svc = self
                .store
                .list_external_services(ExternalServicesListOptions {
                    kinds: vec![kind],
                    only_cloud_default: true,
                    limit: Some(1),
                    ..Default::default()
                })
                .await
                .map_err(SyncError::store("listing external services"))?
                .into_iter()
                .next()
                .ok_or_else(|| SyncError::Store {
                    context: "resolving cloud default service",
                    source: StoreError::NoCloudDefault { service_type },
                })?;

            self.sync(&svc, sourced, cancel).await
        }
        .instrument(span)
        .with_subscriber(self.logger.clone())
        .await
    }

    /// Publishes every stored repo as unmodified so consumers can rebuild
    /// their state. Skipped in cloud mode.
    pub async fn initial_unmodified_diff_from_store(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        if self.config.cloud_mode || self.synced.is_none() {
            return Ok(());
        }
        async {
            let repos = self
                .store
                .list_repos(ReposListOptions::default())
                .await
                .map_err(SyncError::store("listing stored repos"))?;
            debug!(count = repos.len(), "Publishing initial diff");
            let mut diff = Diff {
                unmodified: repos,
                ..Default::default()
            };
            diff.sort();
            self.publish(diff, cancel).await;
            Ok(())
        }
        .with_subscriber(self.logger.clone())
        .await
    }

    /// Enqueues a sync job for one service unless one is already in flight.
    pub async fn trigger_external_service_sync(
        &self,
        queue: &dyn JobQueue,
        id: ExternalServiceId,
    ) -> Result<bool, SyncError> {
        async {
            let enqueued = queue
                .enqueue_single_sync_job(id)
                .await
                .map_err(SyncError::store("enqueueing sync job"))?;
            info!(external_service_id = id, enqueued, "Triggered external service sync");
            Ok(enqueued)
        }
        .with_subscriber(self.logger.clone())
        .await
    }

    /// Runs the worker pool, resetter, cleaner and enqueue loop until
    /// `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        queue: Arc<dyn JobQueue>,
        worker: WorkerConfig,
        shutdown: CancellationToken,
    ) {
        let logger = self.logger.clone();
        async move {
            if let Err(err) = self.initial_unmodified_diff_from_store(&shutdown).await {
                warn!(error = %err, "Failed to publish initial diff");
            }

            let handler: Arc<dyn Handler> = Arc::new(SyncHandler::new(self.clone()));
            let mut tasks = JoinSet::new();
            tasks.spawn(
                SyncWorker::new(queue.clone(), handler, worker.clone())
                    .run(shutdown.clone())
                    .with_subscriber(self.logger.clone()),
            );
            tasks.spawn(
                SyncJobResetter::new(queue.clone(), worker.clone())
                    .run(shutdown.clone())
                    .with_subscriber(self.logger.clone()),
            );
            if worker.cleanup_old_jobs {
                tasks.spawn(
                    JobCleaner::new(queue.clone(), worker.clone())
                        .run(shutdown.clone())
                        .with_subscriber(self.logger.clone()),
                );
            }
            tasks.spawn(
                SyncScheduler::new(queue, self.config.clone())
                    .run(shutdown.clone())
                    .with_subscriber(self.logger.clone()),
            );

            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    error!(error = %err, "Background sync task panicked");
                }
            }
            info!("Syncer stopped");
        }
        .with_subscriber(logger)
        .await
    }

    async fn allows_private(&self, svc: &ExternalService) -> Result<bool, SyncError> {
        let Some(user_id) = svc.user_id() else {
            return Ok(true);
        };
        if self.config.external_service_user_mode == ExternalServiceUserMode::All {
            return Ok(true);
        }
        self.store
            .user_allows_private_code(user_id)
            .await
            .map_err(SyncError::store("checking private code permission"))
    }

    /// Best-effort delivery; gives up when the pass is cancelled.
    async fn publish(&self, diff: Diff, cancel: &CancellationToken) {
        let Some(synced) = &self.synced else {
            return;
        };
        tokio::select! {
            _ = cancel.cancelled() => debug!("Dropped diff notification on cancellation"),
            sent = synced.send(diff) => {
                if sent.is_err() {
                    debug!("Diff notification receiver is gone");
                }
            }
        }
    }
}

/// Looks up live repos sharing a name or an identity with any sourced repo.
async fn list_related(store: &dyn Store, sourced: &[Repo]) -> Result<Vec<Repo>, SyncError> {
    let mut related: BTreeMap<RepoId, Repo> = BTreeMap::new();
    for chunk in sourced.chunks(LOOKUP_CHUNK_SIZE) {
        let repos = store
            .list_repos(ReposListOptions {
                names: chunk.iter().map(|r| r.name.clone()).collect(),
                external_repos: chunk.iter().map(|r| r.external_repo.clone()).collect(),
                use_or: true,
                ..Default::default()
            })
            .await
            .map_err(SyncError::store("listing conflicting repos"))?;
        related.extend(repos.into_iter().map(|r| (r.id, r)));
    }
    Ok(related.into_values().collect())
}

/// Per-repo work of a batch listing: the per-user ceiling for user-owned
/// services, early inserts for site-owned ones.
struct BatchHook<'a> {
    syncer: &'a Syncer,
    svc: &'a ExternalService,
    cancel: &'a CancellationToken,
    counter: Option<RepoCounter>,
    known: Option<HashSet<ExternalRepoSpec>>,
}

#[async_trait]
impl OnSourced for BatchHook<'_> {
    async fn on_sourced(&mut self, repo: &Repo) -> Result<(), SyncError> {
        if let Some(counter) = &self.counter {
            counter.try_increment()?;
        }
        let Some(known) = &mut self.known else {
            return Ok(());
        };
        if !known.insert(repo.external_repo.clone()) {
            return Ok(());
        }
        // The batch write picks the repo up again if this fails.
        if let Err(err) = self.syncer.insert_if_new(self.svc, repo, self.cancel).await {
            warn!(error = %err, name = %repo.name, "Early insert failed");
        }
        Ok(())
    }
}

fn record_diff(diff: &Diff) {
    for (state, count) in [
        ("added", diff.added.len()),
        ("modified", diff.modified.len()),
        ("deleted", diff.deleted.len()),
        ("unmodified", diff.unmodified.len()),
    ] {
        if count > 0 {
            counter!("reposync_synced_repos_total", "state" => state).increment(count as u64);
        }
    }
}

/// Worker handler that runs one reconciliation pass per job
pub struct SyncHandler {
    syncer: Arc<Syncer>,
}

impl SyncHandler {
    pub fn new(syncer: Arc<Syncer>) -> Self {
        Self { syncer }
    }
}

#[async_trait]
impl Handler for SyncHandler {
    async fn handle(&self, job: &SyncJob, cancel: &CancellationToken) -> Result<(), SyncError> {
        let min_interval = self.syncer.config.min_sync_interval();
        self.syncer
            .sync_external_service(job.external_service_id, min_interval, cancel)
            .await
    }
}
