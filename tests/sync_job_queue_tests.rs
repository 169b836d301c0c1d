//! Integration tests for the sync job queue and the worker loop.

mod test_utils;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use reposync::config::{SyncConfig, WorkerConfig};
use reposync::repositories::{JobQueue, JobState, ReposListOptions, Store, SyncJobRepository};
use reposync::sync::{SyncHandler, Syncer};
use reposync::sync_worker::SyncWorker;
use tokio_util::sync::CancellationToken;

use test_utils::*;

#[tokio::test]
async fn enqueue_skips_services_with_jobs_in_flight() -> Result<()> {
    let (db, store) = setup_test_store().await?;
    let alice = insert_user(&db, "alice", false).await?;
    let site = insert_external_service(store.as_ref(), "GitHub", None).await?;
    let user = insert_external_service(store.as_ref(), "alice github", Some(alice)).await?;
    let queue = SyncJobRepository::new(db.clone(), 3);

    assert_eq!(queue.enqueue_sync_jobs(false).await?, 2);
    assert_eq!(queue.enqueue_sync_jobs(false).await?, 0);
    assert!(!queue.enqueue_single_sync_job(site.id).await?);

    let jobs = queue.list_for_service(user.id).await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Queued);
    Ok(())
}

#[tokio::test]
async fn cloud_mode_only_enqueues_user_owned_and_default_services() -> Result<()> {
    let (db, store) = setup_test_store().await?;
    let alice = insert_user(&db, "alice", false).await?;
    let site = insert_external_service(store.as_ref(), "GitHub", None).await?;
    let user = insert_external_service(store.as_ref(), "alice github", Some(alice)).await?;
    let mut default = insert_external_service(store.as_ref(), "GitHub.com", None).await?;
    default.cloud_default = true;
    store.upsert_external_service(&mut default).await?;
    let queue = SyncJobRepository::new(db.clone(), 3);

    assert_eq!(queue.enqueue_sync_jobs(true).await?, 2);
    assert!(queue.list_for_service(site.id).await?.is_empty());
    assert_eq!(queue.list_for_service(user.id).await?.len(), 1);
    assert_eq!(queue.list_for_service(default.id).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn services_not_yet_due_are_skipped() -> Result<()> {
    let (db, store) = setup_test_store().await?;
    let mut svc = insert_external_service(store.as_ref(), "GitHub", None).await?;
    svc.next_sync_at = Some(chrono::Utc::now() + chrono::Duration::hours(1));
    store.upsert_external_service(&mut svc).await?;
    let queue = SyncJobRepository::new(db.clone(), 3);

    assert_eq!(queue.enqueue_sync_jobs(false).await?, 0);
    assert!(queue.enqueue_single_sync_job(svc.id).await?);
    Ok(())
}

#[tokio::test]
async fn errored_jobs_retry_until_budget_is_spent() -> Result<()> {
    let (db, store) = setup_test_store().await?;
    let svc = insert_external_service(store.as_ref(), "GitHub", None).await?;
    let queue = SyncJobRepository::new(db.clone(), 1);
    queue.enqueue_single_sync_job(svc.id).await?;

    let job = queue.dequeue().await?.expect("queued job is claimable");
    assert_eq!(job.state, JobState::Processing);
    assert!(queue.dequeue().await?.is_none());
    assert_eq!(queue.mark_errored(job.id, "boom").await?, JobState::Errored);

    let retry = queue.dequeue().await?.expect("errored job is retried");
    assert_eq!(retry.id, job.id);
    assert_eq!(queue.mark_errored(job.id, "boom again").await?, JobState::Failed);
    assert!(queue.dequeue().await?.is_none());

    let stored = queue.find(job.id).await?.expect("job exists");
    assert_eq!(stored.num_failures, 2);
    assert_eq!(stored.failure_message.as_deref(), Some("boom again"));
    Ok(())
}

#[tokio::test]
async fn stalled_jobs_are_reset_then_failed() -> Result<()> {
    let (db, store) = setup_test_store().await?;
    let svc = insert_external_service(store.as_ref(), "GitHub", None).await?;
    let queue = SyncJobRepository::new(db.clone(), 3);
    queue.enqueue_single_sync_job(svc.id).await?;

    let job = queue.dequeue().await?.expect("claimable");
    tokio::time::sleep(StdDuration::from_millis(20)).await;
    let outcome = queue.reset_stalled(chrono::Duration::zero(), 1).await?;
    assert_eq!((outcome.reset, outcome.failed), (1, 0));
    assert_eq!(queue.find(job.id).await?.map(|j| j.state), Some(JobState::Queued));

    queue.dequeue().await?.expect("reset job is claimable");
    tokio::time::sleep(StdDuration::from_millis(20)).await;
    let outcome = queue.reset_stalled(chrono::Duration::zero(), 1).await?;
    assert_eq!((outcome.reset, outcome.failed), (0, 1));
    assert_eq!(queue.find(job.id).await?.map(|j| j.state), Some(JobState::Failed));
    Ok(())
}

#[tokio::test]
async fn finished_jobs_are_purged_after_retention() -> Result<()> {
    let (db, store) = setup_test_store().await?;
    let svc = insert_external_service(store.as_ref(), "GitHub", None).await?;
    let queue = SyncJobRepository::new(db.clone(), 3);
    queue.enqueue_single_sync_job(svc.id).await?;
    let job = queue.dequeue().await?.expect("claimable");
    queue.mark_completed(job.id).await?;

    assert_eq!(queue.purge_finished(chrono::Duration::days(1)).await?, 0);
    tokio::time::sleep(StdDuration::from_millis(20)).await;
    assert_eq!(queue.purge_finished(chrono::Duration::zero()).await?, 1);
    assert!(queue.find(job.id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn triggered_job_is_processed_by_worker() -> Result<()> {
    let (db, store) = setup_test_store().await?;
    let sourcer = Arc::new(FakeSourcer::default());
    let svc = insert_external_service(store.as_ref(), "GitHub", None).await?;
    sourcer.set_repos(&svc, vec![github_repo(&svc, "github.com/org/a", "A")]);

    let queue = Arc::new(SyncJobRepository::new(db.clone(), 3));
    let syncer = Arc::new(Syncer::new(
        store.clone(),
        sourcer,
        Arc::new(SyncConfig::default()),
    ));
    assert!(syncer.trigger_external_service_sync(queue.as_ref(), svc.id).await?);
    assert!(!syncer.trigger_external_service_sync(queue.as_ref(), svc.id).await?);

    let worker = SyncWorker::new(
        queue.clone(),
        Arc::new(SyncHandler::new(syncer)),
        WorkerConfig::default(),
    );
    let shutdown = CancellationToken::new();
    assert!(worker.process_next(&shutdown).await?);
    assert!(!worker.process_next(&shutdown).await?);

    let jobs = queue.list_for_service(svc.id).await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Completed);
    let live = store.list_repos(ReposListOptions::default()).await?;
    assert_eq!(names(&live), vec!["github.com/org/a"]);
    Ok(())
}
