//! Integration tests for batch reconciliation passes.

mod test_utils;

use std::sync::Arc;

use anyhow::Result;
use reposync::config::{ExternalServiceUserMode, SyncConfig};
use reposync::error::SyncError;
use reposync::repositories::{ReposListOptions, Store};
use reposync::sources::SourceError;
use reposync::sync::Syncer;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use test_utils::*;

fn batch_syncer(
    store: Arc<dyn Store>,
    sourcer: Arc<FakeSourcer>,
    config: SyncConfig,
) -> (Syncer, mpsc::Receiver<reposync::sync::Diff>) {
    let (tx, rx) = mpsc::channel(32);
    let syncer = Syncer::new(store, sourcer, Arc::new(config))
        .with_streaming(false)
        .with_synced(tx);
    (syncer, rx)
}

#[tokio::test]
async fn first_pass_adds_and_second_pass_is_unmodified() -> Result<()> {
    let (_db, store) = setup_test_store().await?;
    let sourcer = Arc::new(FakeSourcer::default());
    let svc = insert_external_service(store.as_ref(), "GitHub", None).await?;
    sourcer.set_repos(
        &svc,
        vec![
            github_repo(&svc, "github.com/org/a", "A"),
            github_repo(&svc, "github.com/org/b", "B"),
        ],
    );
    let (syncer, mut rx) = batch_syncer(store.clone(), sourcer.clone(), SyncConfig::default());
    let cancel = CancellationToken::new();
    let min = chrono::Duration::minutes(1);

    syncer.sync_external_service(svc.id, min, &cancel).await?;
    let diffs = collect_diffs(&mut rx);
    assert_eq!(diffs.len(), 1);
    assert_eq!(
        names(&diffs[0].added),
        vec!["github.com/org/a", "github.com/org/b"]
    );
    assert!(diffs[0].added.iter().all(|r| r.id > 0));
    let specs = store.list_external_repo_specs().await?;
    assert_eq!(specs.len(), 2);
    assert!(diffs[0].added.iter().all(|r| specs.contains(&r.external_repo)));

    syncer.sync_external_service(svc.id, min, &cancel).await?;
    let diffs = collect_diffs(&mut rx);
    assert_eq!(diffs[0].unmodified.len(), 2);
    assert!(!diffs[0].has_changes());

    let svc = store.get_external_service(svc.id).await?;
    let last = svc.last_sync_at.expect("last sync recorded");
    let next = svc.next_sync_at.expect("next sync recorded");
    assert!(next > last);
    Ok(())
}

#[tokio::test]
async fn credential_failure_deletes_every_repo_and_surfaces_typed_error() -> Result<()> {
    let (_db, store) = setup_test_store().await?;
    let sourcer = Arc::new(FakeSourcer::default());
    let svc = insert_external_service(store.as_ref(), "GitHub", None).await?;
    sourcer.set_repos(
        &svc,
        vec![
            github_repo(&svc, "github.com/org/a", "A"),
            github_repo(&svc, "github.com/org/b", "B"),
            github_repo(&svc, "github.com/org/c", "C"),
        ],
    );
    let (syncer, mut rx) = batch_syncer(store.clone(), sourcer.clone(), SyncConfig::default());
    let cancel = CancellationToken::new();
    let min = chrono::Duration::minutes(1);
    syncer.sync_external_service(svc.id, min, &cancel).await?;
    collect_diffs(&mut rx);

    sourcer.set(
        &svc,
        vec![Err(SourceError::Unauthorized("bad credentials".to_string()))],
    );
    let err = syncer
        .sync_external_service(svc.id, min, &cancel)
        .await
        .expect_err("credential failure is reported");
    assert!(matches!(err, SyncError::Unauthorized));
    assert!(err.is_unauthorized());

    let diffs = collect_diffs(&mut rx);
    assert_eq!(diffs.len(), 1);
    assert_eq!(
        names(&diffs[0].deleted),
        vec!["github.com/org/a", "github.com/org/b", "github.com/org/c"]
    );
    assert!(diffs[0].deleted.iter().all(|r| r.sources.is_empty()));

    let live = store.list_repos(ReposListOptions::default()).await?;
    assert!(live.is_empty());
    let svc = store.get_external_service(svc.id).await?;
    assert!(svc.last_sync_at.is_some());
    Ok(())
}

#[tokio::test]
async fn transient_source_error_aborts_without_writes() -> Result<()> {
    let (_db, store) = setup_test_store().await?;
    let sourcer = Arc::new(FakeSourcer::default());
    let svc = insert_external_service(store.as_ref(), "GitHub", None).await?;
    sourcer.set(
        &svc,
        vec![
            Ok(github_repo(&svc, "github.com/org/a", "A")),
            Err(SourceError::Network {
                details: "connection reset".to_string(),
            }),
        ],
    );
    let (syncer, mut rx) = batch_syncer(store.clone(), sourcer, SyncConfig::default());

    let err = syncer
        .sync_external_service(svc.id, chrono::Duration::minutes(1), &CancellationToken::new())
        .await
        .expect_err("transient errors abort a batch pass");
    assert!(err.credential_failure().is_none());
    assert!(err.to_string().contains("connection reset"));
    assert!(collect_diffs(&mut rx).is_empty());
    assert!(store.list_repos(ReposListOptions::default()).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn site_ceiling_rejects_user_owned_pass() -> Result<()> {
    let (db, store) = setup_test_store().await?;
    let sourcer = Arc::new(FakeSourcer::default());
    let alice = insert_user(&db, "alice", false).await?;
    let bob = insert_user(&db, "bob", false).await?;
    let alice_svc = insert_external_service(store.as_ref(), "alice github", Some(alice)).await?;
    let bob_svc = insert_external_service(store.as_ref(), "bob github", Some(bob)).await?;
    sourcer.set_repos(&alice_svc, vec![github_repo(&alice_svc, "github.com/alice/a", "A")]);
    sourcer.set_repos(&bob_svc, vec![github_repo(&bob_svc, "github.com/bob/b", "B")]);

    let config = SyncConfig {
        user_repos_max_per_user: 1,
        user_repos_max_per_site: 1,
        ..SyncConfig::default()
    };
    let (syncer, _rx) = batch_syncer(store.clone(), sourcer, config);
    let cancel = CancellationToken::new();
    let min = chrono::Duration::minutes(1);

    syncer.sync_external_service(alice_svc.id, min, &cancel).await?;
    let err = syncer
        .sync_external_service(bob_svc.id, min, &cancel)
        .await
        .expect_err("site ceiling reached");
    assert!(err.is_quota());
    assert_eq!(
        err.to_string(),
        "reached maximum allowed user added repos: 1"
    );

    let live = store.list_repos(ReposListOptions::default()).await?;
    assert_eq!(names(&live), vec!["github.com/alice/a"]);
    Ok(())
}

#[tokio::test]
async fn per_user_ceiling_stops_sourcing() -> Result<()> {
    let (db, store) = setup_test_store().await?;
    let sourcer = Arc::new(FakeSourcer::default());
    let alice = insert_user(&db, "alice", false).await?;
    let svc = insert_external_service(store.as_ref(), "alice github", Some(alice)).await?;
    sourcer.set_repos(
        &svc,
        vec![
            github_repo(&svc, "github.com/alice/a", "A"),
            github_repo(&svc, "github.com/alice/b", "B"),
            github_repo(&svc, "github.com/alice/c", "C"),
        ],
    );
    let config = SyncConfig {
        user_repos_max_per_user: 2,
        ..SyncConfig::default()
    };
    let (syncer, _rx) = batch_syncer(store.clone(), sourcer, config);

    let err = syncer
        .sync_external_service(svc.id, chrono::Duration::minutes(1), &CancellationToken::new())
        .await
        .expect_err("per user ceiling reached while sourcing");
    assert!(err.is_quota());
    assert!(store.list_repos(ReposListOptions::default()).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn private_repos_dropped_for_users_without_permission() -> Result<()> {
    let (db, store) = setup_test_store().await?;
    let sourcer = Arc::new(FakeSourcer::default());
    let alice = insert_user(&db, "alice", false).await?;
    let svc = insert_external_service(store.as_ref(), "alice github", Some(alice)).await?;
    let mut secret = github_repo(&svc, "github.com/alice/secret", "S");
    secret.private = true;
    sourcer.set_repos(
        &svc,
        vec![github_repo(&svc, "github.com/alice/public", "P"), secret],
    );
    let config = SyncConfig {
        external_service_user_mode: ExternalServiceUserMode::Public,
        ..SyncConfig::default()
    };
    let (syncer, mut rx) = batch_syncer(store.clone(), sourcer.clone(), config);

    syncer
        .sync_external_service(svc.id, chrono::Duration::minutes(1), &CancellationToken::new())
        .await?;
    let diffs = collect_diffs(&mut rx);
    assert_eq!(names(&diffs[0].added), vec!["github.com/alice/public"]);

    let (all_syncer, mut rx) = batch_syncer(
        store.clone(),
        sourcer,
        SyncConfig {
            external_service_user_mode: ExternalServiceUserMode::All,
            ..SyncConfig::default()
        },
    );
    all_syncer
        .sync_external_service(svc.id, chrono::Duration::minutes(1), &CancellationToken::new())
        .await?;
    let diffs = collect_diffs(&mut rx);
    assert_eq!(names(&diffs[0].added), vec!["github.com/alice/secret"]);
    Ok(())
}

#[tokio::test]
async fn stored_name_conflict_resolved_by_smaller_spec() -> Result<()> {
    let (_db, store) = setup_test_store().await?;
    let sourcer = Arc::new(FakeSourcer::default());
    let first = insert_external_service(store.as_ref(), "GitHub one", None).await?;
    let second = insert_external_service(store.as_ref(), "GitHub two", None).await?;
    let (syncer, mut rx) = batch_syncer(store.clone(), sourcer.clone(), SyncConfig::default());
    let cancel = CancellationToken::new();
    let min = chrono::Duration::minutes(1);

    sourcer.set_repos(&first, vec![github_repo(&first, "github.com/org/app", "B")]);
    syncer.sync_external_service(first.id, min, &cancel).await?;
    collect_diffs(&mut rx);

    // The repo was recreated upstream under a new identity that sorts first.
    sourcer.set_repos(&second, vec![github_repo(&second, "github.com/org/app", "A")]);
    syncer.sync_external_service(second.id, min, &cancel).await?;
    let diffs = collect_diffs(&mut rx);
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].added.len(), 1);
    assert_eq!(diffs[0].added[0].external_repo.id, "A");
    assert_eq!(diffs[0].deleted.len(), 1);
    assert_eq!(diffs[0].deleted[0].external_repo.id, "B");

    let live = store.list_repos(ReposListOptions::default()).await?;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].external_repo.id, "A");
    assert!(live[0].sources.contains_key(&second.urn()));
    Ok(())
}

#[tokio::test]
async fn persistent_sourced_name_conflict_backs_off() -> Result<()> {
    let (_db, store) = setup_test_store().await?;
    let sourcer = Arc::new(FakeSourcer::default());
    let mut svc = insert_external_service(store.as_ref(), "GitHub", None).await?;
    sourcer.set_repos(
        &svc,
        vec![
            github_repo(&svc, "github.com/org/a", "A"),
            github_repo(&svc, "github.com/org/A", "B"),
        ],
    );
    let (syncer, mut rx) = batch_syncer(store.clone(), sourcer.clone(), SyncConfig::default());
    let cancel = CancellationToken::new();
    let min = chrono::Duration::minutes(1);

    syncer.sync_external_service(svc.id, min, &cancel).await?;
    let diffs = collect_diffs(&mut rx);
    assert_eq!(names(&diffs[0].added), vec!["github.com/org/a"]);
    assert!(diffs[0].deleted.is_empty());

    svc = store.get_external_service(svc.id).await?;
    svc.last_sync_at = Some(chrono::Utc::now() - chrono::Duration::hours(2));
    store.upsert_external_service(&mut svc).await?;

    syncer.sync_external_service(svc.id, min, &cancel).await?;
    let diffs = collect_diffs(&mut rx);
    assert!(!diffs[0].has_changes());
    assert!(diffs[0].deleted.is_empty());
    assert_eq!(diffs[0].unmodified.len(), 1);

    let svc = store.get_external_service(svc.id).await?;
    let last = svc.last_sync_at.expect("last sync recorded");
    let next = svc.next_sync_at.expect("next sync recorded");
    assert!(next - last > chrono::Duration::hours(1));
    Ok(())
}

#[tokio::test]
async fn shared_repo_keeps_other_memberships() -> Result<()> {
    let (_db, store) = setup_test_store().await?;
    let sourcer = Arc::new(FakeSourcer::default());
    let first = insert_external_service(store.as_ref(), "GitHub one", None).await?;
    let second = insert_external_service(store.as_ref(), "GitHub two", None).await?;
    let (syncer, mut rx) = batch_syncer(store.clone(), sourcer.clone(), SyncConfig::default());
    let cancel = CancellationToken::new();
    let min = chrono::Duration::minutes(1);

    sourcer.set_repos(&first, vec![github_repo(&first, "github.com/org/shared", "S")]);
    sourcer.set_repos(&second, vec![github_repo(&second, "github.com/org/shared", "S")]);
    syncer.sync_external_service(first.id, min, &cancel).await?;
    syncer.sync_external_service(second.id, min, &cancel).await?;

    let live = store.list_repos(ReposListOptions::default()).await?;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].sources.len(), 2);

    // The first service stops sourcing it; the second keeps it alive.
    sourcer.set_repos(&first, vec![]);
    collect_diffs(&mut rx);
    syncer.sync_external_service(first.id, min, &cancel).await?;
    let diffs = collect_diffs(&mut rx);
    assert_eq!(diffs[0].deleted.len(), 1);
    assert_eq!(diffs[0].deleted[0].sources.len(), 1);

    let live = store.list_repos(ReposListOptions::default()).await?;
    assert_eq!(live.len(), 1);
    assert!(live[0].sources.contains_key(&second.urn()));
    assert!(!live[0].sources.contains_key(&first.urn()));
    Ok(())
}

#[tokio::test]
async fn cancelled_pass_rolls_back() -> Result<()> {
    let (_db, store) = setup_test_store().await?;
    let sourcer = Arc::new(FakeSourcer::default());
    let svc = insert_external_service(store.as_ref(), "GitHub", None).await?;
    sourcer.set_repos(&svc, vec![github_repo(&svc, "github.com/org/a", "A")]);
    let (syncer, _rx) = batch_syncer(store.clone(), sourcer, SyncConfig::default());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = syncer
        .sync_external_service(svc.id, chrono::Duration::minutes(1), &cancel)
        .await
        .expect_err("cancelled before completion");
    assert!(matches!(err, SyncError::Cancelled));
    assert!(store.list_repos(ReposListOptions::default()).await?.is_empty());
    assert!(store.get_external_service(svc.id).await?.last_sync_at.is_none());
    Ok(())
}

#[tokio::test]
async fn streaming_insert_publishes_new_site_repos_before_the_batch_write() -> Result<()> {
    let (_db, store) = setup_test_store().await?;
    let sourcer = Arc::new(FakeSourcer::default());
    let other = insert_external_service(store.as_ref(), "GitHub other", None).await?;
    let svc = insert_external_service(store.as_ref(), "GitHub", None).await?;
    let config = SyncConfig {
        streaming_insert: true,
        ..SyncConfig::default()
    };
    let (syncer, mut rx) = batch_syncer(store.clone(), sourcer.clone(), config);
    let cancel = CancellationToken::new();
    let min = chrono::Duration::minutes(1);

    sourcer.set_repos(&other, vec![github_repo(&other, "github.com/org/shared", "S")]);
    syncer.sync_external_service(other.id, min, &cancel).await?;
    collect_diffs(&mut rx);

    sourcer.set_repos(
        &svc,
        vec![
            github_repo(&svc, "github.com/org/new", "N"),
            github_repo(&svc, "github.com/org/shared", "S"),
        ],
    );
    syncer.sync_external_service(svc.id, min, &cancel).await?;
    let diffs = collect_diffs(&mut rx);
    assert_eq!(diffs.len(), 2);
    assert_eq!(names(&diffs[0].added), vec!["github.com/org/new"]);
    assert!(diffs[1].added.is_empty());
    assert_eq!(names(&diffs[1].unmodified), vec!["github.com/org/new"]);
    assert_eq!(names(&diffs[1].modified), vec!["github.com/org/shared"]);
    Ok(())
}

#[tokio::test]
async fn streaming_insert_keeps_early_repos_when_the_pass_aborts() -> Result<()> {
    let (_db, store) = setup_test_store().await?;
    let sourcer = Arc::new(FakeSourcer::default());
    let svc = insert_external_service(store.as_ref(), "GitHub", None).await?;
    let config = SyncConfig {
        streaming_insert: true,
        ..SyncConfig::default()
    };
    let (syncer, mut rx) = batch_syncer(store.clone(), sourcer.clone(), config);

    sourcer.set(
        &svc,
        vec![
            Ok(github_repo(&svc, "github.com/org/a", "A")),
            Err(SourceError::Network {
                details: "page 2 timed out".to_string(),
            }),
        ],
    );
    syncer
        .sync_external_service(svc.id, chrono::Duration::minutes(1), &CancellationToken::new())
        .await
        .expect_err("transient error aborts the batch write");

    let diffs = collect_diffs(&mut rx);
    assert_eq!(diffs.len(), 1);
    assert_eq!(names(&diffs[0].added), vec!["github.com/org/a"]);
    let live = store.list_repos(ReposListOptions::default()).await?;
    assert_eq!(names(&live), vec!["github.com/org/a"]);
    Ok(())
}
