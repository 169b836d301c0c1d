//! Test utilities for database and source fixtures.
//!
//! Every test gets its own in-memory SQLite database with all migrations
//! applied. The pool is pinned to a single connection so that every query
//! sees the same in-memory database.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use migration::{Migrator, MigratorTrait};
use reposync::models::user;
use reposync::repositories::{SeaOrmStore, Store};
use reposync::sources::{Source, SourceError, SourceResult, Sourcer, emit};
use reposync::sync::Diff;
use reposync::types::{ExternalRepoSpec, ExternalService, ExternalServiceKind, Repo, SourceInfo};
use sea_orm::{ActiveModelTrait, ActiveValue::NotSet, ConnectOptions, Database, DatabaseConnection, Set};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut opts = ConnectOptions::new("sqlite::memory:");
    opts.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = Database::connect(opts).await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub async fn setup_test_store() -> Result<(DatabaseConnection, Arc<SeaOrmStore>)> {
    let db = setup_test_db().await?;
    let store = Arc::new(SeaOrmStore::new(db.clone()));
    Ok((db, store))
}

/// Inserts a user row directly for testing.
pub async fn insert_user(
    db: &DatabaseConnection,
    username: &str,
    allow_private_code: bool,
) -> Result<i32> {
    let model = user::ActiveModel {
        id: NotSet,
        username: Set(username.to_string()),
        allow_private_code: Set(allow_private_code),
        created_at: Set(Utc::now().fixed_offset()),
    }
    .insert(db)
    .await?;
    Ok(model.id)
}

/// Persists a GitHub external service, optionally owned by `owner`.
pub async fn insert_external_service(
    store: &dyn Store,
    display_name: &str,
    owner: Option<i32>,
) -> Result<ExternalService> {
    let mut svc = ExternalService::new(ExternalServiceKind::GitHub, display_name);
    svc.namespace_user_id = owner;
    store.upsert_external_service(&mut svc).await?;
    Ok(svc)
}

/// A GitHub repo as `svc` would source it.
pub fn github_repo(svc: &ExternalService, name: &str, node_id: &str) -> Repo {
    let clone_url = format!("https://{name}.git");
    Repo {
        name: name.to_string(),
        uri: name.to_string(),
        description: format!("{name} description"),
        external_repo: ExternalRepoSpec::new("github", "https://github.com/", node_id),
        sources: [(svc.urn(), SourceInfo::new(svc.urn(), clone_url))]
            .into_iter()
            .collect(),
        ..Default::default()
    }
}

/// Source replaying a fixed list of results.
pub struct FakeSource {
    results: Vec<SourceResult>,
}

#[async_trait]
impl Source for FakeSource {
    async fn list_repos(&self, cancel: CancellationToken, results: mpsc::Sender<SourceResult>) {
        for item in &self.results {
            if !emit(&results, &cancel, item.clone()).await {
                return;
            }
        }
    }
}

/// Sourcer handing out [`FakeSource`]s per external service.
#[derive(Default)]
pub struct FakeSourcer {
    sources: Mutex<HashMap<i32, Arc<FakeSource>>>,
}

impl FakeSourcer {
    pub fn set(&self, svc: &ExternalService, results: Vec<SourceResult>) {
        self.sources
            .lock()
            .unwrap()
            .insert(svc.id, Arc::new(FakeSource { results }));
    }

    pub fn set_repos(&self, svc: &ExternalService, repos: Vec<Repo>) {
        self.set(svc, repos.into_iter().map(Ok).collect());
    }
}

impl Sourcer for FakeSourcer {
    fn source(&self, svc: &ExternalService) -> Result<Arc<dyn Source>, SourceError> {
        let sources = self.sources.lock().unwrap();
        match sources.get(&svc.id) {
            Some(source) => Ok(source.clone()),
            None => Err(SourceError::Unsupported {
                kind: svc.kind.as_str().to_string(),
            }),
        }
    }
}

/// Drains every diff published so far.
pub fn collect_diffs(rx: &mut mpsc::Receiver<Diff>) -> Vec<Diff> {
    let mut diffs = Vec::new();
    while let Ok(diff) = rx.try_recv() {
        diffs.push(diff);
    }
    diffs
}

pub fn names(repos: &[Repo]) -> Vec<String> {
    let mut names: Vec<String> = repos.iter().map(|r| r.name.clone()).collect();
    names.sort();
    names
}
