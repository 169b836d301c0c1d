//! # Store
//!
//! Persistence seam used by the reconciliation engine. A [`Store`] reads and
//! writes the repo catalog, service-memberships and external services; a
//! [`Transaction`] is a store whose writes become visible on commit.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::warn;

use crate::error::StoreError;
use crate::sync::sources_diff::SourcesByRepo;
use crate::types::{
    ExternalRepoSpec, ExternalService, ExternalServiceId, ExternalServiceKind, Repo, RepoId, UserId,
};

/// Filters for [`Store::list_repos`].
///
/// Each non-empty criterion adds a predicate; predicates are ANDed unless
/// `use_or` is set. Name matches are case-insensitive and only see live
/// repos, whatever `include_deleted` says, since only live repos hold a name.
#[derive(Debug, Clone, Default)]
pub struct ReposListOptions {
    pub ids: Vec<RepoId>,
    pub names: Vec<String>,
    pub external_repos: Vec<ExternalRepoSpec>,
    /// Repos with a membership in any of these services
    pub external_service_ids: Vec<ExternalServiceId>,
    pub use_or: bool,
    pub include_deleted: bool,
}

impl ReposListOptions {
    pub fn is_unfiltered(&self) -> bool {
        self.ids.is_empty()
            && self.names.is_empty()
            && self.external_repos.is_empty()
            && self.external_service_ids.is_empty()
    }
}

/// Filters for [`Store::list_external_services`]. Deleted services are never
/// listed.
#[derive(Debug, Clone, Default)]
pub struct ExternalServicesListOptions {
    pub ids: Vec<ExternalServiceId>,
    pub kinds: Vec<ExternalServiceKind>,
    pub only_cloud_default: bool,
    pub limit: Option<u64>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Opens a transaction. Nested calls open a savepoint.
    async fn transact(&self) -> Result<Box<dyn Transaction>, StoreError>;

    fn in_transaction(&self) -> bool;

    /// Repos matching `opts`, ordered by ID, with their sources attached.
    async fn list_repos(&self, opts: ReposListOptions) -> Result<Vec<Repo>, StoreError>;

    /// Inserts or updates every repo row and writes the assigned IDs back.
    /// A repo without an ID reuses the row holding its external spec, deleted
    /// or not. Sources are not touched.
    async fn upsert_repos(&self, repos: &mut [Repo]) -> Result<(), StoreError>;

    /// Removes every membership of the given repos and soft-deletes them.
    async fn delete_repos(&self, ids: &[RepoId]) -> Result<(), StoreError>;

    /// Specs of every live repo.
    async fn list_external_repo_specs(&self) -> Result<HashSet<ExternalRepoSpec>, StoreError>;

    async fn list_external_services(
        &self,
        opts: ExternalServicesListOptions,
    ) -> Result<Vec<ExternalService>, StoreError>;

    async fn get_external_service(
        &self,
        id: ExternalServiceId,
    ) -> Result<ExternalService, StoreError>;

    /// Inserts or updates a service, writing the assigned ID back.
    async fn upsert_external_service(&self, svc: &mut ExternalService) -> Result<(), StoreError>;

    /// Applies membership edits keyed by repo ID.
    async fn upsert_sources(
        &self,
        added: &SourcesByRepo,
        modified: &SourcesByRepo,
        deleted: &SourcesByRepo,
    ) -> Result<(), StoreError>;

    /// Distinct repos claimed through user-owned services, restricted to
    /// `user_ids` unless it is empty.
    async fn count_user_added_repos(&self, user_ids: &[UserId]) -> Result<u64, StoreError>;

    async fn user_allows_private_code(&self, user_id: UserId) -> Result<bool, StoreError>;

    /// Persists a repo sourced from `svc` together with its membership in it.
    async fn create_external_service_repo(
        &self,
        svc: &ExternalService,
        repo: &mut Repo,
    ) -> Result<(), StoreError>;

    /// Updates a stored repo and refreshes its membership in `svc`.
    async fn update_external_service_repo(
        &self,
        svc: &ExternalService,
        repo: &Repo,
    ) -> Result<(), StoreError>;

    /// Drops every membership of `svc` whose repo is not in `keep` and
    /// soft-deletes repos left without members. Returns the repos whose
    /// membership was dropped.
    async fn delete_external_service_repos_not_in(
        &self,
        svc: &ExternalService,
        keep: &HashSet<RepoId>,
    ) -> Result<Vec<RepoId>, StoreError>;
}

#[async_trait]
pub trait Transaction: Store {
    fn as_store(&self) -> &dyn Store;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Commits `tx` when `result` is `Ok` and rolls it back otherwise.
///
/// A failed commit replaces the result; a failed rollback is only logged so
/// the original error is preserved.
pub async fn finish<T, E>(tx: Box<dyn Transaction>, result: Result<T, E>) -> Result<T, E>
where
    E: From<StoreError>,
{
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Failed to roll back transaction");
            }
            Err(err)
        }
    }
}
