//! # SeaORM Store
//!
//! [`Store`] implementation over a SeaORM connection. The same code serves a
//! pooled [`DatabaseConnection`] and an open [`DatabaseTransaction`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::sea_query::{Expr, Func, OnConflict, Query, SimpleExpr};
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ColumnTrait, Condition, ConnectionTrait,
    DatabaseConnection, DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    Set, TransactionTrait,
};
use tracing::debug;

use crate::error::StoreError;
use crate::models::{external_service, external_service_repo, repo, user};
use crate::repositories::store::{
    ExternalServicesListOptions, ReposListOptions, Store, Transaction,
};
use crate::sync::sources_diff::SourcesByRepo;
use crate::types::{
    ExternalRepoSpec, ExternalService, ExternalServiceId, ExternalServiceKind, Repo, RepoId,
    SourceInfo, UserId, external_service_urn,
};

/// Upper bound on the values bound into a single `IN (...)` list.
const CHUNK_SIZE: usize = 500;

/// Store backed by a SeaORM connection or transaction
#[derive(Clone)]
pub struct SeaOrmStore<C = DatabaseConnection> {
    conn: C,
    in_tx: bool,
}

impl SeaOrmStore<DatabaseConnection> {
    /// Create a store over a connection pool
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            conn: db,
            in_tx: false,
        }
    }
}

impl<C> SeaOrmStore<C>
where
    C: ConnectionTrait + TransactionTrait + Send + Sync + 'static,
{
    async fn find_repo_by_spec(
        &self,
        spec: &ExternalRepoSpec,
    ) -> Result<Option<repo::Model>, StoreError> {
        if spec.is_empty() {
            return Ok(None);
        }
        Ok(repo::Entity::find()
            .filter(spec_condition(spec))
            .one(&self.conn)
            .await?)
    }

    /// Inserts or updates one repo row, reviving a row that holds the same
    /// spec when the repo has no ID yet.
    async fn save_repo(&self, r: &mut Repo) -> Result<(), StoreError> {
        let now = Utc::now();
        if r.id == 0 {
            if let Some(existing) = self.find_repo_by_spec(&r.external_repo).await? {
                r.id = existing.id;
                r.created_at.get_or_insert(existing.created_at.with_timezone(&Utc));
            }
        }
        let created_at = *r.created_at.get_or_insert(now);
        let updated_at = *r.updated_at.get_or_insert(now);

        let mut active = repo::ActiveModel {
            id: NotSet,
            name: Set(r.name.clone()),
            uri: Set(r.uri.clone()),
            description: Set(r.description.clone()),
            fork: Set(r.fork),
            archived: Set(r.archived),
            private: Set(r.private),
            external_service_type: Set(r.external_repo.service_type.clone()),
            external_service_id: Set(r.external_repo.service_id.clone()),
            external_id: Set(r.external_repo.id.clone()),
            created_at: Set(created_at.fixed_offset()),
            updated_at: Set(updated_at.fixed_offset()),
            deleted_at: Set(r.deleted_at.map(|t| t.fixed_offset())),
        };

        if r.id == 0 {
            let model = active.insert(&self.conn).await?;
            r.id = model.id;
            debug!(repo_id = r.id, name = %r.name, "Inserted repo");
        } else {
            active.id = Set(r.id);
            active.update(&self.conn).await?;
        }
        Ok(())
    }

    /// Inserts or refreshes the membership of `repo_id` in `svc`.
    async fn upsert_membership(
        &self,
        svc_id: ExternalServiceId,
        repo_id: RepoId,
        clone_url: &str,
        user_id: Option<UserId>,
    ) -> Result<(), StoreError> {
        let active = external_service_repo::ActiveModel {
            external_service_id: Set(svc_id),
            repo_id: Set(repo_id),
            clone_url: Set(clone_url.to_string()),
            user_id: Set(user_id),
            created_at: Set(Utc::now().fixed_offset()),
        };
        external_service_repo::Entity::insert(active)
            .on_conflict(
                OnConflict::columns([
                    external_service_repo::Column::ExternalServiceId,
                    external_service_repo::Column::RepoId,
                ])
                .update_columns([
                    external_service_repo::Column::CloneUrl,
                    external_service_repo::Column::UserId,
                ])
                .to_owned(),
            )
            .exec_without_returning(&self.conn)
            .await?;
        Ok(())
    }

    /// Owning users of the given services, for stamping memberships.
    async fn service_owners(
        &self,
        ids: &BTreeSet<ExternalServiceId>,
    ) -> Result<HashMap<ExternalServiceId, Option<UserId>>, StoreError> {
        let mut owners = HashMap::new();
        let ids: Vec<_> = ids.iter().copied().collect();
        for chunk in ids.chunks(CHUNK_SIZE) {
            let rows: Vec<(i32, Option<i32>)> = external_service::Entity::find()
                .select_only()
                .column(external_service::Column::Id)
                .column(external_service::Column::NamespaceUserId)
                .filter(external_service::Column::Id.is_in(chunk.iter().copied()))
                .into_tuple()
                .all(&self.conn)
                .await?;
            owners.extend(
                rows.into_iter()
                    .map(|(id, owner)| (id, owner.filter(|user_id| *user_id > 0))),
            );
        }
        Ok(owners)
    }

    /// Fills in the sources of every repo from the membership table.
    async fn attach_sources(&self, repos: &mut [Repo]) -> Result<(), StoreError> {
        if repos.is_empty() {
            return Ok(());
        }

        let ids: Vec<RepoId> = repos.iter().map(|r| r.id).collect();
        let mut memberships = Vec::new();
        for chunk in ids.chunks(CHUNK_SIZE) {
            memberships.extend(
                external_service_repo::Entity::find()
                    .filter(external_service_repo::Column::RepoId.is_in(chunk.iter().copied()))
                    .all(&self.conn)
                    .await?,
            );
        }

        let svc_ids: Vec<ExternalServiceId> = memberships
            .iter()
            .map(|m| m.external_service_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut kinds = HashMap::new();
        for chunk in svc_ids.chunks(CHUNK_SIZE) {
            let rows: Vec<(i32, String)> = external_service::Entity::find()
                .select_only()
                .column(external_service::Column::Id)
                .column(external_service::Column::Kind)
                .filter(external_service::Column::Id.is_in(chunk.iter().copied()))
                .into_tuple()
                .all(&self.conn)
                .await?;
            for (id, kind) in rows {
                kinds.insert(id, parse_kind(&kind)?);
            }
        }

        let mut by_repo: HashMap<RepoId, BTreeMap<String, SourceInfo>> = HashMap::new();
        for m in memberships {
            let Some(kind) = kinds.get(&m.external_service_id) else {
                continue;
            };
            let urn = external_service_urn(*kind, m.external_service_id);
            by_repo
                .entry(m.repo_id)
                .or_default()
                .insert(urn.clone(), SourceInfo::new(urn, m.clone_url));
        }

        for r in repos.iter_mut() {
            r.sources = by_repo.remove(&r.id).unwrap_or_default();
        }
        Ok(())
    }
}

#[async_trait]
impl<C> Store for SeaOrmStore<C>
where
    C: ConnectionTrait + TransactionTrait + Send + Sync + 'static,
{
    async fn transact(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let txn = self.conn.begin().await?;
        Ok(Box::new(SeaOrmStore {
            conn: txn,
            in_tx: true,
        }))
    }

    fn in_transaction(&self) -> bool {
        self.in_tx
    }

    async fn list_repos(&self, opts: ReposListOptions) -> Result<Vec<Repo>, StoreError> {
        let mut criteria = if opts.use_or {
            Condition::any()
        } else {
            Condition::all()
        };

        if !opts.ids.is_empty() {
            criteria = criteria.add(repo::Column::Id.is_in(opts.ids.iter().copied()));
        }
        if !opts.names.is_empty() {
            let lowered: Vec<String> = opts.names.iter().map(|n| n.to_lowercase()).collect();
            criteria = criteria.add(
                Condition::all()
                    .add(
                        Expr::expr(Func::lower(Expr::col((repo::Entity, repo::Column::Name))))
                            .is_in(lowered),
                    )
                    .add(repo::Column::DeletedAt.is_null()),
            );
        }
        if !opts.external_repos.is_empty() {
            let mut any_spec = Condition::any();
            for spec in &opts.external_repos {
                any_spec = any_spec.add(spec_condition(spec));
            }
            criteria = criteria.add(any_spec);
        }
        if !opts.external_service_ids.is_empty() {
            criteria = criteria.add(
                repo::Column::Id.in_subquery(
                    Query::select()
                        .column(external_service_repo::Column::RepoId)
                        .from(external_service_repo::Entity)
                        .and_where(
                            external_service_repo::Column::ExternalServiceId
                                .is_in(opts.external_service_ids.iter().copied()),
                        )
                        .to_owned(),
                ),
            );
        }

        let mut query = repo::Entity::find();
        if !criteria.is_empty() {
            query = query.filter(criteria);
        }
        if !opts.include_deleted {
            query = query.filter(repo::Column::DeletedAt.is_null());
        }

        let models = query
            .order_by_asc(repo::Column::Id)
            .all(&self.conn)
            .await?;
        let mut repos: Vec<Repo> = models.into_iter().map(repo_from_model).collect();
        self.attach_sources(&mut repos).await?;
        Ok(repos)
    }

    async fn upsert_repos(&self, repos: &mut [Repo]) -> Result<(), StoreError> {
        for r in repos.iter_mut() {
            self.save_repo(r).await?;
        }
        Ok(())
    }

    async fn delete_repos(&self, ids: &[RepoId]) -> Result<(), StoreError> {
        let now = Utc::now().fixed_offset();
        for chunk in ids.chunks(CHUNK_SIZE) {
            external_service_repo::Entity::delete_many()
                .filter(external_service_repo::Column::RepoId.is_in(chunk.iter().copied()))
                .exec(&self.conn)
                .await?;
            repo::Entity::update_many()
                .col_expr(repo::Column::DeletedAt, Expr::value(now))
                .col_expr(repo::Column::UpdatedAt, Expr::value(now))
                .filter(repo::Column::Id.is_in(chunk.iter().copied()))
                .filter(repo::Column::DeletedAt.is_null())
                .exec(&self.conn)
                .await?;
        }
        Ok(())
    }

    async fn list_external_repo_specs(&self) -> Result<HashSet<ExternalRepoSpec>, StoreError> {
        let rows: Vec<(String, String, String)> = repo::Entity::find()
            .select_only()
            .column(repo::Column::ExternalServiceType)
            .column(repo::Column::ExternalServiceId)
            .column(repo::Column::ExternalId)
            .filter(repo::Column::DeletedAt.is_null())
            .into_tuple()
            .all(&self.conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(service_type, service_id, id)| ExternalRepoSpec::new(service_type, service_id, id))
            .collect())
    }

    async fn list_external_services(
        &self,
        opts: ExternalServicesListOptions,
    ) -> Result<Vec<ExternalService>, StoreError> {
        let mut query = external_service::Entity::find()
            .filter(external_service::Column::DeletedAt.is_null())
            .order_by_asc(external_service::Column::Id);

        if !opts.ids.is_empty() {
            query = query.filter(external_service::Column::Id.is_in(opts.ids.iter().copied()));
        }
        if !opts.kinds.is_empty() {
            query = query.filter(
                external_service::Column::Kind.is_in(opts.kinds.iter().map(|k| k.as_str())),
            );
        }
        if opts.only_cloud_default {
            query = query.filter(external_service::Column::CloudDefault.eq(true));
        }
        if let Some(limit) = opts.limit {
            query = query.limit(limit);
        }

        query
            .all(&self.conn)
            .await?
            .into_iter()
            .map(service_from_model)
            .collect()
    }

    async fn get_external_service(
        &self,
        id: ExternalServiceId,
    ) -> Result<ExternalService, StoreError> {
        let model = external_service::Entity::find_by_id(id)
            .filter(external_service::Column::DeletedAt.is_null())
            .one(&self.conn)
            .await?
            .ok_or(StoreError::ExternalServiceNotFound { id })?;
        service_from_model(model)
    }

    async fn upsert_external_service(&self, svc: &mut ExternalService) -> Result<(), StoreError> {
        let now = Utc::now();
        let created_at = *svc.created_at.get_or_insert(now);
        svc.updated_at = Some(now);

        let mut active = external_service::ActiveModel {
            id: NotSet,
            kind: Set(svc.kind.as_str().to_string()),
            display_name: Set(svc.display_name.clone()),
            config: Set(svc.config.clone()),
            namespace_user_id: Set(svc.namespace_user_id),
            cloud_default: Set(svc.cloud_default),
            last_sync_at: Set(svc.last_sync_at.map(|t| t.fixed_offset())),
            next_sync_at: Set(svc.next_sync_at.map(|t| t.fixed_offset())),
            created_at: Set(created_at.fixed_offset()),
            updated_at: Set(now.fixed_offset()),
            deleted_at: Set(svc.deleted_at.map(|t| t.fixed_offset())),
        };

        if svc.id == 0 {
            svc.id = active.insert(&self.conn).await?.id;
        } else {
            active.id = Set(svc.id);
            active.update(&self.conn).await?;
        }
        Ok(())
    }

    async fn upsert_sources(
        &self,
        added: &SourcesByRepo,
        modified: &SourcesByRepo,
        deleted: &SourcesByRepo,
    ) -> Result<(), StoreError> {
        for (repo_id, infos) in deleted {
            let svc_ids: Vec<ExternalServiceId> =
                infos.iter().filter_map(SourceInfo::external_service_id).collect();
            if svc_ids.is_empty() {
                continue;
            }
            external_service_repo::Entity::delete_many()
                .filter(external_service_repo::Column::RepoId.eq(*repo_id))
                .filter(external_service_repo::Column::ExternalServiceId.is_in(svc_ids))
                .exec(&self.conn)
                .await?;
        }

        let svc_ids: BTreeSet<ExternalServiceId> = added
            .values()
            .chain(modified.values())
            .flatten()
            .filter_map(SourceInfo::external_service_id)
            .collect();
        if svc_ids.is_empty() {
            return Ok(());
        }
        let owners = self.service_owners(&svc_ids).await?;

        for (repo_id, infos) in added.iter().chain(modified.iter()) {
            for info in infos {
                let svc_id = info.external_service_id().ok_or_else(|| {
                    StoreError::Invalid(format!("malformed source id {:?}", info.id))
                })?;
                let user_id = owners.get(&svc_id).copied().flatten();
                self.upsert_membership(svc_id, *repo_id, &info.clone_url, user_id)
                    .await?;
            }
        }
        Ok(())
    }

    async fn count_user_added_repos(&self, user_ids: &[UserId]) -> Result<u64, StoreError> {
        let mut query = external_service_repo::Entity::find()
            .select_only()
            .column_as(
                SimpleExpr::from(Func::count_distinct(Expr::col(
                    external_service_repo::Column::RepoId,
                ))),
                "count",
            )
            .filter(external_service_repo::Column::UserId.is_not_null());
        if !user_ids.is_empty() {
            query = query
                .filter(external_service_repo::Column::UserId.is_in(user_ids.iter().copied()));
        }
        let count: Option<i64> = query.into_tuple().one(&self.conn).await?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    async fn user_allows_private_code(&self, user_id: UserId) -> Result<bool, StoreError> {
        Ok(user::Entity::find_by_id(user_id)
            .one(&self.conn)
            .await?
            .is_some_and(|u| u.allow_private_code))
    }

    async fn create_external_service_repo(
        &self,
        svc: &ExternalService,
        r: &mut Repo,
    ) -> Result<(), StoreError> {
        let clone_url = membership_clone_url(svc, r)?;
        r.deleted_at = None;
        self.save_repo(r).await?;
        self.upsert_membership(svc.id, r.id, &clone_url, svc.user_id())
            .await
    }

    async fn update_external_service_repo(
        &self,
        svc: &ExternalService,
        r: &Repo,
    ) -> Result<(), StoreError> {
        if r.id == 0 {
            return Err(StoreError::Invalid(format!(
                "repo {} has no id to update",
                r.name
            )));
        }
        let clone_url = membership_clone_url(svc, r)?;
        let mut stored = r.clone();
        self.save_repo(&mut stored).await?;
        self.upsert_membership(svc.id, r.id, &clone_url, svc.user_id())
            .await
    }

    async fn delete_external_service_repos_not_in(
        &self,
        svc: &ExternalService,
        keep: &HashSet<RepoId>,
    ) -> Result<Vec<RepoId>, StoreError> {
        let member_ids: Vec<RepoId> = external_service_repo::Entity::find()
            .select_only()
            .column(external_service_repo::Column::RepoId)
            .filter(external_service_repo::Column::ExternalServiceId.eq(svc.id))
            .order_by_asc(external_service_repo::Column::RepoId)
            .into_tuple()
            .all(&self.conn)
            .await?;

        let stale: Vec<RepoId> = member_ids
            .into_iter()
            .filter(|id| !keep.contains(id))
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }

        let now = Utc::now().fixed_offset();
        for chunk in stale.chunks(CHUNK_SIZE) {
            external_service_repo::Entity::delete_many()
                .filter(external_service_repo::Column::ExternalServiceId.eq(svc.id))
                .filter(external_service_repo::Column::RepoId.is_in(chunk.iter().copied()))
                .exec(&self.conn)
                .await?;

            repo::Entity::update_many()
                .col_expr(repo::Column::DeletedAt, Expr::value(now))
                .col_expr(repo::Column::UpdatedAt, Expr::value(now))
                .filter(repo::Column::Id.is_in(chunk.iter().copied()))
                .filter(repo::Column::DeletedAt.is_null())
                .filter(
                    repo::Column::Id.not_in_subquery(
                        Query::select()
                            .column(external_service_repo::Column::RepoId)
                            .from(external_service_repo::Entity)
                            .to_owned(),
                    ),
                )
                .exec(&self.conn)
                .await?;
        }

        debug!(
            external_service_id = svc.id,
            removed = stale.len(),
            "Removed stale service memberships"
        );
        Ok(stale)
    }
}

#[async_trait]
impl Transaction for SeaOrmStore<DatabaseTransaction> {
    fn as_store(&self) -> &dyn Store {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.conn.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.conn.rollback().await?;
        Ok(())
    }
}

fn spec_condition(spec: &ExternalRepoSpec) -> Condition {
    Condition::all()
        .add(repo::Column::ExternalServiceType.eq(spec.service_type.as_str()))
        .add(repo::Column::ExternalServiceId.eq(spec.service_id.as_str()))
        .add(repo::Column::ExternalId.eq(spec.id.as_str()))
}

fn membership_clone_url(svc: &ExternalService, r: &Repo) -> Result<String, StoreError> {
    r.sources
        .get(&svc.urn())
        .map(|info| info.clone_url.clone())
        .ok_or_else(|| {
            StoreError::Invalid(format!(
                "repo {} has no source for external service {}",
                r.name, svc.id
            ))
        })
}

fn parse_kind(kind: &str) -> Result<ExternalServiceKind, StoreError> {
    kind.parse().map_err(StoreError::Invalid)
}

fn utc(t: DateTime<FixedOffset>) -> DateTime<Utc> {
    t.with_timezone(&Utc)
}

fn repo_from_model(m: repo::Model) -> Repo {
    Repo {
        id: m.id,
        name: m.name,
        uri: m.uri,
        description: m.description,
        fork: m.fork,
        archived: m.archived,
        private: m.private,
        external_repo: ExternalRepoSpec::new(
            m.external_service_type,
            m.external_service_id,
            m.external_id,
        ),
        sources: BTreeMap::new(),
        created_at: Some(utc(m.created_at)),
        updated_at: Some(utc(m.updated_at)),
        deleted_at: m.deleted_at.map(utc),
    }
}

fn service_from_model(m: external_service::Model) -> Result<ExternalService, StoreError> {
    Ok(ExternalService {
        id: m.id,
        kind: parse_kind(&m.kind)?,
        display_name: m.display_name,
        config: m.config,
        namespace_user_id: m.namespace_user_id,
        cloud_default: m.cloud_default,
        last_sync_at: m.last_sync_at.map(utc),
        next_sync_at: m.next_sync_at.map(utc),
        created_at: Some(utc(m.created_at)),
        updated_at: Some(utc(m.updated_at)),
        deleted_at: m.deleted_at.map(utc),
    })
}
