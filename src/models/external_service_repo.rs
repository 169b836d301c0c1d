//! ExternalServiceRepo entity model
//!
//! Join table recording which external services currently claim a repo.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "external_service_repos")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub external_service_id: i32,

    #[sea_orm(primary_key, auto_increment = false)]
    pub repo_id: i32,

    /// Clone URL as reported by this service
    pub clone_url: String,

    /// Namespace user of the owning service, if user-owned
    pub user_id: Option<i32>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::external_service::Entity",
        from = "Column::ExternalServiceId",
        to = "super::external_service::Column::Id"
    )]
    ExternalService,
    #[sea_orm(
        belongs_to = "super::repo::Entity",
        from = "Column::RepoId",
        to = "super::repo::Column::Id"
    )]
    Repo,
}

impl Related<super::external_service::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExternalService.def()
    }
}

impl Related<super::repo::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Repo.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
