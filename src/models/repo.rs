//! Repo entity model
//!
//! Catalog row for one repository. Identity is the
//! (`external_service_type`, `external_service_id`, `external_id`) triple;
//! `name` is unique case-insensitively among rows whose `deleted_at` is null.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "repos")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub name: String,

    pub uri: String,

    pub description: String,

    pub fork: bool,

    pub archived: bool,

    pub private: bool,

    pub external_service_type: String,

    pub external_service_id: String,

    pub external_id: String,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    /// Set when the last service-membership was removed
    pub deleted_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::external_service_repo::Entity")]
    ExternalServiceRepo,
}

impl Related<super::external_service_repo::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExternalServiceRepo.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
