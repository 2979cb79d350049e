//! Units known to a management.
//!
//! Units are provisioned by an external collaborator; the engine only keeps
//! the registry needed to reject postings against unknown units.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub management_id: String,
    pub unit_id: String,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "units")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub management_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub unit_id: String,
    pub label: Option<String>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for Unit {
    fn from(model: Model) -> Self {
        Self {
            management_id: model.management_id,
            unit_id: model.unit_id,
            label: model.label,
            created_at: model.created_at,
        }
    }
}
