//! Due allocations.
//!
//! A [`DueAllocation`] records that `amount_minor` of a payment's credit
//! satisfies a due. Allocations are the only source of truth for the derived
//! fields on dues and payments; they are never updated or deleted.

use chrono::{DateTime, Utc};
use sea_orm::{ActiveValue, entity::prelude::*};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    EngineError,
    util::{parse_optional_uuid, parse_uuid},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DueAllocation {
    pub id: Uuid,
    pub management_id: String,
    pub unit_id: String,
    pub due_id: Uuid,
    pub payment_entry_id: Uuid,
    /// Set when the allocation was written by auto-settlement.
    pub settlement_entry_id: Option<Uuid>,
    pub amount_minor: i64,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "due_allocations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub management_id: String,
    pub unit_id: String,
    pub due_id: String,
    pub payment_entry_id: String,
    pub settlement_entry_id: Option<String>,
    pub amount_minor: i64,
    /// Position of this row among the allocations of the same
    /// `(due_id, payment_entry_id)` pair; unique together with the pair.
    pub seq: i32,
    pub created_at: DateTimeUtc,
    pub created_by: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub(crate) struct NewAllocation<'a> {
    pub management_id: &'a str,
    pub unit_id: &'a str,
    pub due_id: &'a str,
    pub payment_entry_id: &'a str,
    pub settlement_entry_id: Option<&'a str>,
    pub amount_minor: i64,
    pub seq: i32,
    pub created_at: DateTime<Utc>,
    pub created_by: &'a str,
}

impl From<NewAllocation<'_>> for ActiveModel {
    fn from(new: NewAllocation<'_>) -> Self {
        Self {
            id: ActiveValue::Set(Uuid::new_v4().to_string()),
            management_id: ActiveValue::Set(new.management_id.to_string()),
            unit_id: ActiveValue::Set(new.unit_id.to_string()),
            due_id: ActiveValue::Set(new.due_id.to_string()),
            payment_entry_id: ActiveValue::Set(new.payment_entry_id.to_string()),
            settlement_entry_id: ActiveValue::Set(new.settlement_entry_id.map(ToString::to_string)),
            amount_minor: ActiveValue::Set(new.amount_minor),
            seq: ActiveValue::Set(new.seq),
            created_at: ActiveValue::Set(new.created_at),
            created_by: ActiveValue::Set(new.created_by.to_string()),
        }
    }
}

impl TryFrom<Model> for DueAllocation {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&model.id, "allocation")?,
            due_id: parse_uuid(&model.due_id, "due")?,
            payment_entry_id: parse_uuid(&model.payment_entry_id, "payment")?,
            settlement_entry_id: parse_optional_uuid(
                model.settlement_entry_id.as_deref(),
                "settlement entry",
            )?,
            management_id: model.management_id,
            unit_id: model.unit_id,
            amount_minor: model.amount_minor,
            created_at: model.created_at,
            created_by: model.created_by,
        })
    }
}
