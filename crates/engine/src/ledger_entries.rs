//! Ledger entries.
//!
//! A [`LedgerEntry`] is the atomic financial fact of a unit: a DEBIT raises the
//! unit's obligation, a CREDIT records money received (or bookkeeping glue
//! produced by the engine). Once posted, an entry is never edited except for
//! its status transition (`posted` → `voided` | `reversed`) and its derived
//! aggregate fields.
//!
//! Two kinds of entries carry derived fields:
//! - a **due** is a DEBIT posted by a client; it carries `due_*` fields;
//! - a **payment** is a CREDIT posted by a client; it carries
//!   `applied`/`unapplied` fields.
//!
//! Entries created by the engine itself (`reversal`, `auto_settlement`) carry
//! neither and do not affect the unit balance.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    EngineError, ResultEngine,
    replay::{AllocationStatus, DueAggregate, DueStatus, PaymentAggregate},
    util::{parse_optional_uuid, parse_uuid},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Debit,
    Credit,
}

impl EntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Debit => Self::Credit,
            Self::Credit => Self::Debit,
        }
    }
}

impl TryFrom<&str> for EntryType {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "debit" => Ok(Self::Debit),
            "credit" => Ok(Self::Credit),
            other => Err(EngineError::InvalidEntry(format!(
                "invalid entry type: {other}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Posted,
    Voided,
    Reversed,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Posted => "posted",
            Self::Voided => "voided",
            Self::Reversed => "reversed",
        }
    }
}

impl TryFrom<&str> for EntryStatus {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "posted" => Ok(Self::Posted),
            "voided" => Ok(Self::Voided),
            "reversed" => Ok(Self::Reversed),
            other => Err(EngineError::InvalidEntry(format!(
                "invalid entry status: {other}"
            ))),
        }
    }
}

/// Origin tag of an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    Dues,
    Manual,
    Payment,
    Adjustment,
    /// Opposite entry created by a reversal. Engine-only.
    Reversal,
    /// Settlement glue created by auto-settlement. Engine-only.
    AutoSettlement,
}

impl EntrySource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dues => "dues",
            Self::Manual => "manual",
            Self::Payment => "payment",
            Self::Adjustment => "adjustment",
            Self::Reversal => "reversal",
            Self::AutoSettlement => "auto_settlement",
        }
    }

    /// Sources a client may post with.
    pub fn is_client_source(self) -> bool {
        !matches!(self, Self::Reversal | Self::AutoSettlement)
    }
}

impl TryFrom<&str> for EntrySource {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "dues" => Ok(Self::Dues),
            "manual" => Ok(Self::Manual),
            "payment" => Ok(Self::Payment),
            "adjustment" => Ok(Self::Adjustment),
            "reversal" => Ok(Self::Reversal),
            "auto_settlement" => Ok(Self::AutoSettlement),
            other => Err(EngineError::InvalidEntry(format!(
                "invalid entry source: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub management_id: String,
    pub unit_id: String,
    pub entry_type: EntryType,
    pub amount_minor: i64,
    pub status: EntryStatus,
    pub source: EntrySource,
    pub affects_balance: bool,
    pub related_due_id: Option<Uuid>,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub voided_at: Option<DateTime<Utc>>,
    pub voided_by: Option<String>,
    pub void_reason: Option<String>,
    pub reversed_at: Option<DateTime<Utc>>,
    pub reversed_by: Option<String>,
    pub reversal_reason: Option<String>,
    pub reversal_of: Option<Uuid>,
    pub reversal_entry_id: Option<Uuid>,
    pub due: Option<DueAggregate>,
    pub aggregates_rebuilt_at: Option<DateTime<Utc>>,
    pub payment: Option<PaymentAggregate>,
    pub revision: i64,
}

impl LedgerEntry {
    pub fn is_posted(&self) -> bool {
        self.status == EntryStatus::Posted
    }

    pub fn is_due(&self) -> bool {
        self.entry_type == EntryType::Debit && self.due.is_some()
    }

    pub fn is_payment(&self) -> bool {
        self.entry_type == EntryType::Credit && self.payment.is_some()
    }

    /// Signed contribution to the unit balance while posted
    /// (`credit - debit`).
    pub fn balance_effect(&self) -> i64 {
        if !self.affects_balance {
            return 0;
        }
        match self.entry_type {
            EntryType::Credit => self.amount_minor,
            EntryType::Debit => -self.amount_minor,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "ledger_entries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub management_id: String,
    pub unit_id: String,
    pub entry_type: String,
    pub amount_minor: i64,
    pub status: String,
    pub source: String,
    pub affects_balance: bool,
    pub related_due_id: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<String>,
    pub created_at: DateTimeUtc,
    pub created_by: String,
    pub voided_at: Option<DateTimeUtc>,
    pub voided_by: Option<String>,
    pub void_reason: Option<String>,
    pub reversed_at: Option<DateTimeUtc>,
    pub reversed_by: Option<String>,
    pub reversal_reason: Option<String>,
    pub reversal_of: Option<String>,
    pub reversal_entry_id: Option<String>,
    pub due_total_minor: Option<i64>,
    pub due_allocated_minor: Option<i64>,
    pub due_outstanding_minor: Option<i64>,
    pub due_status: Option<String>,
    pub aggregates_rebuilt_at: Option<DateTimeUtc>,
    pub applied_minor: Option<i64>,
    pub unapplied_minor: Option<i64>,
    pub allocation_status: Option<String>,
    pub revision: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub(crate) fn is_posted(&self) -> bool {
        self.status == EntryStatus::Posted.as_str()
    }

    pub(crate) fn is_due(&self) -> bool {
        self.entry_type == EntryType::Debit.as_str() && self.due_total_minor.is_some()
    }

    pub(crate) fn is_payment(&self) -> bool {
        self.entry_type == EntryType::Credit.as_str() && self.applied_minor.is_some()
    }

    pub(crate) fn due_outstanding(&self) -> i64 {
        self.due_outstanding_minor.unwrap_or(0)
    }

    pub(crate) fn unapplied(&self) -> i64 {
        self.unapplied_minor.unwrap_or(0)
    }

    pub(crate) fn due_aggregate(&self) -> ResultEngine<Option<DueAggregate>> {
        if !self.is_due() {
            return Ok(None);
        }
        let status = DueStatus::try_from(self.due_status.as_deref().unwrap_or_default())?;
        Ok(Some(DueAggregate {
            total_minor: self.due_total_minor.unwrap_or(0),
            allocated_minor: self.due_allocated_minor.unwrap_or(0),
            outstanding_minor: self.due_outstanding(),
            status,
        }))
    }

    pub(crate) fn payment_aggregate(&self) -> ResultEngine<Option<PaymentAggregate>> {
        if !self.is_payment() {
            return Ok(None);
        }
        let status =
            AllocationStatus::try_from(self.allocation_status.as_deref().unwrap_or_default())?;
        Ok(Some(PaymentAggregate {
            applied_minor: self.applied_minor.unwrap_or(0),
            unapplied_minor: self.unapplied(),
            status,
        }))
    }
}

/// Which derived fields a new entry starts with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryShape {
    Due,
    Payment,
    /// Engine glue without aggregate fields.
    Plain,
}

pub(crate) struct NewEntry<'a> {
    pub management_id: &'a str,
    pub unit_id: &'a str,
    pub entry_type: EntryType,
    pub shape: EntryShape,
    pub amount_minor: i64,
    pub source: EntrySource,
    pub related_due_id: Option<&'a str>,
    pub reversal_of: Option<&'a str>,
    pub description: Option<&'a str>,
    pub metadata: &'a serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub created_by: &'a str,
}

impl From<NewEntry<'_>> for ActiveModel {
    fn from(new: NewEntry<'_>) -> Self {
        use sea_orm::ActiveValue::Set;

        let is_due = new.shape == EntryShape::Due;
        let is_payment = new.shape == EntryShape::Payment;
        Self {
            id: Set(Uuid::new_v4().to_string()),
            management_id: Set(new.management_id.to_string()),
            unit_id: Set(new.unit_id.to_string()),
            entry_type: Set(new.entry_type.as_str().to_string()),
            amount_minor: Set(new.amount_minor),
            status: Set(EntryStatus::Posted.as_str().to_string()),
            source: Set(new.source.as_str().to_string()),
            affects_balance: Set(new.source.is_client_source()),
            related_due_id: Set(new.related_due_id.map(ToString::to_string)),
            description: Set(new.description.map(ToString::to_string)),
            metadata: Set(Some(new.metadata.to_string())),
            created_at: Set(new.created_at),
            created_by: Set(new.created_by.to_string()),
            voided_at: Set(None),
            voided_by: Set(None),
            void_reason: Set(None),
            reversed_at: Set(None),
            reversed_by: Set(None),
            reversal_reason: Set(None),
            reversal_of: Set(new.reversal_of.map(ToString::to_string)),
            reversal_entry_id: Set(None),
            due_total_minor: Set(is_due.then_some(new.amount_minor)),
            due_allocated_minor: Set(is_due.then_some(0)),
            due_outstanding_minor: Set(is_due.then_some(new.amount_minor)),
            due_status: Set(is_due.then(|| DueStatus::Open.as_str().to_string())),
            aggregates_rebuilt_at: Set(None),
            applied_minor: Set(is_payment.then_some(0)),
            unapplied_minor: Set(is_payment.then_some(new.amount_minor)),
            allocation_status: Set(
                is_payment.then(|| AllocationStatus::Unapplied.as_str().to_string()),
            ),
            revision: Set(0),
        }
    }
}

impl TryFrom<Model> for LedgerEntry {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let due = model.due_aggregate()?;
        let payment = model.payment_aggregate()?;
        let metadata = match model.metadata.as_deref() {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|_| EngineError::InvalidEntry("invalid entry metadata".to_string()))?,
            None => serde_json::Value::Object(serde_json::Map::new()),
        };

        Ok(Self {
            id: parse_uuid(&model.id, "entry")?,
            entry_type: EntryType::try_from(model.entry_type.as_str())?,
            status: EntryStatus::try_from(model.status.as_str())?,
            source: EntrySource::try_from(model.source.as_str())?,
            related_due_id: parse_optional_uuid(model.related_due_id.as_deref(), "due")?,
            reversal_of: parse_optional_uuid(model.reversal_of.as_deref(), "entry")?,
            reversal_entry_id: parse_optional_uuid(model.reversal_entry_id.as_deref(), "entry")?,
            management_id: model.management_id,
            unit_id: model.unit_id,
            amount_minor: model.amount_minor,
            affects_balance: model.affects_balance,
            description: model.description,
            metadata,
            created_at: model.created_at,
            created_by: model.created_by,
            voided_at: model.voided_at,
            voided_by: model.voided_by,
            void_reason: model.void_reason,
            reversed_at: model.reversed_at,
            reversed_by: model.reversed_by,
            reversal_reason: model.reversal_reason,
            due,
            aggregates_rebuilt_at: model.aggregates_rebuilt_at,
            payment,
            revision: model.revision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_client_sources_are_postable() {
        assert!(EntrySource::Dues.is_client_source());
        assert!(EntrySource::Payment.is_client_source());
        assert!(!EntrySource::Reversal.is_client_source());
        assert!(!EntrySource::AutoSettlement.is_client_source());
    }

    #[test]
    fn enum_strings_round_trip() {
        for source in [
            EntrySource::Dues,
            EntrySource::Manual,
            EntrySource::Payment,
            EntrySource::Adjustment,
            EntrySource::Reversal,
            EntrySource::AutoSettlement,
        ] {
            assert_eq!(EntrySource::try_from(source.as_str()).unwrap(), source);
        }
        assert_eq!(EntryType::Debit.opposite(), EntryType::Credit);
        assert!(EntryStatus::try_from("deleted").is_err());
    }

    #[test]
    fn new_due_starts_open_and_engine_glue_carries_no_aggregates() {
        let metadata = serde_json::json!({});
        let new = |shape, source| NewEntry {
            management_id: "mgmt",
            unit_id: "A-1",
            entry_type: EntryType::Debit,
            shape,
            amount_minor: 15_000,
            source,
            related_due_id: None,
            reversal_of: None,
            description: None,
            metadata: &metadata,
            created_at: Utc::now(),
            created_by: "manager",
        };

        let due = ActiveModel::from(new(EntryShape::Due, EntrySource::Dues));
        assert_eq!(due.due_outstanding_minor.unwrap(), Some(15_000));
        assert_eq!(due.due_status.unwrap(), Some("open".to_string()));
        assert_eq!(due.applied_minor.unwrap(), None);
        assert!(due.affects_balance.unwrap());

        let glue = ActiveModel::from(new(EntryShape::Plain, EntrySource::Reversal));
        assert_eq!(glue.due_total_minor.unwrap(), None);
        assert!(!glue.affects_balance.unwrap());
    }
}
