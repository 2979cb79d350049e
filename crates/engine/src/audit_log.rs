//! Append-only audit trail.
//!
//! Every mutating engine operation writes exactly one [`AuditLogEntry`] in the
//! same database transaction as the change it describes. Records are built
//! through [`AuditRecord::validate`], which refuses incomplete records.

use chrono::{DateTime, Utc};
use sea_orm::{ActiveValue, entity::prelude::*};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EngineError, ResultEngine, util::parse_uuid};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    RegisterUnit,
    CreateDebit,
    CreateCredit,
    CreateAllocation,
    AutoSettle,
    VoidEntry,
    ReverseEntry,
    RebuildBalance,
    RebuildDue,
    GenerateMonthlyDues,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RegisterUnit => "unit.register",
            Self::CreateDebit => "entry.create_debit",
            Self::CreateCredit => "entry.create_credit",
            Self::CreateAllocation => "allocation.create",
            Self::AutoSettle => "settlement.auto_settle",
            Self::VoidEntry => "entry.void",
            Self::ReverseEntry => "entry.reverse",
            Self::RebuildBalance => "balance.rebuild",
            Self::RebuildDue => "due.rebuild",
            Self::GenerateMonthlyDues => "dues.generate_monthly",
        }
    }
}

impl TryFrom<&str> for AuditAction {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        [
            Self::RegisterUnit,
            Self::CreateDebit,
            Self::CreateCredit,
            Self::CreateAllocation,
            Self::AutoSettle,
            Self::VoidEntry,
            Self::ReverseEntry,
            Self::RebuildBalance,
            Self::RebuildDue,
            Self::GenerateMonthlyDues,
        ]
        .into_iter()
        .find(|action| action.as_str() == value)
        .ok_or_else(|| EngineError::InvalidAuditRecord(format!("invalid audit action: {value}")))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditTargetType {
    Unit,
    LedgerEntry,
    Allocation,
    UnitBalance,
    Management,
}

impl AuditTargetType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::LedgerEntry => "ledger_entry",
            Self::Allocation => "allocation",
            Self::UnitBalance => "unit_balance",
            Self::Management => "management",
        }
    }
}

impl TryFrom<&str> for AuditTargetType {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "unit" => Ok(Self::Unit),
            "ledger_entry" => Ok(Self::LedgerEntry),
            "allocation" => Ok(Self::Allocation),
            "unit_balance" => Ok(Self::UnitBalance),
            "management" => Ok(Self::Management),
            other => Err(EngineError::InvalidAuditRecord(format!(
                "invalid audit target type: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub action: AuditAction,
    pub actor_uid: String,
    pub target_id: String,
    pub target_type: AuditTargetType,
    pub management_id: String,
    pub at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// An audit record about to be written.
#[derive(Clone, Debug)]
pub(crate) struct AuditRecord {
    pub action: AuditAction,
    pub actor_uid: String,
    pub target_id: String,
    pub target_type: AuditTargetType,
    pub management_id: String,
    pub at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl AuditRecord {
    /// Rejects records with a blank required field or non-object metadata.
    pub(crate) fn validate(self) -> ResultEngine<Self> {
        for (label, value) in [
            ("actor_uid", &self.actor_uid),
            ("target_id", &self.target_id),
            ("management_id", &self.management_id),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::InvalidAuditRecord(format!(
                    "{label} is required"
                )));
            }
        }
        if !self.metadata.is_object() {
            return Err(EngineError::InvalidAuditRecord(
                "metadata must be a JSON object".to_string(),
            ));
        }
        Ok(self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "audit_log")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub management_id: String,
    pub action: String,
    pub actor_uid: String,
    pub target_id: String,
    pub target_type: String,
    pub at: DateTimeUtc,
    pub metadata: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<&AuditRecord> for ActiveModel {
    fn from(record: &AuditRecord) -> Self {
        Self {
            id: ActiveValue::Set(Uuid::new_v4().to_string()),
            management_id: ActiveValue::Set(record.management_id.clone()),
            action: ActiveValue::Set(record.action.as_str().to_string()),
            actor_uid: ActiveValue::Set(record.actor_uid.clone()),
            target_id: ActiveValue::Set(record.target_id.clone()),
            target_type: ActiveValue::Set(record.target_type.as_str().to_string()),
            at: ActiveValue::Set(record.at),
            metadata: ActiveValue::Set(record.metadata.to_string()),
        }
    }
}

impl TryFrom<Model> for AuditLogEntry {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&model.id, "audit")?,
            action: AuditAction::try_from(model.action.as_str())?,
            target_type: AuditTargetType::try_from(model.target_type.as_str())?,
            metadata: serde_json::from_str(&model.metadata).map_err(|_| {
                EngineError::InvalidAuditRecord("invalid audit metadata".to_string())
            })?,
            actor_uid: model.actor_uid,
            target_id: model.target_id,
            management_id: model.management_id,
            at: model.at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AuditRecord {
        AuditRecord {
            action: AuditAction::VoidEntry,
            actor_uid: "manager-1".to_string(),
            target_id: Uuid::new_v4().to_string(),
            target_type: AuditTargetType::LedgerEntry,
            management_id: "mgmt-1".to_string(),
            at: Utc::now(),
            metadata: serde_json::json!({ "reason": "typo" }),
        }
    }

    #[test]
    fn complete_record_validates() {
        assert!(record().validate().is_ok());
    }

    #[test]
    fn missing_fields_are_contract_violations() {
        let mut missing_actor = record();
        missing_actor.actor_uid = " ".to_string();
        let err = missing_actor.validate().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ContractViolation);

        let mut missing_target = record();
        missing_target.target_id.clear();
        assert!(missing_target.validate().is_err());

        let mut bad_metadata = record();
        bad_metadata.metadata = serde_json::json!("reason");
        assert!(bad_metadata.validate().is_err());
    }

    #[test]
    fn action_names_round_trip() {
        for action in [
            AuditAction::CreateCredit,
            AuditAction::AutoSettle,
            AuditAction::RebuildBalance,
        ] {
            assert_eq!(AuditAction::try_from(action.as_str()).unwrap(), action);
        }
    }
}
