use sea_orm::{ActiveValue, ConnectionTrait, QueryFilter, QueryOrder, prelude::*};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::{
    Actor, EngineError, EntryStatus, EntryType, ResultEngine, Unit,
    audit_log::{AuditAction, AuditTargetType},
    ledger_entries, units,
    util::{normalize_optional_text, normalize_required_id},
};

use super::Engine;

impl Engine {
    pub(super) async fn require_unit<C: ConnectionTrait>(
        &self,
        db: &C,
        management_id: &str,
        unit_id: &str,
    ) -> ResultEngine<units::Model> {
        units::Entity::find_by_id((management_id.to_string(), unit_id.to_string()))
            .one(db)
            .await?
            .ok_or_else(|| EngineError::KeyNotFound("unit not exists".to_string()))
    }

    pub(super) async fn find_entry<C: ConnectionTrait>(
        &self,
        db: &C,
        management_id: &str,
        entry_id: &str,
    ) -> ResultEngine<Option<ledger_entries::Model>> {
        ledger_entries::Entity::find_by_id(entry_id.to_string())
            .filter(ledger_entries::Column::ManagementId.eq(management_id.to_string()))
            .one(db)
            .await
            .map_err(Into::into)
    }

    pub(super) async fn require_entry<C: ConnectionTrait>(
        &self,
        db: &C,
        management_id: &str,
        entry_id: &str,
    ) -> ResultEngine<ledger_entries::Model> {
        self.find_entry(db, management_id, entry_id)
            .await?
            .ok_or_else(|| EngineError::KeyNotFound("entry not exists".to_string()))
    }

    /// A posted due of the given unit.
    pub(super) async fn require_posted_due<C: ConnectionTrait>(
        &self,
        db: &C,
        management_id: &str,
        due_id: &str,
    ) -> ResultEngine<ledger_entries::Model> {
        let due = self
            .find_entry(db, management_id, due_id)
            .await?
            .filter(ledger_entries::Model::is_due)
            .ok_or_else(|| EngineError::KeyNotFound("due not exists".to_string()))?;
        if !due.is_posted() {
            return Err(EngineError::InvalidEntry(format!(
                "due is {}",
                due.status
            )));
        }
        Ok(due)
    }

    /// A posted payment.
    pub(super) async fn require_posted_payment<C: ConnectionTrait>(
        &self,
        db: &C,
        management_id: &str,
        payment_id: &str,
    ) -> ResultEngine<ledger_entries::Model> {
        let payment = self
            .find_entry(db, management_id, payment_id)
            .await?
            .filter(ledger_entries::Model::is_payment)
            .ok_or_else(|| EngineError::KeyNotFound("payment not exists".to_string()))?;
        if !payment.is_posted() {
            return Err(EngineError::InvalidEntry(format!(
                "payment is {}",
                payment.status
            )));
        }
        Ok(payment)
    }

    /// Posted dues of a unit with outstanding > 0, oldest first.
    pub(super) async fn open_dues<C: ConnectionTrait>(
        &self,
        db: &C,
        management_id: &str,
        unit_id: &str,
    ) -> ResultEngine<Vec<ledger_entries::Model>> {
        ledger_entries::Entity::find()
            .filter(ledger_entries::Column::ManagementId.eq(management_id.to_string()))
            .filter(ledger_entries::Column::UnitId.eq(unit_id.to_string()))
            .filter(ledger_entries::Column::EntryType.eq(EntryType::Debit.as_str()))
            .filter(ledger_entries::Column::Status.eq(EntryStatus::Posted.as_str()))
            .filter(ledger_entries::Column::DueOutstandingMinor.gt(0))
            .order_by_asc(ledger_entries::Column::CreatedAt)
            .order_by_asc(ledger_entries::Column::Id)
            .all(db)
            .await
            .map_err(Into::into)
    }

    /// Posted payments of a unit with unapplied credit, oldest first.
    pub(super) async fn open_payments<C: ConnectionTrait>(
        &self,
        db: &C,
        management_id: &str,
        unit_id: &str,
    ) -> ResultEngine<Vec<ledger_entries::Model>> {
        ledger_entries::Entity::find()
            .filter(ledger_entries::Column::ManagementId.eq(management_id.to_string()))
            .filter(ledger_entries::Column::UnitId.eq(unit_id.to_string()))
            .filter(ledger_entries::Column::EntryType.eq(EntryType::Credit.as_str()))
            .filter(ledger_entries::Column::Status.eq(EntryStatus::Posted.as_str()))
            .filter(ledger_entries::Column::UnappliedMinor.gt(0))
            .order_by_asc(ledger_entries::Column::CreatedAt)
            .order_by_asc(ledger_entries::Column::Id)
            .all(db)
            .await
            .map_err(Into::into)
    }

    /// Registers a unit so postings against it are accepted.
    ///
    /// Returns `false` when the unit was already registered.
    pub async fn register_unit(
        &self,
        management_id: &str,
        unit_id: &str,
        label: Option<&str>,
        actor: &Actor,
    ) -> ResultEngine<bool> {
        let management_id = normalize_required_id(management_id, "management")?;
        let unit_id = normalize_required_id(unit_id, "unit")?;
        let label = normalize_optional_text(label);

        self.with_retry("register_unit", |engine, db_tx| {
            let (management_id, unit_id, label) =
                (management_id.clone(), unit_id.clone(), label.clone());
            let actor = actor.clone();
            Box::pin(async move {
                let existing =
                    units::Entity::find_by_id((management_id.clone(), unit_id.clone()))
                        .one(db_tx)
                        .await?;
                if existing.is_some() {
                    return Ok(false);
                }

                let now = engine.now();
                units::ActiveModel {
                    management_id: ActiveValue::Set(management_id.clone()),
                    unit_id: ActiveValue::Set(unit_id.clone()),
                    label: ActiveValue::Set(label.clone()),
                    created_at: ActiveValue::Set(now),
                }
                .insert(db_tx)
                .await?;

                engine
                    .record_audit(
                        db_tx,
                        AuditAction::RegisterUnit,
                        &actor,
                        &management_id,
                        AuditTargetType::Unit,
                        &unit_id,
                        json!({ "label": label }),
                    )
                    .await?;
                info!(management_id, unit_id, "unit registered");
                Ok(true)
            })
        })
        .await
    }

    pub async fn unit(&self, management_id: &str, unit_id: &str) -> ResultEngine<Unit> {
        self.require_unit(&self.database, management_id, unit_id)
            .await
            .map(Unit::from)
    }

    pub async fn list_units(&self, management_id: &str) -> ResultEngine<Vec<Unit>> {
        let models = units::Entity::find()
            .filter(units::Column::ManagementId.eq(management_id.to_string()))
            .order_by_asc(units::Column::UnitId)
            .all(&self.database)
            .await?;
        Ok(models.into_iter().map(Unit::from).collect())
    }

    /// Loads a single ledger entry.
    pub async fn ledger_entry(
        &self,
        management_id: &str,
        entry_id: Uuid,
    ) -> ResultEngine<crate::LedgerEntry> {
        let model = self
            .require_entry(&self.database, management_id, &entry_id.to_string())
            .await?;
        crate::LedgerEntry::try_from(model)
    }
}
