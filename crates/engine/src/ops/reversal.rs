use sea_orm::{DatabaseTransaction, prelude::*, sea_query::Expr};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    Actor, EngineError, EntrySource, EntryStatus, EntryType, ResultEngine, ReversalResult,
    VoidResult,
    audit_log::{AuditAction, AuditTargetType},
    ledger_entries::{self, EntryShape, NewEntry},
    unit_balances::BalanceDelta,
    util::{normalize_optional_text, normalize_required_id, parse_uuid},
};

use super::Engine;

fn require_reason(reason: &str) -> ResultEngine<String> {
    normalize_optional_text(Some(reason))
        .ok_or_else(|| EngineError::InvalidEntry("reason must not be empty".to_string()))
}

fn engine_source(entry: &ledger_entries::Model) -> ResultEngine<bool> {
    Ok(!EntrySource::try_from(entry.source.as_str())?.is_client_source())
}

impl Engine {
    /// Voids a posted entry: the entry stops counting towards the balance
    /// and every due/payment linked to it through allocations is replayed.
    ///
    /// Voiding an already voided entry is a no-op.
    pub async fn void_ledger_entry(
        &self,
        management_id: &str,
        entry_id: Uuid,
        reason: &str,
        actor: &Actor,
    ) -> ResultEngine<VoidResult> {
        let management_id = normalize_required_id(management_id, "management")?;
        let reason = require_reason(reason)?;
        let entry_id = entry_id.to_string();

        self.with_retry("void_ledger_entry", |engine, db_tx| {
            let (management_id, entry_id, reason) =
                (management_id.clone(), entry_id.clone(), reason.clone());
            let actor = actor.clone();
            Box::pin(async move {
                engine
                    .void_in_tx(db_tx, &management_id, &entry_id, &reason, &actor)
                    .await
            })
        })
        .await
    }

    async fn void_in_tx(
        &self,
        db_tx: &DatabaseTransaction,
        management_id: &str,
        entry_id: &str,
        reason: &str,
        actor: &Actor,
    ) -> ResultEngine<VoidResult> {
        let entry = self.require_entry(db_tx, management_id, entry_id).await?;
        match EntryStatus::try_from(entry.status.as_str())? {
            EntryStatus::Voided => {
                debug!(entry_id, "entry already voided");
                return Ok(VoidResult {
                    ok: true,
                    status: EntryStatus::Voided,
                    noop: true,
                });
            }
            EntryStatus::Reversed => {
                return Err(EntryStatus::Reversed.into_invalid("void"));
            }
            EntryStatus::Posted => {}
        }
        if engine_source(&entry)? {
            return Err(EngineError::InvalidEntry(format!(
                "{} entries cannot be voided",
                entry.source
            )));
        }

        let claim = self
            .claim_unit(db_tx, management_id, &entry.unit_id)
            .await?;
        let now = self.now();
        let update = ledger_entries::Entity::update_many()
            .col_expr(
                ledger_entries::Column::Status,
                Expr::value(EntryStatus::Voided.as_str()),
            )
            .col_expr(ledger_entries::Column::VoidedAt, Expr::value(Some(now)))
            .col_expr(
                ledger_entries::Column::VoidedBy,
                Expr::value(Some(actor.uid.clone())),
            )
            .col_expr(
                ledger_entries::Column::VoidReason,
                Expr::value(Some(reason.to_string())),
            )
            .col_expr(
                ledger_entries::Column::Revision,
                Expr::value(entry.revision + 1),
            );
        self.cas_entry(db_tx, &entry, update).await?;
        let voided = ledger_entries::Model {
            status: EntryStatus::Voided.as_str().to_string(),
            voided_at: Some(now),
            voided_by: Some(actor.uid.clone()),
            void_reason: Some(reason.to_string()),
            revision: entry.revision + 1,
            ..entry.clone()
        };

        let detached = self.detach_entry(db_tx, &voided).await?;
        let balance = self
            .apply_delta(db_tx, &claim, BalanceDelta::unpost(&entry))
            .await?;

        self.record_audit(
            db_tx,
            AuditAction::VoidEntry,
            actor,
            management_id,
            AuditTargetType::LedgerEntry,
            entry_id,
            json!({
                "unit_id": entry.unit_id,
                "reason": reason,
                "amount_minor": entry.amount_minor,
                "entry_type": entry.entry_type,
                "detached_allocation_count": detached.allocation_count,
                "detached_allocation_minor": detached.allocation_minor,
            }),
        )
        .await?;

        info!(
            management_id,
            entry_id,
            balance_minor = balance.balance_minor,
            "entry voided"
        );
        Ok(VoidResult {
            ok: true,
            status: EntryStatus::Voided,
            noop: false,
        })
    }

    /// Reverses a posted entry by posting an opposite entry and marking the
    /// original `reversed`. The original's allocations stop counting, which
    /// restores the dues (or payments) they touched.
    ///
    /// Reversing twice returns the first reversal with `noop: true`.
    pub async fn reverse_ledger_entry(
        &self,
        management_id: &str,
        entry_id: Uuid,
        reason: &str,
        actor: &Actor,
    ) -> ResultEngine<ReversalResult> {
        self.reverse(management_id, entry_id, reason, actor, false)
            .await
    }

    /// Like [`Engine::reverse_ledger_entry`], restricted to payments.
    pub async fn reverse_payment(
        &self,
        management_id: &str,
        entry_id: Uuid,
        reason: &str,
        actor: &Actor,
    ) -> ResultEngine<ReversalResult> {
        self.reverse(management_id, entry_id, reason, actor, true)
            .await
    }

    async fn reverse(
        &self,
        management_id: &str,
        entry_id: Uuid,
        reason: &str,
        actor: &Actor,
        payments_only: bool,
    ) -> ResultEngine<ReversalResult> {
        let management_id = normalize_required_id(management_id, "management")?;
        let reason = require_reason(reason)?;
        let entry_id = entry_id.to_string();

        self.with_retry("reverse_ledger_entry", |engine, db_tx| {
            let (management_id, entry_id, reason) =
                (management_id.clone(), entry_id.clone(), reason.clone());
            let actor = actor.clone();
            Box::pin(async move {
                engine
                    .reverse_in_tx(
                        db_tx,
                        &management_id,
                        &entry_id,
                        &reason,
                        &actor,
                        payments_only,
                    )
                    .await
            })
        })
        .await
    }

    async fn reverse_in_tx(
        &self,
        db_tx: &DatabaseTransaction,
        management_id: &str,
        entry_id: &str,
        reason: &str,
        actor: &Actor,
        payments_only: bool,
    ) -> ResultEngine<ReversalResult> {
        let entry = self.require_entry(db_tx, management_id, entry_id).await?;
        if payments_only && !entry.is_payment() {
            return Err(EngineError::InvalidEntry(
                "entry is not a payment".to_string(),
            ));
        }
        if engine_source(&entry)? {
            return Err(EngineError::InvalidEntry(format!(
                "{} entries cannot be reversed",
                entry.source
            )));
        }
        match EntryStatus::try_from(entry.status.as_str())? {
            EntryStatus::Reversed => {
                let reversal_entry_id = entry.reversal_entry_id.as_deref().ok_or_else(|| {
                    EngineError::InvalidEntry("reversed entry without reversal".to_string())
                })?;
                debug!(entry_id, reversal_entry_id, "entry already reversed");
                return Ok(ReversalResult {
                    ok: true,
                    reversal_entry_id: parse_uuid(reversal_entry_id, "entry")?,
                    reversed_allocation_count: 0,
                    reversed_allocation_minor: 0,
                    noop: true,
                });
            }
            EntryStatus::Voided => {
                return Err(EntryStatus::Voided.into_invalid("reverse"));
            }
            EntryStatus::Posted => {}
        }

        let claim = self
            .claim_unit(db_tx, management_id, &entry.unit_id)
            .await?;
        let entry_type = EntryType::try_from(entry.entry_type.as_str())?;
        let metadata = json!({ "reason": reason });
        let description = format!("Reversal of {}", entry.id);
        let reversal = ledger_entries::ActiveModel::from(NewEntry {
            management_id,
            unit_id: &entry.unit_id,
            entry_type: entry_type.opposite(),
            shape: EntryShape::Plain,
            amount_minor: entry.amount_minor,
            source: EntrySource::Reversal,
            related_due_id: entry.related_due_id.as_deref(),
            reversal_of: Some(&entry.id),
            description: Some(&description),
            metadata: &metadata,
            created_at: self.now(),
            created_by: &actor.uid,
        })
        .insert(db_tx)
        .await?;

        let now = self.now();
        let update = ledger_entries::Entity::update_many()
            .col_expr(
                ledger_entries::Column::Status,
                Expr::value(EntryStatus::Reversed.as_str()),
            )
            .col_expr(ledger_entries::Column::ReversedAt, Expr::value(Some(now)))
            .col_expr(
                ledger_entries::Column::ReversedBy,
                Expr::value(Some(actor.uid.clone())),
            )
            .col_expr(
                ledger_entries::Column::ReversalReason,
                Expr::value(Some(reason.to_string())),
            )
            .col_expr(
                ledger_entries::Column::ReversalEntryId,
                Expr::value(Some(reversal.id.clone())),
            )
            .col_expr(
                ledger_entries::Column::Revision,
                Expr::value(entry.revision + 1),
            );
        self.cas_entry(db_tx, &entry, update).await?;
        let reversed = ledger_entries::Model {
            status: EntryStatus::Reversed.as_str().to_string(),
            reversed_at: Some(now),
            reversed_by: Some(actor.uid.clone()),
            reversal_reason: Some(reason.to_string()),
            reversal_entry_id: Some(reversal.id.clone()),
            revision: entry.revision + 1,
            ..entry.clone()
        };

        let detached = self.detach_entry(db_tx, &reversed).await?;
        let balance = self
            .apply_delta(db_tx, &claim, BalanceDelta::unpost(&entry))
            .await?;

        self.record_audit(
            db_tx,
            AuditAction::ReverseEntry,
            actor,
            management_id,
            AuditTargetType::LedgerEntry,
            entry_id,
            json!({
                "unit_id": entry.unit_id,
                "reason": reason,
                "reversal_entry_id": reversal.id,
                "reversed_allocation_count": detached.allocation_count,
                "reversed_allocation_minor": detached.allocation_minor,
            }),
        )
        .await?;

        info!(
            management_id,
            entry_id,
            reversal_entry_id = reversal.id,
            reversed_allocation_minor = detached.allocation_minor,
            balance_minor = balance.balance_minor,
            "entry reversed"
        );
        Ok(ReversalResult {
            ok: true,
            reversal_entry_id: parse_uuid(&reversal.id, "entry")?,
            reversed_allocation_count: detached.allocation_count,
            reversed_allocation_minor: detached.allocation_minor,
            noop: false,
        })
    }
}

impl EntryStatus {
    fn into_invalid(self, action: &str) -> EngineError {
        EngineError::InvalidEntry(format!("cannot {action} a {} entry", self.as_str()))
    }
}
