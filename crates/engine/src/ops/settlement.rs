use std::collections::HashMap;

use sea_orm::{DatabaseTransaction, prelude::*};
use serde_json::json;
use tracing::{debug, info};

use crate::{
    Actor, EngineError, EntrySource, EntryType, ResultEngine, SettlementResult,
    audit_log::{AuditAction, AuditTargetType},
    ledger_entries::{self, EntryShape, NewEntry},
    plan::{OpenCredit, OpenDue, plan_settlement},
    unit_balances::BalanceDelta,
    util::{normalize_required_id, parse_uuid},
};

use super::{Engine, aggregates::AllocationDraft};

impl Engine {
    /// Closes as many open dues *in full* as the unit's unapplied credit
    /// allows, oldest due first, drawing credit from payments FIFO.
    ///
    /// The whole read-decide-write runs in one transaction claimed on the
    /// unit, so two concurrent calls never spend the same credit: the loser
    /// retries and sees what is left.
    pub async fn auto_settle_from_credit(
        &self,
        management_id: &str,
        unit_id: &str,
        actor: &Actor,
    ) -> ResultEngine<SettlementResult> {
        let management_id = normalize_required_id(management_id, "management")?;
        let unit_id = normalize_required_id(unit_id, "unit")?;

        self.with_retry("auto_settle_from_credit", |engine, db_tx| {
            let (management_id, unit_id) = (management_id.clone(), unit_id.clone());
            let actor = actor.clone();
            Box::pin(async move {
                engine
                    .settle_unit(db_tx, &management_id, &unit_id, &actor)
                    .await
            })
        })
        .await
    }

    async fn settle_unit(
        &self,
        db_tx: &DatabaseTransaction,
        management_id: &str,
        unit_id: &str,
        actor: &Actor,
    ) -> ResultEngine<SettlementResult> {
        self.require_unit(db_tx, management_id, unit_id).await?;
        let claim = self.claim_unit(db_tx, management_id, unit_id).await?;

        let payments = self.open_payments(db_tx, management_id, unit_id).await?;
        let dues = self.open_dues(db_tx, management_id, unit_id).await?;
        let credits: Vec<OpenCredit> = payments
            .iter()
            .map(|p| OpenCredit {
                id: p.id.clone(),
                created_at: p.created_at,
                unapplied_minor: p.unapplied(),
            })
            .collect();
        let open: Vec<OpenDue> = dues
            .iter()
            .map(|d| OpenDue {
                id: d.id.clone(),
                created_at: d.created_at,
                outstanding_minor: d.due_outstanding(),
            })
            .collect();

        let plan = plan_settlement(&credits, &open);
        if plan.closures.is_empty() {
            debug!(
                management_id,
                unit_id,
                remaining_credit_minor = plan.remaining_credit_minor,
                "nothing to settle"
            );
            return Ok(SettlementResult {
                remaining_credit_minor: plan.remaining_credit_minor,
                ..SettlementResult::default()
            });
        }

        let mut payments: HashMap<String, ledger_entries::Model> =
            payments.into_iter().map(|p| (p.id.clone(), p)).collect();
        let dues: HashMap<String, ledger_entries::Model> =
            dues.into_iter().map(|d| (d.id.clone(), d)).collect();
        let mut settlement_ids = Vec::with_capacity(plan.closures.len());
        let mut touched: Vec<String> = Vec::new();

        for closure in &plan.closures {
            let due = dues
                .get(&closure.due_id)
                .ok_or_else(|| EngineError::KeyNotFound("due not exists".to_string()))?;
            let draws_meta: Vec<_> = closure
                .draws
                .iter()
                .map(|d| json!({ "payment_entry_id": d.payment_id, "amount_minor": d.amount_minor }))
                .collect();
            let metadata = json!({ "draws": draws_meta });
            let settlement = ledger_entries::ActiveModel::from(NewEntry {
                management_id,
                unit_id,
                entry_type: EntryType::Credit,
                shape: EntryShape::Plain,
                amount_minor: closure.amount_minor,
                source: EntrySource::AutoSettlement,
                related_due_id: Some(&due.id),
                reversal_of: None,
                description: Some("Auto-settlement from unapplied credit"),
                metadata: &metadata,
                created_at: self.now(),
                created_by: &actor.uid,
            })
            .insert(db_tx)
            .await?;

            for draw in &closure.draws {
                let payment = payments
                    .get(&draw.payment_id)
                    .ok_or_else(|| EngineError::KeyNotFound("payment not exists".to_string()))?;
                self.insert_allocation(
                    db_tx,
                    AllocationDraft {
                        due,
                        payment,
                        settlement_entry_id: Some(&settlement.id),
                        amount_minor: draw.amount_minor,
                        created_by: &actor.uid,
                    },
                )
                .await?;
                if !touched.contains(&draw.payment_id) {
                    touched.push(draw.payment_id.clone());
                }
            }
            self.sync_due(db_tx, due, None).await?;
            settlement_ids.push(parse_uuid(&settlement.id, "entry")?);
        }

        for payment_id in &touched {
            if let Some(payment) = payments.get(payment_id) {
                let synced = self.sync_payment(db_tx, payment).await?;
                payments.insert(payment_id.clone(), synced);
            }
        }
        self.apply_delta(db_tx, &claim, BalanceDelta::default())
            .await?;

        let result = SettlementResult {
            closed_due_count: u32::try_from(plan.closures.len()).unwrap_or(u32::MAX),
            total_settled_minor: plan.total_settled_minor,
            remaining_credit_minor: plan.remaining_credit_minor,
            settlement_entry_ids: settlement_ids,
        };
        self.record_audit(
            db_tx,
            AuditAction::AutoSettle,
            actor,
            management_id,
            AuditTargetType::Unit,
            unit_id,
            json!({
                "closed_due_count": result.closed_due_count,
                "total_settled_minor": result.total_settled_minor,
                "remaining_credit_minor": result.remaining_credit_minor,
                "due_ids": plan.closures.iter().map(|c| c.due_id.clone()).collect::<Vec<_>>(),
                "settlement_entry_ids": result
                    .settlement_entry_ids
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>(),
            }),
        )
        .await?;

        info!(
            management_id,
            unit_id,
            closed_due_count = result.closed_due_count,
            total_settled_minor = result.total_settled_minor,
            remaining_credit_minor = result.remaining_credit_minor,
            "unit settled from credit"
        );
        Ok(result)
    }
}
