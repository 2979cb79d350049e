use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::{
    Actor, AllocationResult, EngineError, ResultEngine,
    audit_log::{AuditAction, AuditTargetType},
    unit_balances::BalanceDelta,
    util::{normalize_required_id, validate_positive_amount},
};

use super::{Engine, aggregates::AllocationDraft};

impl Engine {
    /// Allocates `amount_minor` of a payment's unapplied credit to one due.
    ///
    /// The amount is bounded by `min(due outstanding, payment unapplied)`;
    /// anything above fails with `AllocationExceedsCapacity` and writes
    /// nothing.
    pub async fn allocate_payment_to_due(
        &self,
        management_id: &str,
        payment_entry_id: Uuid,
        due_id: Uuid,
        amount_minor: i64,
        actor: &Actor,
    ) -> ResultEngine<AllocationResult> {
        let management_id = normalize_required_id(management_id, "management")?;
        validate_positive_amount(amount_minor)?;
        let (payment_id, due_id) = (payment_entry_id.to_string(), due_id.to_string());

        self.with_retry("allocate_payment_to_due", |engine, db_tx| {
            let (management_id, payment_id, due_id) =
                (management_id.clone(), payment_id.clone(), due_id.clone());
            let actor = actor.clone();
            let amount_minor = amount_minor;
            Box::pin(async move {
                let payment = engine
                    .require_posted_payment(db_tx, &management_id, &payment_id)
                    .await?;
                let due = engine
                    .require_posted_due(db_tx, &management_id, &due_id)
                    .await?;
                if payment.unit_id != due.unit_id {
                    return Err(EngineError::InvalidEntry(
                        "payment and due belong to different units".to_string(),
                    ));
                }

                let claim = engine
                    .claim_unit(db_tx, &management_id, &due.unit_id)
                    .await?;
                let capacity_minor = due.due_outstanding().min(payment.unapplied());
                if amount_minor > capacity_minor {
                    return Err(EngineError::AllocationExceedsCapacity {
                        requested_minor: amount_minor,
                        capacity_minor,
                    });
                }

                let allocation = engine
                    .insert_allocation(
                        db_tx,
                        AllocationDraft {
                            due: &due,
                            payment: &payment,
                            settlement_entry_id: None,
                            amount_minor,
                            created_by: &actor.uid,
                        },
                    )
                    .await?;
                engine.sync_due(db_tx, &due, None).await?;
                let payment = engine.sync_payment(db_tx, &payment).await?;
                engine
                    .apply_delta(db_tx, &claim, BalanceDelta::default())
                    .await?;

                engine
                    .record_audit(
                        db_tx,
                        AuditAction::CreateAllocation,
                        &actor,
                        &management_id,
                        AuditTargetType::Allocation,
                        &allocation.id,
                        json!({
                            "unit_id": due.unit_id,
                            "due_id": due.id,
                            "payment_entry_id": payment.id,
                            "amount_minor": amount_minor,
                        }),
                    )
                    .await?;

                info!(
                    management_id,
                    due_id = due.id,
                    payment_id = payment.id,
                    amount_minor,
                    "allocation created"
                );
                Ok(AllocationResult {
                    applied_minor: payment.applied_minor.unwrap_or(0),
                    unapplied_minor: payment.unapplied(),
                })
            })
        })
        .await
    }
}
