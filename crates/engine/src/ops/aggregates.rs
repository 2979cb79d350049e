use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, PaginatorTrait, QueryFilter, QueryOrder, prelude::*, sea_query::Expr};

use crate::{
    DueAggregate, EngineError, EntryStatus, PaymentAggregate, ResultEngine, allocations,
    ledger_entries, recompute_due, recompute_payment,
};

use super::Engine;

/// Allocation to be written; `seq` is assigned at insert time.
pub(super) struct AllocationDraft<'a> {
    pub due: &'a ledger_entries::Model,
    pub payment: &'a ledger_entries::Model,
    pub settlement_entry_id: Option<&'a str>,
    pub amount_minor: i64,
    pub created_by: &'a str,
}

/// Allocations touched when an entry leaves the posted state.
#[derive(Debug, Default)]
pub(super) struct Detached {
    pub allocation_count: u32,
    pub allocation_minor: i64,
}

impl Engine {
    async fn posted_ids<C: ConnectionTrait>(
        &self,
        db: &C,
        ids: BTreeSet<String>,
    ) -> ResultEngine<HashSet<String>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let posted = ledger_entries::Entity::find()
            .filter(ledger_entries::Column::Id.is_in(ids))
            .filter(ledger_entries::Column::Status.eq(EntryStatus::Posted.as_str()))
            .all(db)
            .await?;
        Ok(posted.into_iter().map(|m| m.id).collect())
    }

    pub(super) async fn allocations_of_due<C: ConnectionTrait>(
        &self,
        db: &C,
        due_id: &str,
    ) -> ResultEngine<Vec<allocations::Model>> {
        allocations::Entity::find()
            .filter(allocations::Column::DueId.eq(due_id.to_string()))
            .order_by_asc(allocations::Column::CreatedAt)
            .order_by_asc(allocations::Column::Id)
            .all(db)
            .await
            .map_err(Into::into)
    }

    pub(super) async fn allocations_of_payment<C: ConnectionTrait>(
        &self,
        db: &C,
        payment_id: &str,
    ) -> ResultEngine<Vec<allocations::Model>> {
        allocations::Entity::find()
            .filter(allocations::Column::PaymentEntryId.eq(payment_id.to_string()))
            .order_by_asc(allocations::Column::CreatedAt)
            .order_by_asc(allocations::Column::Id)
            .all(db)
            .await
            .map_err(Into::into)
    }

    /// Replays a due from the allocations whose payment is still posted.
    pub(super) async fn replay_due<C: ConnectionTrait>(
        &self,
        db: &C,
        due: &ledger_entries::Model,
    ) -> ResultEngine<DueAggregate> {
        let rows = self.allocations_of_due(db, &due.id).await?;
        let posted = self
            .posted_ids(db, rows.iter().map(|a| a.payment_entry_id.clone()).collect())
            .await?;
        let active: Vec<i64> = rows
            .iter()
            .filter(|a| posted.contains(&a.payment_entry_id))
            .map(|a| a.amount_minor)
            .collect();
        recompute_due(due.amount_minor, due.is_posted(), &active)
    }

    /// Replays a payment from the allocations whose due is still posted.
    pub(super) async fn replay_payment<C: ConnectionTrait>(
        &self,
        db: &C,
        payment: &ledger_entries::Model,
    ) -> ResultEngine<PaymentAggregate> {
        let rows = self.allocations_of_payment(db, &payment.id).await?;
        let posted = self
            .posted_ids(db, rows.iter().map(|a| a.due_id.clone()).collect())
            .await?;
        let active: Vec<i64> = rows
            .iter()
            .filter(|a| posted.contains(&a.due_id))
            .map(|a| a.amount_minor)
            .collect();
        recompute_payment(payment.amount_minor, payment.is_posted(), &active)
    }

    /// Rewrites the `due_*` fields of `due` from replay.
    ///
    /// The write is a compare-and-swap on the revision carried by `due`; the
    /// returned model holds the bumped revision.
    pub(super) async fn sync_due<C: ConnectionTrait>(
        &self,
        db_tx: &C,
        due: &ledger_entries::Model,
        rebuilt_at: Option<DateTime<Utc>>,
    ) -> ResultEngine<ledger_entries::Model> {
        let aggregate = self.replay_due(db_tx, due).await?;
        let mut update = ledger_entries::Entity::update_many()
            .col_expr(
                ledger_entries::Column::DueTotalMinor,
                Expr::value(Some(aggregate.total_minor)),
            )
            .col_expr(
                ledger_entries::Column::DueAllocatedMinor,
                Expr::value(Some(aggregate.allocated_minor)),
            )
            .col_expr(
                ledger_entries::Column::DueOutstandingMinor,
                Expr::value(Some(aggregate.outstanding_minor)),
            )
            .col_expr(
                ledger_entries::Column::DueStatus,
                Expr::value(Some(aggregate.status.as_str().to_string())),
            )
            .col_expr(ledger_entries::Column::Revision, Expr::value(due.revision + 1));
        if let Some(at) = rebuilt_at {
            update = update.col_expr(
                ledger_entries::Column::AggregatesRebuiltAt,
                Expr::value(Some(at)),
            );
        }
        self.cas_entry(db_tx, due, update).await?;

        Ok(ledger_entries::Model {
            due_total_minor: Some(aggregate.total_minor),
            due_allocated_minor: Some(aggregate.allocated_minor),
            due_outstanding_minor: Some(aggregate.outstanding_minor),
            due_status: Some(aggregate.status.as_str().to_string()),
            aggregates_rebuilt_at: rebuilt_at.or(due.aggregates_rebuilt_at),
            revision: due.revision + 1,
            ..due.clone()
        })
    }

    /// Rewrites `applied`/`unapplied` of `payment` from replay (CAS on revision).
    pub(super) async fn sync_payment<C: ConnectionTrait>(
        &self,
        db_tx: &C,
        payment: &ledger_entries::Model,
    ) -> ResultEngine<ledger_entries::Model> {
        let aggregate = self.replay_payment(db_tx, payment).await?;
        let update = ledger_entries::Entity::update_many()
            .col_expr(
                ledger_entries::Column::AppliedMinor,
                Expr::value(Some(aggregate.applied_minor)),
            )
            .col_expr(
                ledger_entries::Column::UnappliedMinor,
                Expr::value(Some(aggregate.unapplied_minor)),
            )
            .col_expr(
                ledger_entries::Column::AllocationStatus,
                Expr::value(Some(aggregate.status.as_str().to_string())),
            )
            .col_expr(
                ledger_entries::Column::Revision,
                Expr::value(payment.revision + 1),
            );
        self.cas_entry(db_tx, payment, update).await?;

        Ok(ledger_entries::Model {
            applied_minor: Some(aggregate.applied_minor),
            unapplied_minor: Some(aggregate.unapplied_minor),
            allocation_status: Some(aggregate.status.as_str().to_string()),
            revision: payment.revision + 1,
            ..payment.clone()
        })
    }

    /// Executes `update` against `entry` only if its revision is unchanged.
    pub(super) async fn cas_entry<C: ConnectionTrait>(
        &self,
        db_tx: &C,
        entry: &ledger_entries::Model,
        update: sea_orm::UpdateMany<ledger_entries::Entity>,
    ) -> ResultEngine<()> {
        let result = update
            .filter(ledger_entries::Column::Id.eq(entry.id.clone()))
            .filter(ledger_entries::Column::Revision.eq(entry.revision))
            .exec(db_tx)
            .await?;
        if result.rows_affected != 1 {
            return Err(EngineError::TransactionConflict(format!(
                "entry {} moved past revision {}",
                entry.id, entry.revision
            )));
        }
        Ok(())
    }

    /// Inserts one allocation row. `seq` is the number of rows already
    /// recorded for the pair, so two writers racing on the same pair collide
    /// on the unique index.
    pub(super) async fn insert_allocation<C: ConnectionTrait>(
        &self,
        db_tx: &C,
        draft: AllocationDraft<'_>,
    ) -> ResultEngine<allocations::Model> {
        if draft.amount_minor <= 0 {
            return Err(EngineError::InvalidAmount(
                "allocation amount must be > 0".to_string(),
            ));
        }
        let prior = allocations::Entity::find()
            .filter(allocations::Column::DueId.eq(draft.due.id.clone()))
            .filter(allocations::Column::PaymentEntryId.eq(draft.payment.id.clone()))
            .count(db_tx)
            .await?;
        let seq = i32::try_from(prior)
            .map_err(|_| EngineError::InvalidEntry("too many allocations for pair".to_string()))?;

        allocations::ActiveModel::from(allocations::NewAllocation {
            management_id: &draft.due.management_id,
            unit_id: &draft.due.unit_id,
            due_id: &draft.due.id,
            payment_entry_id: &draft.payment.id,
            settlement_entry_id: draft.settlement_entry_id,
            amount_minor: draft.amount_minor,
            seq,
            created_at: self.now(),
            created_by: draft.created_by,
        })
        .insert(db_tx)
        .await
        .map_err(Into::into)
    }

    /// Recomputes every entry linked to `entry` through allocations after it
    /// left the posted state, and the entry itself.
    ///
    /// Reports the allocations that stopped counting.
    pub(super) async fn detach_entry<C: ConnectionTrait>(
        &self,
        db_tx: &C,
        entry: &ledger_entries::Model,
    ) -> ResultEngine<Detached> {
        let due_side = entry.is_due();
        if !due_side && !entry.is_payment() {
            return Ok(Detached::default());
        }
        let rows = if due_side {
            self.allocations_of_due(db_tx, &entry.id).await?
        } else {
            self.allocations_of_payment(db_tx, &entry.id).await?
        };
        let counterpart_of = |a: &allocations::Model| -> String {
            if due_side {
                a.payment_entry_id.clone()
            } else {
                a.due_id.clone()
            }
        };

        let counterpart_ids: BTreeSet<String> = rows.iter().map(counterpart_of).collect();
        let posted = self.posted_ids(db_tx, counterpart_ids.clone()).await?;

        let mut detached = Detached::default();
        for row in rows.iter().filter(|a| posted.contains(&counterpart_of(a))) {
            detached.allocation_count += 1;
            detached.allocation_minor += row.amount_minor;
        }

        if due_side {
            self.sync_due(db_tx, entry, None).await?;
        } else {
            self.sync_payment(db_tx, entry).await?;
        }

        for id in counterpart_ids.iter().filter(|id| posted.contains(*id)) {
            let counterpart = ledger_entries::Entity::find_by_id(id.clone())
                .one(db_tx)
                .await?
                .ok_or_else(|| EngineError::KeyNotFound("entry not exists".to_string()))?;
            if counterpart.is_due() {
                self.sync_due(db_tx, &counterpart, None).await?;
            } else {
                self.sync_payment(db_tx, &counterpart).await?;
            }
        }
        Ok(detached)
    }
}
