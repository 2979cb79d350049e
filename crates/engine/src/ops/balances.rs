use sea_orm::{ActiveValue, ConnectionTrait, QueryFilter, prelude::*, sea_query::Expr};
use tracing::debug;

use crate::{
    CanonicalBalance, EngineError, EntryStatus, EntryType, ResultEngine, UnitBalance,
    ledger_entries,
    unit_balances::{self, BalanceDelta},
};

use super::Engine;

impl Engine {
    /// Sums the posted, balance-affecting entries of a unit.
    pub(super) async fn canonical_balance<C: ConnectionTrait>(
        &self,
        db: &C,
        management_id: &str,
        unit_id: &str,
    ) -> ResultEngine<CanonicalBalance> {
        let posted: Vec<ledger_entries::Model> = ledger_entries::Entity::find()
            .filter(ledger_entries::Column::ManagementId.eq(management_id.to_string()))
            .filter(ledger_entries::Column::UnitId.eq(unit_id.to_string()))
            .filter(ledger_entries::Column::Status.eq(EntryStatus::Posted.as_str()))
            .filter(ledger_entries::Column::AffectsBalance.eq(true))
            .all(db)
            .await?;

        CanonicalBalance::from_posted(posted.iter().map(|entry| {
            (
                entry.entry_type == EntryType::Debit.as_str(),
                entry.amount_minor,
            )
        }))
    }

    /// Loads the cache row of a unit, creating it from the canonical sums when
    /// missing. The returned `version` is the one later writes must match.
    pub(super) async fn claim_unit<C: ConnectionTrait>(
        &self,
        db_tx: &C,
        management_id: &str,
        unit_id: &str,
    ) -> ResultEngine<unit_balances::Model> {
        let existing =
            unit_balances::Entity::find_by_id((management_id.to_string(), unit_id.to_string()))
                .one(db_tx)
                .await?;
        if let Some(model) = existing {
            return Ok(model);
        }

        let canonical = self
            .canonical_balance(db_tx, management_id, unit_id)
            .await?;
        debug!(management_id, unit_id, "initializing unit balance cache");
        unit_balances::ActiveModel {
            management_id: ActiveValue::Set(management_id.to_string()),
            unit_id: ActiveValue::Set(unit_id.to_string()),
            posted_debit_minor: ActiveValue::Set(canonical.posted_debit_minor),
            posted_credit_minor: ActiveValue::Set(canonical.posted_credit_minor),
            balance_minor: ActiveValue::Set(canonical.balance_minor),
            entry_count: ActiveValue::Set(canonical.entry_count),
            version: ActiveValue::Set(0),
            updated_at: ActiveValue::Set(self.now()),
            rebuilt_at: ActiveValue::Set(None),
            rebuilt_by: ActiveValue::Set(None),
        }
        .insert(db_tx)
        .await
        .map_err(Into::into)
    }

    /// Writes `next` over the claimed row, bumping `version`.
    ///
    /// Fails with `TransactionConflict` when another writer moved the version
    /// since the claim.
    pub(super) async fn commit_balance<C: ConnectionTrait>(
        &self,
        db_tx: &C,
        claim: &unit_balances::Model,
        next: CanonicalBalance,
        rebuilt_by: Option<&str>,
    ) -> ResultEngine<unit_balances::Model> {
        let now = self.now();
        let mut update = unit_balances::Entity::update_many()
            .col_expr(
                unit_balances::Column::PostedDebitMinor,
                Expr::value(next.posted_debit_minor),
            )
            .col_expr(
                unit_balances::Column::PostedCreditMinor,
                Expr::value(next.posted_credit_minor),
            )
            .col_expr(
                unit_balances::Column::BalanceMinor,
                Expr::value(next.balance_minor),
            )
            .col_expr(
                unit_balances::Column::EntryCount,
                Expr::value(next.entry_count),
            )
            .col_expr(unit_balances::Column::Version, Expr::value(claim.version + 1))
            .col_expr(unit_balances::Column::UpdatedAt, Expr::value(now));
        if let Some(actor_uid) = rebuilt_by {
            update = update
                .col_expr(unit_balances::Column::RebuiltAt, Expr::value(Some(now)))
                .col_expr(
                    unit_balances::Column::RebuiltBy,
                    Expr::value(Some(actor_uid.to_string())),
                );
        }

        let result = update
            .filter(unit_balances::Column::ManagementId.eq(claim.management_id.clone()))
            .filter(unit_balances::Column::UnitId.eq(claim.unit_id.clone()))
            .filter(unit_balances::Column::Version.eq(claim.version))
            .exec(db_tx)
            .await?;
        if result.rows_affected != 1 {
            return Err(EngineError::TransactionConflict(format!(
                "unit balance {} moved past version {}",
                claim.unit_id, claim.version
            )));
        }

        Ok(unit_balances::Model {
            posted_debit_minor: next.posted_debit_minor,
            posted_credit_minor: next.posted_credit_minor,
            balance_minor: next.balance_minor,
            entry_count: next.entry_count,
            version: claim.version + 1,
            updated_at: now,
            rebuilt_at: rebuilt_by.map(|_| now).or(claim.rebuilt_at),
            rebuilt_by: rebuilt_by.map(ToString::to_string).or(claim.rebuilt_by.clone()),
            ..claim.clone()
        })
    }

    /// Applies a posting delta to the claimed cache row.
    ///
    /// A zero delta still bumps `version`, which is how unit-scoped writers
    /// that do not move the balance serialize against each other.
    pub(super) async fn apply_delta<C: ConnectionTrait>(
        &self,
        db_tx: &C,
        claim: &unit_balances::Model,
        delta: BalanceDelta,
    ) -> ResultEngine<unit_balances::Model> {
        let next = CanonicalBalance::from(claim).with_delta(delta)?;
        self.commit_balance(db_tx, claim, next, None).await
    }

    /// Recomputes the canonical balance of a unit straight from the ledger.
    pub async fn compute_canonical(
        &self,
        management_id: &str,
        unit_id: &str,
    ) -> ResultEngine<CanonicalBalance> {
        self.require_unit(&self.database, management_id, unit_id)
            .await?;
        self.canonical_balance(&self.database, management_id, unit_id)
            .await
    }

    /// Returns the cached balance of a unit, `None` if no cache row exists yet.
    pub async fn unit_balance(
        &self,
        management_id: &str,
        unit_id: &str,
    ) -> ResultEngine<Option<UnitBalance>> {
        self.require_unit(&self.database, management_id, unit_id)
            .await?;
        let model =
            unit_balances::Entity::find_by_id((management_id.to_string(), unit_id.to_string()))
                .one(&self.database)
                .await?;
        Ok(model.map(UnitBalance::from))
    }
}
