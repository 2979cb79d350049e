//! Per-unit balance cache.
//!
//! The cache is a pure optimization: it can be deleted at any time and is
//! rebuilt from the posted, balance-affecting ledger entries of the unit.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{EngineError, ResultEngine};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitBalance {
    pub management_id: String,
    pub unit_id: String,
    /// `posted_credit_minor - posted_debit_minor`.
    pub balance_minor: i64,
    pub posted_debit_minor: i64,
    pub posted_credit_minor: i64,
    pub entry_count: i64,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    pub rebuilt_at: Option<DateTime<Utc>>,
    pub rebuilt_by: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "unit_balances")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub management_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub unit_id: String,
    pub posted_debit_minor: i64,
    pub posted_credit_minor: i64,
    pub balance_minor: i64,
    pub entry_count: i64,
    pub version: i64,
    pub updated_at: DateTimeUtc,
    pub rebuilt_at: Option<DateTimeUtc>,
    pub rebuilt_by: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for UnitBalance {
    fn from(model: Model) -> Self {
        Self {
            management_id: model.management_id,
            unit_id: model.unit_id,
            balance_minor: model.balance_minor,
            posted_debit_minor: model.posted_debit_minor,
            posted_credit_minor: model.posted_credit_minor,
            entry_count: model.entry_count,
            version: model.version,
            updated_at: model.updated_at,
            rebuilt_at: model.rebuilt_at,
            rebuilt_by: model.rebuilt_by,
        }
    }
}

/// Canonical sums recomputed straight from the ledger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalBalance {
    pub balance_minor: i64,
    pub posted_debit_minor: i64,
    pub posted_credit_minor: i64,
    pub entry_count: i64,
}

impl CanonicalBalance {
    pub(crate) fn with_delta(self, delta: BalanceDelta) -> ResultEngine<Self> {
        let overflow = || EngineError::InvalidAmount("unit balance overflow".to_string());
        let posted_debit_minor = self
            .posted_debit_minor
            .checked_add(delta.debit_minor)
            .ok_or_else(overflow)?;
        let posted_credit_minor = self
            .posted_credit_minor
            .checked_add(delta.credit_minor)
            .ok_or_else(overflow)?;
        Ok(Self {
            balance_minor: posted_credit_minor
                .checked_sub(posted_debit_minor)
                .ok_or_else(overflow)?,
            posted_debit_minor,
            posted_credit_minor,
            entry_count: self.entry_count + delta.entry_count,
        })
    }

    /// Sums posted entries given as `(is_debit, amount_minor)` pairs.
    pub(crate) fn from_posted<I>(entries: I) -> ResultEngine<Self>
    where
        I: IntoIterator<Item = (bool, i64)>,
    {
        entries
            .into_iter()
            .try_fold(Self::default(), |acc, (is_debit, amount_minor)| {
                let delta = if is_debit {
                    BalanceDelta {
                        debit_minor: amount_minor,
                        credit_minor: 0,
                        entry_count: 1,
                    }
                } else {
                    BalanceDelta {
                        debit_minor: 0,
                        credit_minor: amount_minor,
                        entry_count: 1,
                    }
                };
                acc.with_delta(delta)
            })
    }
}

impl From<&Model> for CanonicalBalance {
    fn from(model: &Model) -> Self {
        Self {
            balance_minor: model.balance_minor,
            posted_debit_minor: model.posted_debit_minor,
            posted_credit_minor: model.posted_credit_minor,
            entry_count: model.entry_count,
        }
    }
}

/// Signed change applied to the cache when entries enter or leave the posted
/// state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct BalanceDelta {
    pub debit_minor: i64,
    pub credit_minor: i64,
    pub entry_count: i64,
}

impl BalanceDelta {
    pub(crate) fn post(entry: &super::ledger_entries::Model) -> Self {
        Self::of(entry, 1)
    }

    pub(crate) fn unpost(entry: &super::ledger_entries::Model) -> Self {
        Self::of(entry, -1)
    }

    fn of(entry: &super::ledger_entries::Model, sign: i64) -> Self {
        if !entry.affects_balance {
            return Self::default();
        }
        let amount = entry.amount_minor * sign;
        if entry.entry_type == crate::EntryType::Debit.as_str() {
            Self {
                debit_minor: amount,
                credit_minor: 0,
                entry_count: sign,
            }
        } else {
            Self {
                debit_minor: 0,
                credit_minor: amount,
                entry_count: sign,
            }
        }
    }
}
