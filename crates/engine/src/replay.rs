//! Replay of derived due/payment fields from allocations.
//!
//! The convenience fields cached on ledger entries (`due_*` on dues,
//! `applied`/`unapplied` on payments) are write-through projections of the
//! functions in this module. Nothing else computes them.
//!
//! An allocation only counts while both its due and its payment are posted;
//! callers pass the amounts of those *active* allocations.

use serde::{Deserialize, Serialize};

use crate::{EngineError, ResultEngine};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DueStatus {
    Open,
    Paid,
    /// The due itself was voided or reversed.
    Cancelled,
}

impl DueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
        }
    }
}

impl TryFrom<&str> for DueStatus {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "open" => Ok(Self::Open),
            "paid" => Ok(Self::Paid),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(EngineError::InvalidEntry(format!(
                "invalid due status: {other}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Unapplied,
    Partial,
    Applied,
    /// The payment itself was voided or reversed.
    Cancelled,
}

impl AllocationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unapplied => "unapplied",
            Self::Partial => "partial",
            Self::Applied => "applied",
            Self::Cancelled => "cancelled",
        }
    }
}

impl TryFrom<&str> for AllocationStatus {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "unapplied" => Ok(Self::Unapplied),
            "partial" => Ok(Self::Partial),
            "applied" => Ok(Self::Applied),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(EngineError::InvalidEntry(format!(
                "invalid allocation status: {other}"
            ))),
        }
    }
}

/// Derived state of a due.
///
/// Invariant: `allocated_minor + outstanding_minor == total_minor`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DueAggregate {
    pub total_minor: i64,
    pub allocated_minor: i64,
    pub outstanding_minor: i64,
    pub status: DueStatus,
}

/// Derived state of a payment.
///
/// Invariant for posted payments: `applied_minor + unapplied_minor ==
/// amount_minor`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAggregate {
    pub applied_minor: i64,
    pub unapplied_minor: i64,
    pub status: AllocationStatus,
}

fn sum_active(active_allocations: &[i64]) -> ResultEngine<i64> {
    active_allocations.iter().try_fold(0i64, |acc, amount| {
        if *amount <= 0 {
            return Err(EngineError::InvalidAmount(
                "allocation amount must be > 0".to_string(),
            ));
        }
        acc.checked_add(*amount)
            .ok_or_else(|| EngineError::InvalidAmount("allocation sum overflow".to_string()))
    })
}

/// Recomputes a due from its active allocations.
///
/// A due that is no longer posted is zeroed. Over-allocation is reported as
/// an error: it can only come from corrupted history.
pub fn recompute_due(
    amount_minor: i64,
    posted: bool,
    active_allocations: &[i64],
) -> ResultEngine<DueAggregate> {
    if !posted {
        return Ok(DueAggregate {
            total_minor: 0,
            allocated_minor: 0,
            outstanding_minor: 0,
            status: DueStatus::Cancelled,
        });
    }

    let allocated = sum_active(active_allocations)?;
    if allocated > amount_minor {
        return Err(EngineError::InvalidEntry(format!(
            "due over-allocated: {allocated} > {amount_minor}"
        )));
    }
    let outstanding = amount_minor - allocated;
    Ok(DueAggregate {
        total_minor: amount_minor,
        allocated_minor: allocated,
        outstanding_minor: outstanding,
        status: if outstanding == 0 {
            DueStatus::Paid
        } else {
            DueStatus::Open
        },
    })
}

/// Recomputes a payment from its active allocations.
pub fn recompute_payment(
    amount_minor: i64,
    posted: bool,
    active_allocations: &[i64],
) -> ResultEngine<PaymentAggregate> {
    if !posted {
        return Ok(PaymentAggregate {
            applied_minor: 0,
            unapplied_minor: 0,
            status: AllocationStatus::Cancelled,
        });
    }

    let applied = sum_active(active_allocations)?;
    if applied > amount_minor {
        return Err(EngineError::InvalidEntry(format!(
            "payment over-applied: {applied} > {amount_minor}"
        )));
    }
    let status = match applied {
        0 => AllocationStatus::Unapplied,
        a if a == amount_minor => AllocationStatus::Applied,
        _ => AllocationStatus::Partial,
    };
    Ok(PaymentAggregate {
        applied_minor: applied,
        unapplied_minor: amount_minor - applied,
        status,
    })
}
