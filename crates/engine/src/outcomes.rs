//! Results returned by engine operations.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{DueStatus, EntryStatus};

/// Result of `create_debit`/`create_credit`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingResult {
    pub entry_id: Uuid,
    /// `false` when an idempotency key replayed an earlier posting.
    pub created: bool,
    pub applied_minor: Option<i64>,
    pub unapplied_minor: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub applied_minor: i64,
    pub unapplied_minor: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementResult {
    pub closed_due_count: u32,
    pub total_settled_minor: i64,
    pub remaining_credit_minor: i64,
    pub settlement_entry_ids: Vec<Uuid>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoidResult {
    pub ok: bool,
    pub status: EntryStatus,
    pub noop: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversalResult {
    pub ok: bool,
    pub reversal_entry_id: Uuid,
    pub reversed_allocation_count: u32,
    pub reversed_allocation_minor: i64,
    pub noop: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildResult {
    pub balance_minor: i64,
    pub posted_debit_minor: i64,
    pub posted_credit_minor: i64,
    pub entry_count: i64,
    pub alerts_resolved: u32,
    pub noop: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDriftReport {
    pub drifted: bool,
    /// `None` when the unit has no cache row.
    pub cached_minor: Option<i64>,
    pub canonical_minor: i64,
    pub diff_minor: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DueDriftReport {
    pub drifted: bool,
    /// Dues replayed in this check.
    pub checked: u32,
    pub due_ids: Vec<Uuid>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DueRebuildResult {
    pub due_allocated_minor: i64,
    pub due_outstanding_minor: i64,
    pub due_status: DueStatus,
    pub noop: bool,
    pub alerts_resolved: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub units_checked: u32,
    pub drifted_units: Vec<String>,
    pub dues_checked: u32,
    pub drifted_dues: Vec<Uuid>,
    pub rebuilt_units: u32,
    pub rebuilt_dues: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyDuesResult {
    pub period: String,
    pub created: u32,
    pub skipped: u32,
    /// `true` when the run marker already existed.
    pub already_ran: bool,
}
