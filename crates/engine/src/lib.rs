//! Ledger and settlement engine for per-unit dues and payments.
//!
//! The ledger is the only source of truth: unit balances, due and payment
//! aggregates are caches that can always be rebuilt from posted entries and
//! allocations. Every mutating call runs in one database transaction that
//! also updates those caches and appends an audit record.

pub use alerts::{Alert, AlertStatus, AlertType, REBUILD_AUTO_RESOLVE};
pub use allocations::DueAllocation;
pub use audit_log::{AuditAction, AuditLogEntry, AuditTargetType};
pub use clock::{Clock, ManualClock, SystemClock};
pub use commands::{Actor, PostEntryCmd};
pub use config::EngineConfig;
pub use error::{EngineError, ErrorKind};
pub use ledger_entries::{EntrySource, EntryStatus, EntryType, LedgerEntry};
pub use money::MinorAmount;
pub use ops::{Engine, EngineBuilder};
pub use outcomes::{
    AllocationResult, BalanceDriftReport, DueDriftReport, DueRebuildResult, MonthlyDuesResult,
    PostingResult, RebuildResult, ReversalResult, SettlementResult, SweepReport, VoidResult,
};
pub use replay::{
    AllocationStatus, DueAggregate, DueStatus, PaymentAggregate, recompute_due, recompute_payment,
};
pub use unit_balances::{CanonicalBalance, UnitBalance};
pub use units::Unit;

mod alerts;
mod allocations;
mod audit_log;
mod clock;
mod commands;
mod config;
mod error;
mod idempotency_keys;
mod ledger_entries;
mod money;
mod ops;
mod outcomes;
mod plan;
mod replay;
mod unit_balances;
mod units;
mod util;

type ResultEngine<T> = Result<T, EngineError>;
