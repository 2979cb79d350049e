//! The module contains the errors the engine can return.
//!
//! Every variant maps to a stable, machine-readable [`ErrorKind`] so callers
//! (transport layers, the admin CLI) can branch on the failure class without
//! parsing messages:
//!
//! - [`InvalidAmount`], [`KeyNotFound`], [`InvalidEntry`], [`InvalidCursor`]
//!   and [`InvalidId`] are validation errors.
//! - [`IdempotencyKeyConflict`] is returned when a key is reused with a
//!   different payload.
//! - [`AllocationExceedsCapacity`] is returned by manual allocation.
//! - [`TransactionConflict`] is retried internally and only surfaces once the
//!   retry budget is exhausted.
//!
//!  [`InvalidAmount`]: EngineError::InvalidAmount
//!  [`KeyNotFound`]: EngineError::KeyNotFound
//!  [`InvalidEntry`]: EngineError::InvalidEntry
//!  [`InvalidCursor`]: EngineError::InvalidCursor
//!  [`InvalidId`]: EngineError::InvalidId
//!  [`IdempotencyKeyConflict`]: EngineError::IdempotencyKeyConflict
//!  [`AllocationExceedsCapacity`]: EngineError::AllocationExceedsCapacity
//!  [`TransactionConflict`]: EngineError::TransactionConflict
use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

/// Engine custom errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("\"{0}\" key not found!")]
    KeyNotFound(String),
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("Invalid id: {0}")]
    InvalidId(String),
    #[error("Idempotency key conflict: {0}")]
    IdempotencyKeyConflict(String),
    #[error("Allocation exceeds capacity: requested {requested_minor}, capacity {capacity_minor}")]
    AllocationExceedsCapacity {
        requested_minor: i64,
        capacity_minor: i64,
    },
    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),
    #[error("Rebuild throttled: {0}")]
    RebuildThrottled(String),
    #[error("Invalid audit record: {0}")]
    InvalidAuditRecord(String),
    #[error(transparent)]
    Database(#[from] DbErr),
}

/// Stable error classes exposed to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    IdempotencyKeyConflict,
    AllocationExceedsCapacity,
    TransactionConflict,
    RebuildThrottled,
    ContractViolation,
    Database,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::IdempotencyKeyConflict => "idempotency_key_conflict",
            Self::AllocationExceedsCapacity => "allocation_exceeds_capacity",
            Self::TransactionConflict => "transaction_conflict",
            Self::RebuildThrottled => "rebuild_throttled",
            Self::ContractViolation => "contract_violation",
            Self::Database => "database",
        }
    }
}

impl EngineError {
    /// Machine-readable class of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAmount(_)
            | Self::KeyNotFound(_)
            | Self::InvalidEntry(_)
            | Self::InvalidCursor(_)
            | Self::InvalidId(_) => ErrorKind::Validation,
            Self::IdempotencyKeyConflict(_) => ErrorKind::IdempotencyKeyConflict,
            Self::AllocationExceedsCapacity { .. } => ErrorKind::AllocationExceedsCapacity,
            Self::TransactionConflict(_) => ErrorKind::TransactionConflict,
            Self::RebuildThrottled(_) => ErrorKind::RebuildThrottled,
            Self::InvalidAuditRecord(_) => ErrorKind::ContractViolation,
            Self::Database(err) if is_contention(err) => ErrorKind::TransactionConflict,
            Self::Database(_) => ErrorKind::Database,
        }
    }

    /// Returns `true` when retrying the whole transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransactionConflict
    }
}

/// Tables whose unique keys concurrent writers can race for.
const RACE_TABLES: [&str; 4] = ["due_allocations", "idempotency_keys", "unit_balances", "units"];

/// SQLite reports writer contention as `SQLITE_BUSY`/`SQLITE_LOCKED`; a lost
/// race on a unique key surfaces as a constraint violation.
fn is_contention(err: &DbErr) -> bool {
    if let Some(SqlErr::UniqueConstraintViolation(detail)) = err.sql_err() {
        return is_race_key(&detail);
    }
    let message = err.to_string().to_ascii_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
}

/// Parses `UNIQUE constraint failed: table.col, table.col`.
fn is_race_key(detail: &str) -> bool {
    let columns = detail
        .rsplit_once("failed: ")
        .map_or(detail, |(_, columns)| columns);
    columns.split(", ").all(|column| {
        column
            .split_once('.')
            .is_some_and(|(table, _)| RACE_TABLES.contains(&table.trim()))
    })
}

impl PartialEq for EngineError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidAmount(a), Self::InvalidAmount(b)) => a == b,
            (Self::KeyNotFound(a), Self::KeyNotFound(b)) => a == b,
            (Self::InvalidEntry(a), Self::InvalidEntry(b)) => a == b,
            (Self::InvalidCursor(a), Self::InvalidCursor(b)) => a == b,
            (Self::InvalidId(a), Self::InvalidId(b)) => a == b,
            (Self::IdempotencyKeyConflict(a), Self::IdempotencyKeyConflict(b)) => a == b,
            (
                Self::AllocationExceedsCapacity {
                    requested_minor: ra,
                    capacity_minor: ca,
                },
                Self::AllocationExceedsCapacity {
                    requested_minor: rb,
                    capacity_minor: cb,
                },
            ) => ra == rb && ca == cb,
            (Self::TransactionConflict(a), Self::TransactionConflict(b)) => a == b,
            (Self::RebuildThrottled(a), Self::RebuildThrottled(b)) => a == b,
            (Self::InvalidAuditRecord(a), Self::InvalidAuditRecord(b)) => a == b,
            (Self::Database(a), Self::Database(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}
