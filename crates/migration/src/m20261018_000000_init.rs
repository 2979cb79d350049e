//! Initial schema migration for the dues ledger.
//!
//! - `units`: units registered per management
//! - `ledger_entries`: immutable-once-posted debits and credits
//! - `due_allocations`: how payment credit satisfies dues
//! - `unit_balances`: per-unit balance cache (re-derivable)
//! - `alerts`: drift diagnostics
//! - `audit_log`: one row per mutating action
//! - `idempotency_keys`: processed client keys and run markers

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

// ─────────────────────────────────────────────────────────────────────────────
// Table identifiers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Iden)]
enum Units {
    Table,
    ManagementId,
    UnitId,
    Label,
    CreatedAt,
}

#[derive(Iden)]
enum LedgerEntries {
    Table,
    Id,
    ManagementId,
    UnitId,
    EntryType,
    AmountMinor,
    Status,
    Source,
    AffectsBalance,
    RelatedDueId,
    Description,
    Metadata,
    CreatedAt,
    CreatedBy,
    VoidedAt,
    VoidedBy,
    VoidReason,
    ReversedAt,
    ReversedBy,
    ReversalReason,
    ReversalOf,
    ReversalEntryId,
    DueTotalMinor,
    DueAllocatedMinor,
    DueOutstandingMinor,
    DueStatus,
    AggregatesRebuiltAt,
    AppliedMinor,
    UnappliedMinor,
    AllocationStatus,
    Revision,
}

#[derive(Iden)]
enum DueAllocations {
    Table,
    Id,
    ManagementId,
    UnitId,
    DueId,
    PaymentEntryId,
    SettlementEntryId,
    AmountMinor,
    Seq,
    CreatedAt,
    CreatedBy,
}

#[derive(Iden)]
enum UnitBalances {
    Table,
    ManagementId,
    UnitId,
    PostedDebitMinor,
    PostedCreditMinor,
    BalanceMinor,
    EntryCount,
    Version,
    UpdatedAt,
    RebuiltAt,
    RebuiltBy,
}

#[derive(Iden)]
enum Alerts {
    Table,
    Id,
    ManagementId,
    UnitId,
    AlertType,
    TargetId,
    Status,
    CachedMinor,
    CanonicalMinor,
    DiffMinor,
    CreatedAt,
    ResolvedAt,
    ResolvedReason,
}

#[derive(Iden)]
enum AuditLog {
    Table,
    Id,
    ManagementId,
    Action,
    ActorUid,
    TargetId,
    TargetType,
    At,
    Metadata,
}

#[derive(Iden)]
enum IdempotencyKeys {
    Table,
    ManagementId,
    Key,
    Operation,
    Fingerprint,
    ResultId,
    CreatedAt,
}

// ─────────────────────────────────────────────────────────────────────────────
// Migration implementation
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ───────────────────────────────────────────────────────────────────
        // 1. Units
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(Units::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Units::ManagementId).string().not_null())
                    .col(ColumnDef::new(Units::UnitId).string().not_null())
                    .col(ColumnDef::new(Units::Label).string())
                    .col(ColumnDef::new(Units::CreatedAt).timestamp().not_null())
                    .primary_key(
                        Index::create()
                            .col(Units::ManagementId)
                            .col(Units::UnitId),
                    )
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 2. Ledger entries
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(LedgerEntries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LedgerEntries::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(LedgerEntries::ManagementId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(LedgerEntries::UnitId).string().not_null())
                    .col(ColumnDef::new(LedgerEntries::EntryType).string().not_null())
                    .col(
                        ColumnDef::new(LedgerEntries::AmountMinor)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(LedgerEntries::Status).string().not_null())
                    .col(ColumnDef::new(LedgerEntries::Source).string().not_null())
                    .col(
                        ColumnDef::new(LedgerEntries::AffectsBalance)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(LedgerEntries::RelatedDueId).string())
                    .col(ColumnDef::new(LedgerEntries::Description).string())
                    .col(ColumnDef::new(LedgerEntries::Metadata).text())
                    .col(
                        ColumnDef::new(LedgerEntries::CreatedAt)
                            .timestamp()
                            .not_null(),
                    )
                    .col(ColumnDef::new(LedgerEntries::CreatedBy).string().not_null())
                    .col(ColumnDef::new(LedgerEntries::VoidedAt).timestamp())
                    .col(ColumnDef::new(LedgerEntries::VoidedBy).string())
                    .col(ColumnDef::new(LedgerEntries::VoidReason).string())
                    .col(ColumnDef::new(LedgerEntries::ReversedAt).timestamp())
                    .col(ColumnDef::new(LedgerEntries::ReversedBy).string())
                    .col(ColumnDef::new(LedgerEntries::ReversalReason).string())
                    .col(ColumnDef::new(LedgerEntries::ReversalOf).string())
                    .col(ColumnDef::new(LedgerEntries::ReversalEntryId).string())
                    .col(ColumnDef::new(LedgerEntries::DueTotalMinor).big_integer())
                    .col(ColumnDef::new(LedgerEntries::DueAllocatedMinor).big_integer())
                    .col(ColumnDef::new(LedgerEntries::DueOutstandingMinor).big_integer())
                    .col(ColumnDef::new(LedgerEntries::DueStatus).string())
                    .col(ColumnDef::new(LedgerEntries::AggregatesRebuiltAt).timestamp())
                    .col(ColumnDef::new(LedgerEntries::AppliedMinor).big_integer())
                    .col(ColumnDef::new(LedgerEntries::UnappliedMinor).big_integer())
                    .col(ColumnDef::new(LedgerEntries::AllocationStatus).string())
                    .col(
                        ColumnDef::new(LedgerEntries::Revision)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-ledger_entries-unit-created_at")
                    .table(LedgerEntries::Table)
                    .col(LedgerEntries::ManagementId)
                    .col(LedgerEntries::UnitId)
                    .col(LedgerEntries::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-ledger_entries-unit-status")
                    .table(LedgerEntries::Table)
                    .col(LedgerEntries::ManagementId)
                    .col(LedgerEntries::UnitId)
                    .col(LedgerEntries::Status)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 3. Due allocations
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(DueAllocations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DueAllocations::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(DueAllocations::ManagementId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(DueAllocations::UnitId).string().not_null())
                    .col(ColumnDef::new(DueAllocations::DueId).string().not_null())
                    .col(
                        ColumnDef::new(DueAllocations::PaymentEntryId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(DueAllocations::SettlementEntryId).string())
                    .col(
                        ColumnDef::new(DueAllocations::AmountMinor)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(DueAllocations::Seq).integer().not_null())
                    .col(
                        ColumnDef::new(DueAllocations::CreatedAt)
                            .timestamp()
                            .not_null(),
                    )
                    .col(ColumnDef::new(DueAllocations::CreatedBy).string().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-due_allocations-due_id")
                            .from(DueAllocations::Table, DueAllocations::DueId)
                            .to(LedgerEntries::Table, LedgerEntries::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-due_allocations-payment_entry_id")
                            .from(DueAllocations::Table, DueAllocations::PaymentEntryId)
                            .to(LedgerEntries::Table, LedgerEntries::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uidx-due_allocations-due_id-payment_entry_id-seq")
                    .table(DueAllocations::Table)
                    .col(DueAllocations::DueId)
                    .col(DueAllocations::PaymentEntryId)
                    .col(DueAllocations::Seq)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-due_allocations-payment_entry_id")
                    .table(DueAllocations::Table)
                    .col(DueAllocations::PaymentEntryId)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 4. Unit balances
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(UnitBalances::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UnitBalances::ManagementId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(UnitBalances::UnitId).string().not_null())
                    .col(
                        ColumnDef::new(UnitBalances::PostedDebitMinor)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UnitBalances::PostedCreditMinor)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UnitBalances::BalanceMinor)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UnitBalances::EntryCount)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(UnitBalances::Version).big_integer().not_null())
                    .col(ColumnDef::new(UnitBalances::UpdatedAt).timestamp().not_null())
                    .col(ColumnDef::new(UnitBalances::RebuiltAt).timestamp())
                    .col(ColumnDef::new(UnitBalances::RebuiltBy).string())
                    .primary_key(
                        Index::create()
                            .col(UnitBalances::ManagementId)
                            .col(UnitBalances::UnitId),
                    )
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 5. Alerts
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(Alerts::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Alerts::Id).string().not_null().primary_key())
                    .col(ColumnDef::new(Alerts::ManagementId).string().not_null())
                    .col(ColumnDef::new(Alerts::UnitId).string().not_null())
                    .col(ColumnDef::new(Alerts::AlertType).string().not_null())
                    .col(ColumnDef::new(Alerts::TargetId).string().not_null())
                    .col(ColumnDef::new(Alerts::Status).string().not_null())
                    .col(ColumnDef::new(Alerts::CachedMinor).big_integer().not_null())
                    .col(
                        ColumnDef::new(Alerts::CanonicalMinor)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Alerts::DiffMinor).big_integer().not_null())
                    .col(ColumnDef::new(Alerts::CreatedAt).timestamp().not_null())
                    .col(ColumnDef::new(Alerts::ResolvedAt).timestamp())
                    .col(ColumnDef::new(Alerts::ResolvedReason).string())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-alerts-target-status")
                    .table(Alerts::Table)
                    .col(Alerts::ManagementId)
                    .col(Alerts::AlertType)
                    .col(Alerts::TargetId)
                    .col(Alerts::Status)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 6. Audit log
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(AuditLog::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(AuditLog::Id).string().not_null().primary_key())
                    .col(ColumnDef::new(AuditLog::ManagementId).string().not_null())
                    .col(ColumnDef::new(AuditLog::Action).string().not_null())
                    .col(ColumnDef::new(AuditLog::ActorUid).string().not_null())
                    .col(ColumnDef::new(AuditLog::TargetId).string().not_null())
                    .col(ColumnDef::new(AuditLog::TargetType).string().not_null())
                    .col(ColumnDef::new(AuditLog::At).timestamp().not_null())
                    .col(ColumnDef::new(AuditLog::Metadata).text().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-audit_log-management_id-target_id")
                    .table(AuditLog::Table)
                    .col(AuditLog::ManagementId)
                    .col(AuditLog::TargetId)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 7. Idempotency keys
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(IdempotencyKeys::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(IdempotencyKeys::ManagementId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(IdempotencyKeys::Key).string().not_null())
                    .col(ColumnDef::new(IdempotencyKeys::Operation).string().not_null())
                    .col(ColumnDef::new(IdempotencyKeys::Fingerprint).text().not_null())
                    .col(ColumnDef::new(IdempotencyKeys::ResultId).string().not_null())
                    .col(
                        ColumnDef::new(IdempotencyKeys::CreatedAt)
                            .timestamp()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(IdempotencyKeys::ManagementId)
                            .col(IdempotencyKeys::Key),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Drop in reverse order of creation (respecting FK dependencies)
        manager
            .drop_table(Table::drop().table(IdempotencyKeys::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AuditLog::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Alerts::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(UnitBalances::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(DueAllocations::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(LedgerEntries::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Units::Table).to_owned())
            .await?;
        Ok(())
    }
}
