mod common;

use common::*;
use engine::{
    AuditAction, DueStatus, EngineError, EntrySource, ErrorKind, AllocationStatus, PostEntryCmd,
};
use serde_json::json;

#[tokio::test]
async fn register_unit_is_idempotent() {
    let (engine, _db) = engine_with_db().await;
    assert!(
        engine
            .register_unit(MGMT, "A-1", None, &manager())
            .await
            .unwrap()
    );
    assert!(
        !engine
            .register_unit(MGMT, " A-1 ", Some("again"), &manager())
            .await
            .unwrap()
    );

    let units = engine.list_units(MGMT).await.unwrap();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].unit_id, "A-1");
    assert!(engine.list_units("other").await.unwrap().is_empty());
}

#[tokio::test]
async fn debit_then_credit_moves_balance() {
    let (engine, _db) = engine_with_db().await;
    register(&engine, "A-1").await;

    let due_id = debit(&engine, "A-1", 15_000).await;
    assert_eq!(balance(&engine, "A-1").await, -15_000);

    let payment = credit(&engine, "A-1", 8_000).await;
    assert!(payment.created);
    assert_eq!(payment.applied_minor, Some(8_000));
    assert_eq!(payment.unapplied_minor, Some(0));

    let cache = engine.unit_balance(MGMT, "A-1").await.unwrap().unwrap();
    assert_eq!(cache.balance_minor, -7_000);
    assert_eq!(cache.posted_debit_minor, 15_000);
    assert_eq!(cache.posted_credit_minor, 8_000);
    assert_eq!(cache.entry_count, 2);
    assert!(cache.version >= 2);

    let due = engine.ledger_entry(MGMT, due_id).await.unwrap().due.unwrap();
    assert_eq!(due.allocated_minor, 8_000);
    assert_eq!(due.outstanding_minor, 7_000);
    assert_eq!(due.status, DueStatus::Open);

    let canonical = engine.compute_canonical(MGMT, "A-1").await.unwrap();
    assert_eq!(canonical.balance_minor, -7_000);
}

#[tokio::test]
async fn postings_are_validated() {
    let (engine, _db) = engine_with_db().await;
    register(&engine, "A-1").await;

    let unknown = engine
        .create_debit(
            PostEntryCmd::new(MGMT, "Z-9", 1_000, EntrySource::Dues),
            &manager(),
        )
        .await
        .unwrap_err();
    assert_eq!(unknown, EngineError::KeyNotFound("unit not exists".to_string()));
    assert_eq!(unknown.kind(), ErrorKind::Validation);

    let zero = engine
        .create_credit(
            PostEntryCmd::new(MGMT, "A-1", 0, EntrySource::Payment),
            &manager(),
        )
        .await
        .unwrap_err();
    assert!(matches!(zero, EngineError::InvalidAmount(_)));

    let reserved = engine
        .create_credit(
            PostEntryCmd::new(MGMT, "A-1", 1_000, EntrySource::AutoSettlement),
            &manager(),
        )
        .await
        .unwrap_err();
    assert!(matches!(reserved, EngineError::InvalidEntry(_)));

    let bad_metadata = engine
        .create_debit(
            PostEntryCmd::new(MGMT, "A-1", 1_000, EntrySource::Manual).metadata(json!([1])),
            &manager(),
        )
        .await
        .unwrap_err();
    assert!(matches!(bad_metadata, EngineError::InvalidEntry(_)));

    assert_eq!(balance(&engine, "A-1").await, 0);
}

#[tokio::test]
async fn idempotency_key_replays_or_conflicts() {
    let (engine, _db) = engine_with_db().await;
    register(&engine, "A-1").await;
    let cmd = || {
        PostEntryCmd::new(MGMT, "A-1", 8_000, EntrySource::Payment)
            .idempotency_key("pay-2026-10-A-1")
            .metadata(json!({ "channel": "bank", "ref": "TRX-1" }))
    };

    let first = engine.create_credit(cmd(), &manager()).await.unwrap();
    assert!(first.created);
    let again = engine.create_credit(cmd(), &manager()).await.unwrap();
    assert!(!again.created);
    assert_eq!(again.entry_id, first.entry_id);
    assert_eq!(again.unapplied_minor, Some(8_000));
    assert_eq!(balance(&engine, "A-1").await, 8_000);

    let changed = engine
        .create_credit(
            PostEntryCmd::new(MGMT, "A-1", 9_000, EntrySource::Payment)
                .idempotency_key("pay-2026-10-A-1")
                .metadata(json!({ "ref": "TRX-1", "channel": "bank" })),
            &manager(),
        )
        .await
        .unwrap_err();
    assert_eq!(changed.kind(), ErrorKind::IdempotencyKeyConflict);
    assert_eq!(balance(&engine, "A-1").await, 8_000);
}

#[tokio::test]
async fn credit_serves_related_due_then_oldest() {
    let (engine, _db) = engine_with_db().await;
    register(&engine, "A-1").await;
    let older = debit(&engine, "A-1", 5_000).await;
    let target = debit(&engine, "A-1", 10_000).await;
    let newest = debit(&engine, "A-1", 4_000).await;

    let payment = engine
        .create_credit(
            PostEntryCmd::new(MGMT, "A-1", 12_000, EntrySource::Payment).related_due_id(target),
            &manager(),
        )
        .await
        .unwrap();
    assert_eq!(payment.unapplied_minor, Some(0));

    assert_eq!(outstanding(&engine, target).await, 0);
    assert_eq!(outstanding(&engine, older).await, 3_000);
    assert_eq!(outstanding(&engine, newest).await, 4_000);

    let paid = engine.ledger_entry(MGMT, target).await.unwrap();
    assert_eq!(paid.due.unwrap().status, DueStatus::Paid);
}

#[tokio::test]
async fn leftover_credit_stays_unapplied() {
    let (engine, _db) = engine_with_db().await;
    register(&engine, "A-1").await;
    let first = debit(&engine, "A-1", 3_000).await;
    let second = debit(&engine, "A-1", 5_000).await;

    let payment = credit(&engine, "A-1", 10_000).await;
    assert_eq!(payment.applied_minor, Some(8_000));
    assert_eq!(payment.unapplied_minor, Some(2_000));
    assert_eq!(outstanding(&engine, first).await, 0);
    assert_eq!(outstanding(&engine, second).await, 0);

    let entry = engine.ledger_entry(MGMT, payment.entry_id).await.unwrap();
    assert_eq!(entry.payment.unwrap().status, AllocationStatus::Partial);
    assert_eq!(balance(&engine, "A-1").await, 2_000);
}

#[tokio::test]
async fn related_due_must_belong_to_the_unit() {
    let (engine, _db) = engine_with_db().await;
    register(&engine, "A-1").await;
    register(&engine, "A-2").await;
    let foreign = debit(&engine, "A-2", 5_000).await;

    let err = engine
        .create_credit(
            PostEntryCmd::new(MGMT, "A-1", 5_000, EntrySource::Payment).related_due_id(foreign),
            &manager(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidEntry(_)));
    assert_eq!(outstanding(&engine, foreign).await, 5_000);
}

#[tokio::test]
async fn manual_allocation_is_bounded_by_capacity() {
    let (engine, _db) = engine_with_db().await;
    register(&engine, "A-1").await;
    let payment = credit(&engine, "A-1", 8_000).await;
    assert_eq!(payment.unapplied_minor, Some(8_000));
    // Debits never consume existing credit on their own.
    let due = debit(&engine, "A-1", 5_000).await;
    assert_eq!(unapplied(&engine, payment.entry_id).await, 8_000);

    let err = engine
        .allocate_payment_to_due(MGMT, payment.entry_id, due, 6_000, &manager())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::AllocationExceedsCapacity {
            requested_minor: 6_000,
            capacity_minor: 5_000,
        }
    );
    assert_eq!(err.kind(), ErrorKind::AllocationExceedsCapacity);

    let result = engine
        .allocate_payment_to_due(MGMT, payment.entry_id, due, 5_000, &manager())
        .await
        .unwrap();
    assert_eq!(result.applied_minor, 5_000);
    assert_eq!(result.unapplied_minor, 3_000);
    assert_eq!(outstanding(&engine, due).await, 0);

    let allocations = engine.allocations_for_due(MGMT, due).await.unwrap();
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0].payment_entry_id, payment.entry_id);
    assert_eq!(allocations[0].settlement_entry_id, None);

    let audit = engine
        .audit_log(MGMT, &allocations[0].id.to_string())
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, AuditAction::CreateAllocation);

    let exhausted = engine
        .allocate_payment_to_due(MGMT, payment.entry_id, due, 1, &manager())
        .await
        .unwrap_err();
    assert!(matches!(
        exhausted,
        EngineError::AllocationExceedsCapacity {
            capacity_minor: 0,
            ..
        }
    ));
}

#[tokio::test]
async fn allocation_requires_matching_kinds_and_unit() {
    let (engine, _db) = engine_with_db().await;
    register(&engine, "A-1").await;
    register(&engine, "A-2").await;
    let payment = credit(&engine, "A-1", 8_000).await;
    let other_due = debit(&engine, "A-2", 5_000).await;
    let own_due = debit(&engine, "A-1", 5_000).await;

    let cross_unit = engine
        .allocate_payment_to_due(MGMT, payment.entry_id, other_due, 1_000, &manager())
        .await
        .unwrap_err();
    assert!(matches!(cross_unit, EngineError::InvalidEntry(_)));

    let swapped = engine
        .allocate_payment_to_due(MGMT, own_due, payment.entry_id, 1_000, &manager())
        .await
        .unwrap_err();
    assert!(matches!(swapped, EngineError::KeyNotFound(_)));

    let other_management = engine
        .allocate_payment_to_due("mgmt-2", payment.entry_id, own_due, 1_000, &manager())
        .await
        .unwrap_err();
    assert!(matches!(other_management, EngineError::KeyNotFound(_)));
}

#[tokio::test]
async fn replay_invariant_holds_for_every_due() {
    let (engine, _db) = engine_with_db().await;
    register(&engine, "A-1").await;
    let dues = [
        debit(&engine, "A-1", 4_000).await,
        debit(&engine, "A-1", 6_000).await,
        debit(&engine, "A-1", 9_000).await,
    ];
    let first = credit(&engine, "A-1", 5_000).await;
    let second = credit(&engine, "A-1", 7_000).await;
    engine
        .reverse_payment(MGMT, first.entry_id, "bounced", &manager())
        .await
        .unwrap();

    for due_id in dues {
        let due = engine.ledger_entry(MGMT, due_id).await.unwrap();
        let aggregate = due.due.unwrap();
        let mut active = 0;
        for allocation in engine.allocations_for_due(MGMT, due_id).await.unwrap() {
            let payment = engine
                .ledger_entry(MGMT, allocation.payment_entry_id)
                .await
                .unwrap();
            if payment.is_posted() {
                active += allocation.amount_minor;
            }
        }
        assert_eq!(aggregate.allocated_minor, active);
        assert_eq!(
            aggregate.allocated_minor,
            aggregate.total_minor - aggregate.outstanding_minor
        );
    }

    let payment = engine.ledger_entry(MGMT, second.entry_id).await.unwrap();
    let aggregate = payment.payment.unwrap();
    assert_eq!(
        aggregate.applied_minor + aggregate.unapplied_minor,
        payment.amount_minor
    );
}

#[tokio::test]
async fn entries_page_newest_first_with_cursor() {
    let (engine, _db) = engine_with_db().await;
    register(&engine, "A-1").await;
    let mut posted = Vec::new();
    for amount in [1_000, 2_000, 3_000, 4_000, 5_000] {
        posted.push(debit(&engine, "A-1", amount).await);
    }

    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let (page, next) = engine
            .list_unit_entries_page(MGMT, "A-1", 2, cursor.as_deref())
            .await
            .unwrap();
        assert!(page.len() <= 2);
        seen.extend(page.into_iter().map(|e| e.id));
        match next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    posted.reverse();
    assert_eq!(seen, posted);

    let err = engine
        .list_unit_entries_page(MGMT, "A-1", 2, Some("not-a-cursor"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidCursor(_)));
}

#[tokio::test]
async fn monthly_dues_run_once_per_period() {
    let (engine, _db) = engine_with_db().await;
    register(&engine, "A-1").await;
    register(&engine, "A-2").await;

    let run = engine
        .generate_monthly_dues(MGMT, "2026-10", 12_000, &manager())
        .await
        .unwrap();
    assert_eq!(run.created, 2);
    assert_eq!(run.skipped, 0);
    assert!(!run.already_ran);
    assert_eq!(balance(&engine, "A-1").await, -12_000);
    assert_eq!(balance(&engine, "A-2").await, -12_000);

    let rerun = engine
        .generate_monthly_dues(MGMT, "2026-10", 12_000, &manager())
        .await
        .unwrap();
    assert!(rerun.already_ran);
    assert_eq!(rerun.created, 0);
    assert_eq!(balance(&engine, "A-1").await, -12_000);

    let audit = engine.audit_log(MGMT, MGMT).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, AuditAction::GenerateMonthlyDues);

    let invalid = engine
        .generate_monthly_dues(MGMT, "2026-13", 12_000, &manager())
        .await
        .unwrap_err();
    assert!(matches!(invalid, EngineError::InvalidEntry(_)));
}

#[tokio::test]
async fn every_posting_is_audited() {
    let (engine, _db) = engine_with_db().await;
    register(&engine, "A-1").await;
    let due_id = debit(&engine, "A-1", 15_000).await;

    let audit = engine.audit_log(MGMT, &due_id.to_string()).await.unwrap();
    assert_eq!(audit.len(), 1);
    let record = &audit[0];
    assert_eq!(record.action, AuditAction::CreateDebit);
    assert_eq!(record.actor_uid, "manager-1");
    assert_eq!(record.management_id, MGMT);
    assert_eq!(record.metadata["amount_minor"], json!(15_000));
    assert_eq!(record.metadata["actor_role"], json!("manager"));

    let unit_audit = engine.audit_log(MGMT, "A-1").await.unwrap();
    assert_eq!(unit_audit.len(), 1);
    assert_eq!(unit_audit[0].action, AuditAction::RegisterUnit);
}

#[tokio::test]
async fn overflowing_balance_is_rejected_and_rolled_back() {
    let (engine, _db) = engine_with_db().await;
    register(&engine, "A-1").await;
    let half = i64::MAX / 2 + 1;
    let first = debit(&engine, "A-1", half).await;

    let err = engine
        .create_debit(
            PostEntryCmd::new(MGMT, "A-1", half, EntrySource::Dues),
            &manager(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidAmount(_)));
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert_eq!(balance(&engine, "A-1").await, -half);
    assert_eq!(outstanding(&engine, first).await, half);
    let (entries, _) = engine
        .list_unit_entries_page(MGMT, "A-1", 10, None)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        engine.compute_canonical(MGMT, "A-1").await.unwrap().balance_minor,
        -half
    );
}
