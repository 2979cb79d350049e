mod common;

use common::*;
use engine::{
    AlertStatus, AlertType, AuditAction, DueStatus, EngineConfig, EngineError, ErrorKind,
    REBUILD_AUTO_RESOLVE,
};

async fn corrupt_balance(db: &sea_orm::DatabaseConnection, unit_id: &str, balance_minor: i64) {
    exec(
        db,
        "UPDATE unit_balances SET balance_minor = ? WHERE management_id = ? AND unit_id = ?",
        vec![balance_minor.into(), MGMT.into(), unit_id.into()],
    )
    .await;
}

async fn corrupt_due(db: &sea_orm::DatabaseConnection, due_id: uuid::Uuid, total_minor: i64) {
    exec(
        db,
        "UPDATE ledger_entries SET due_allocated_minor = 0, due_outstanding_minor = ?, \
         due_status = 'open' WHERE id = ?",
        vec![total_minor.into(), due_id.to_string().into()],
    )
    .await;
}

#[tokio::test]
async fn balance_drift_opens_refreshes_and_resolves_alert() {
    let (engine, db) = engine_with_db().await;
    register(&engine, "A-1").await;
    debit(&engine, "A-1", 15_000).await;
    credit(&engine, "A-1", 8_000).await;

    let clean = engine.check_unit_balance_drift(MGMT, "A-1").await.unwrap();
    assert!(!clean.drifted);
    assert_eq!(clean.diff_minor, 0);

    corrupt_balance(&db, "A-1", 99_999).await;
    let report = engine.check_unit_balance_drift(MGMT, "A-1").await.unwrap();
    assert!(report.drifted);
    assert_eq!(report.cached_minor, Some(99_999));
    assert_eq!(report.canonical_minor, -7_000);
    assert_eq!(report.diff_minor, 106_999);

    corrupt_balance(&db, "A-1", 5).await;
    engine.check_unit_balance_drift(MGMT, "A-1").await.unwrap();
    let open = engine.open_alerts(MGMT).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].alert_type, AlertType::BalanceDrift);
    assert_eq!(open[0].target_id, "A-1");
    assert_eq!(open[0].cached_minor, 5);
    assert_eq!(open[0].diff_minor, 7_005);

    let rebuilt = engine
        .rebuild_unit_balance(MGMT, "A-1", false, &manager())
        .await
        .unwrap();
    assert!(!rebuilt.noop);
    assert_eq!(rebuilt.balance_minor, -7_000);
    assert_eq!(rebuilt.alerts_resolved, 1);
    assert_eq!(balance(&engine, "A-1").await, -7_000);

    assert!(engine.open_alerts(MGMT).await.unwrap().is_empty());
    let history = engine.alerts_for_target(MGMT, "A-1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, AlertStatus::Resolved);
    assert_eq!(history[0].resolved_reason.as_deref(), Some(REBUILD_AUTO_RESOLVE));

    let cache = engine.unit_balance(MGMT, "A-1").await.unwrap().unwrap();
    assert_eq!(cache.rebuilt_by.as_deref(), Some("manager-1"));
    assert!(cache.rebuilt_at.is_some());

    let audit = engine.audit_log(MGMT, "A-1").await.unwrap();
    assert_eq!(audit.last().unwrap().action, AuditAction::RebuildBalance);
}

#[tokio::test]
async fn deleted_cache_is_reconstructed() {
    let (engine, db) = engine_with_db().await;
    register(&engine, "A-1").await;
    debit(&engine, "A-1", 12_000).await;
    credit(&engine, "A-1", 2_000).await;

    exec(
        &db,
        "DELETE FROM unit_balances WHERE management_id = ? AND unit_id = ?",
        vec![MGMT.into(), "A-1".into()],
    )
    .await;
    assert!(engine.unit_balance(MGMT, "A-1").await.unwrap().is_none());

    let report = engine.check_unit_balance_drift(MGMT, "A-1").await.unwrap();
    assert!(report.drifted);
    assert_eq!(report.cached_minor, None);
    assert_eq!(report.canonical_minor, -10_000);

    let rebuilt = engine
        .rebuild_unit_balance(MGMT, "A-1", false, &manager())
        .await
        .unwrap();
    assert_eq!(rebuilt.posted_debit_minor, 12_000);
    assert_eq!(rebuilt.posted_credit_minor, 2_000);
    assert_eq!(rebuilt.entry_count, 2);

    let cache = engine.unit_balance(MGMT, "A-1").await.unwrap().unwrap();
    assert_eq!(cache.balance_minor, -10_000);
    assert_eq!(cache.entry_count, 2);

    // Postings keep working on top of the rebuilt cache.
    credit(&engine, "A-1", 10_000).await;
    assert_eq!(balance(&engine, "A-1").await, 0);
}

#[tokio::test]
async fn missing_cache_of_a_zero_balance_unit_is_not_drift() {
    let (engine, _db) = engine_with_db().await;
    register(&engine, "A-1").await;

    let report = engine.check_unit_balance_drift(MGMT, "A-1").await.unwrap();
    assert!(!report.drifted);
    assert!(engine.open_alerts(MGMT).await.unwrap().is_empty());
}

#[tokio::test]
async fn rebuild_is_throttled_unless_forced() {
    let (engine, db) = engine_with_db().await;
    register(&engine, "A-1").await;
    debit(&engine, "A-1", 5_000).await;

    corrupt_balance(&db, "A-1", 1).await;
    engine
        .rebuild_unit_balance(MGMT, "A-1", false, &manager())
        .await
        .unwrap();

    corrupt_balance(&db, "A-1", 2).await;
    let err = engine
        .rebuild_unit_balance(MGMT, "A-1", false, &manager())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RebuildThrottled);
    assert_eq!(balance(&engine, "A-1").await, 2);

    let forced = engine
        .rebuild_unit_balance(MGMT, "A-1", true, &manager())
        .await
        .unwrap();
    assert!(!forced.noop);
    assert_eq!(balance(&engine, "A-1").await, -5_000);
}

#[tokio::test]
async fn zero_cooldown_never_throttles() {
    let config = EngineConfig {
        rebuild_cooldown_secs: 0,
        ..EngineConfig::default()
    };
    let (engine, db) = engine_with_config(config).await;
    register(&engine, "A-1").await;
    debit(&engine, "A-1", 5_000).await;

    for corrupted in [1, 2, 3] {
        corrupt_balance(&db, "A-1", corrupted).await;
        let rebuilt = engine
            .rebuild_unit_balance(MGMT, "A-1", false, &manager())
            .await
            .unwrap();
        assert!(!rebuilt.noop);
    }
}

#[tokio::test]
async fn noop_rebuild_is_audited_without_cooldown() {
    let (engine, _db) = engine_with_db().await;
    register(&engine, "A-1").await;
    debit(&engine, "A-1", 5_000).await;
    let before = engine.audit_log(MGMT, "A-1").await.unwrap().len();

    let rebuilt = engine
        .rebuild_unit_balance(MGMT, "A-1", false, &manager())
        .await
        .unwrap();
    assert!(rebuilt.noop);
    assert_eq!(rebuilt.alerts_resolved, 0);

    let audit = engine.audit_log(MGMT, "A-1").await.unwrap();
    assert_eq!(audit.len(), before + 1);
    let record = audit.last().unwrap();
    assert_eq!(record.action, AuditAction::RebuildBalance);
    assert_eq!(record.metadata["noop"], true);
    assert_eq!(record.metadata["balance_minor"], -5_000);

    // A no-op rebuild does not start a cooldown.
    let again = engine
        .rebuild_unit_balance(MGMT, "A-1", false, &manager())
        .await
        .unwrap();
    assert!(again.noop);
    assert_eq!(engine.audit_log(MGMT, "A-1").await.unwrap().len(), before + 2);
}

#[tokio::test]
async fn due_drift_is_detected_and_rebuilt() {
    let (engine, db) = engine_with_db().await;
    register(&engine, "A-1").await;
    let due = debit(&engine, "A-1", 15_000).await;
    credit(&engine, "A-1", 8_000).await;

    let clean = engine.check_due_drift(MGMT, 10).await.unwrap();
    assert!(!clean.drifted);
    assert_eq!(clean.checked, 1);

    corrupt_due(&db, due, 15_000).await;
    let report = engine.check_due_drift(MGMT, 10).await.unwrap();
    assert!(report.drifted);
    assert_eq!(report.due_ids, vec![due]);

    let alerts = engine
        .alerts_for_target(MGMT, &due.to_string())
        .await
        .unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::DueDrift);
    assert_eq!(alerts[0].cached_minor, 0);
    assert_eq!(alerts[0].canonical_minor, 8_000);
    assert_eq!(alerts[0].diff_minor, -8_000);

    let rebuilt = engine
        .rebuild_due_aggregates(MGMT, due, false, &manager())
        .await
        .unwrap();
    assert!(!rebuilt.noop);
    assert_eq!(rebuilt.due_allocated_minor, 8_000);
    assert_eq!(rebuilt.due_outstanding_minor, 7_000);
    assert_eq!(rebuilt.due_status, DueStatus::Open);
    assert_eq!(rebuilt.alerts_resolved, 1);
    assert_eq!(outstanding(&engine, due).await, 7_000);

    let throttled = engine
        .rebuild_due_aggregates(MGMT, due, false, &manager())
        .await
        .unwrap_err();
    assert!(matches!(throttled, EngineError::RebuildThrottled(_)));

    let audit_before = engine.audit_log(MGMT, &due.to_string()).await.unwrap().len();
    let forced = engine
        .rebuild_due_aggregates(MGMT, due, true, &manager())
        .await
        .unwrap();
    assert!(forced.noop);
    let audit = engine.audit_log(MGMT, &due.to_string()).await.unwrap();
    assert_eq!(audit.len(), audit_before + 1);
    let record = audit.last().unwrap();
    assert_eq!(record.action, AuditAction::RebuildDue);
    assert_eq!(record.metadata["noop"], true);
    assert_eq!(record.metadata["forced"], true);
}

#[tokio::test]
async fn due_drift_samples_newest_dues() {
    let (engine, db) = engine_with_db().await;
    register(&engine, "A-1").await;
    let oldest = debit(&engine, "A-1", 1_000).await;
    debit(&engine, "A-1", 2_000).await;
    debit(&engine, "A-1", 3_000).await;

    exec(
        &db,
        "UPDATE ledger_entries SET due_outstanding_minor = 1 WHERE id = ?",
        vec![oldest.to_string().into()],
    )
    .await;

    let sampled = engine.check_due_drift(MGMT, 2).await.unwrap();
    assert_eq!(sampled.checked, 2);
    assert!(!sampled.drifted);

    let full = engine.check_due_drift(MGMT, 3).await.unwrap();
    assert_eq!(full.checked, 3);
    assert_eq!(full.due_ids, vec![oldest]);

    let none = engine.check_due_drift(MGMT, 0).await.unwrap();
    assert_eq!(none.checked, 0);
}

#[tokio::test]
async fn sweep_rebuilds_what_drifted() {
    let (engine, db) = engine_with_db().await;
    register(&engine, "A-1").await;
    register(&engine, "A-2").await;
    let due = debit(&engine, "A-1", 10_000).await;
    credit(&engine, "A-1", 4_000).await;
    debit(&engine, "A-2", 3_000).await;

    corrupt_balance(&db, "A-2", 42).await;
    corrupt_due(&db, due, 10_000).await;

    let dry = engine
        .sweep_drift(MGMT, 50, false, &manager())
        .await
        .unwrap();
    assert_eq!(dry.units_checked, 2);
    assert_eq!(dry.drifted_units, vec!["A-2".to_string()]);
    assert_eq!(dry.drifted_dues, vec![due]);
    assert_eq!(dry.rebuilt_units + dry.rebuilt_dues, 0);
    assert_eq!(engine.open_alerts(MGMT).await.unwrap().len(), 2);

    let report = engine
        .sweep_drift(MGMT, 50, true, &manager())
        .await
        .unwrap();
    assert_eq!(report.rebuilt_units, 1);
    assert_eq!(report.rebuilt_dues, 1);
    assert_eq!(report.dues_checked, 2);

    assert!(engine.open_alerts(MGMT).await.unwrap().is_empty());
    assert_eq!(balance(&engine, "A-2").await, -3_000);
    assert_eq!(outstanding(&engine, due).await, 6_000);

    let clean = engine
        .sweep_drift(MGMT, 50, true, &manager())
        .await
        .unwrap();
    assert!(clean.drifted_units.is_empty());
    assert!(clean.drifted_dues.is_empty());
}
