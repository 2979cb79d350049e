mod common;

use std::time::Duration;

use common::*;
use engine::{EngineConfig, EngineError, EntrySource, ErrorKind, PostEntryCmd};
use sea_orm::{ConnectionTrait, DatabaseConnection, DatabaseTransaction, Statement, TransactionTrait};

/// Takes the SQLite write lock on a separate connection and keeps it until
/// the returned transaction ends.
async fn hold_write_lock(db: &DatabaseConnection) -> DatabaseTransaction {
    let blocker = db.begin().await.unwrap();
    let backend = blocker.get_database_backend();
    blocker
        .execute(Statement::from_sql_and_values(
            backend,
            "UPDATE unit_balances SET version = version WHERE management_id = ?",
            [MGMT.into()],
        ))
        .await
        .unwrap();
    blocker
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_settlements_never_double_spend() {
    let config = EngineConfig {
        max_tx_retries: 10,
        ..EngineConfig::default()
    };
    let (engine, _db, _dir) = engine_on_file(config, Duration::from_secs(5)).await;
    register(&engine, "A-1").await;
    let payment = credit(&engine, "A-1", 100_000).await;
    for _ in 0..3 {
        debit(&engine, "A-1", 40_000).await;
    }

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..4 {
        let engine = engine.clone();
        tasks.spawn(async move {
            engine
                .auto_settle_from_credit(MGMT, "A-1", &manager())
                .await
        });
    }

    let (mut closed, mut settled) = (0, 0);
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap().unwrap();
        closed += result.closed_due_count;
        settled += result.total_settled_minor;
    }
    assert_eq!(closed, 2);
    assert_eq!(settled, 80_000);

    assert_eq!(unapplied(&engine, payment.entry_id).await, 20_000);
    let allocated: i64 = engine
        .allocations_for_payment(MGMT, payment.entry_id)
        .await
        .unwrap()
        .iter()
        .map(|a| a.amount_minor)
        .sum();
    assert_eq!(allocated, 80_000);
    assert_eq!(balance(&engine, "A-1").await, -20_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_surface_a_transaction_conflict() {
    let config = EngineConfig {
        max_tx_retries: 1,
        ..EngineConfig::default()
    };
    let (engine, db, _dir) = engine_on_file(config, Duration::from_millis(50)).await;
    register(&engine, "A-1").await;
    debit(&engine, "A-1", 5_000).await;

    let blocker = hold_write_lock(&db).await;
    let err = engine
        .create_credit(
            PostEntryCmd::new(MGMT, "A-1", 5_000, EntrySource::Payment),
            &manager(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TransactionConflict(_)));
    assert_eq!(err.kind(), ErrorKind::TransactionConflict);
    assert_eq!(err.kind().as_str(), "transaction_conflict");
    blocker.rollback().await.unwrap();

    // The failed attempt left nothing behind.
    assert_eq!(balance(&engine, "A-1").await, -5_000);
    let (entries, _) = engine
        .list_unit_entries_page(MGMT, "A-1", 10, None)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);

    credit(&engine, "A-1", 5_000).await;
    assert_eq!(balance(&engine, "A-1").await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conflicts_are_retried_until_the_writer_lets_go() {
    let config = EngineConfig {
        max_tx_retries: 5,
        retry_backoff_ms: 20,
        ..EngineConfig::default()
    };
    let (engine, db, _dir) = engine_on_file(config, Duration::from_millis(20)).await;
    register(&engine, "A-1").await;
    let due = debit(&engine, "A-1", 5_000).await;

    let blocker = hold_write_lock(&db).await;
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        blocker.rollback().await.unwrap();
    });

    let posted = engine
        .create_credit(
            PostEntryCmd::new(MGMT, "A-1", 5_000, EntrySource::Payment),
            &manager(),
        )
        .await
        .unwrap();
    release.await.unwrap();

    assert!(posted.created);
    assert_eq!(posted.applied_minor, Some(5_000));
    assert_eq!(outstanding(&engine, due).await, 0);
    assert_eq!(balance(&engine, "A-1").await, 0);
}
