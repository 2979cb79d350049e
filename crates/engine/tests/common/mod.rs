#![allow(dead_code)]

use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use tempfile::TempDir;
use uuid::Uuid;

use engine::{Actor, Engine, EngineConfig, EntrySource, ManualClock, PostEntryCmd, PostingResult};
use migration::MigratorTrait;

pub const MGMT: &str = "mgmt-1";

pub fn manager() -> Actor {
    Actor::new("manager-1").role("manager")
}

pub async fn engine_with_db() -> (Engine, DatabaseConnection) {
    engine_with_config(EngineConfig::default()).await
}

pub async fn engine_with_config(config: EngineConfig) -> (Engine, DatabaseConnection) {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    build_engine(db, config).await
}

/// A file database behind a real pool, so transactions run side by side.
/// The returned `TempDir` must outlive the engine.
pub async fn engine_on_file(
    config: EngineConfig,
    busy_timeout: StdDuration,
) -> (Engine, DatabaseConnection, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("ledger.db").display());
    let mut options = ConnectOptions::new(url);
    options
        .max_connections(4)
        .min_connections(1)
        .sqlx_logging(false)
        .map_sqlx_sqlite_opts(move |opts| opts.busy_timeout(busy_timeout));
    let db = Database::connect(options).await.unwrap();
    let (engine, db) = build_engine(db, config).await;
    (engine, db, dir)
}

async fn build_engine(db: DatabaseConnection, config: EngineConfig) -> (Engine, DatabaseConnection) {
    migration::Migrator::up(&db, None).await.unwrap();
    let start = DateTime::<Utc>::from_timestamp(1_790_000_000, 0).unwrap();
    let engine = Engine::builder()
        .database(db.clone())
        .config(config)
        .clock(Arc::new(ManualClock::new(start, Duration::seconds(1))))
        .build()
        .await
        .unwrap();
    (engine, db)
}

pub async fn register(engine: &Engine, unit_id: &str) {
    engine
        .register_unit(MGMT, unit_id, Some("Apartment"), &manager())
        .await
        .unwrap();
}

pub async fn debit(engine: &Engine, unit_id: &str, amount_minor: i64) -> Uuid {
    engine
        .create_debit(
            PostEntryCmd::new(MGMT, unit_id, amount_minor, EntrySource::Dues),
            &manager(),
        )
        .await
        .unwrap()
        .entry_id
}

pub async fn credit(engine: &Engine, unit_id: &str, amount_minor: i64) -> PostingResult {
    engine
        .create_credit(
            PostEntryCmd::new(MGMT, unit_id, amount_minor, EntrySource::Payment),
            &manager(),
        )
        .await
        .unwrap()
}

pub async fn balance(engine: &Engine, unit_id: &str) -> i64 {
    engine
        .unit_balance(MGMT, unit_id)
        .await
        .unwrap()
        .map(|b| b.balance_minor)
        .unwrap_or(0)
}

pub async fn outstanding(engine: &Engine, due_id: Uuid) -> i64 {
    engine
        .ledger_entry(MGMT, due_id)
        .await
        .unwrap()
        .due
        .unwrap()
        .outstanding_minor
}

pub async fn unapplied(engine: &Engine, payment_id: Uuid) -> i64 {
    engine
        .ledger_entry(MGMT, payment_id)
        .await
        .unwrap()
        .payment
        .unwrap()
        .unapplied_minor
}

pub async fn exec(db: &DatabaseConnection, sql: &str, values: Vec<sea_orm::Value>) {
    let backend = db.get_database_backend();
    db.execute(Statement::from_sql_and_values(backend, sql, values))
        .await
        .unwrap();
}
