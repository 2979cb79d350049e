use std::time::Duration;

use engine::{Actor, Engine};
use migration::{Migrator, MigratorTrait};
use settings::Database;

mod settings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let settings = settings::Settings::new()?;

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "duesledger={level},engine={level}",
            level = settings.app.level
        ))
        .init();

    let db = parse_database(&settings.database).await?;
    let engine = Engine::builder()
        .database(db)
        .config(settings.engine)
        .build()
        .await?;
    tracing::info!("ledger database ready");

    let Some(drift) = settings.drift else {
        tracing::info!("no drift settings, nothing to schedule");
        tokio::signal::ctrl_c().await?;
        return Ok(());
    };

    let mut tasks = tokio::task::JoinSet::new();
    for management_id in drift.managements {
        let engine = engine.clone();
        let period = Duration::from_secs(drift.interval_secs.max(1));
        let (sample_limit, auto_rebuild) = (drift.sample_limit, drift.auto_rebuild);
        let actor = Actor::new(drift.actor.clone()).role("system");
        tasks.spawn(async move {
            tracing::info!(management_id, ?period, "drift sweep scheduled");
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match engine
                    .sweep_drift(&management_id, sample_limit, auto_rebuild, &actor)
                    .await
                {
                    Ok(report) if report.drifted_units.is_empty() && report.drifted_dues.is_empty() => {
                        tracing::debug!(management_id, "no drift found");
                    }
                    Ok(report) => tracing::warn!(
                        management_id,
                        drifted_units = report.drifted_units.len(),
                        drifted_dues = report.drifted_dues.len(),
                        rebuilt_units = report.rebuilt_units,
                        rebuilt_dues = report.rebuilt_dues,
                        "drift sweep found mismatches"
                    ),
                    Err(err) => tracing::error!(management_id, "drift sweep failed: {err}"),
                }
            }
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
        Some(_) = tasks.join_next() => tracing::error!("drift task stopped unexpectedly"),
    }
    tasks.shutdown().await;

    Ok(())
}

async fn parse_database(
    config: &Database,
) -> Result<sea_orm::DatabaseConnection, Box<dyn std::error::Error + Send + Sync>> {
    let url = match config {
        Database::Memory => String::from("sqlite::memory:"),
        Database::Sqlite(path) => format!("sqlite:{}?mode=rwc", path),
    };

    let database = sea_orm::Database::connect(url).await?;
    Migrator::up(&database, None).await?;
    Ok(database)
}
