use std::{future::Future, pin::Pin, sync::Arc};

use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use tracing::warn;

use crate::{Clock, EngineConfig, EngineError, ResultEngine, SystemClock};

mod access;
mod aggregates;
mod allocation;
mod audit;
mod balances;
mod drift;
mod list;
mod postings;
mod reversal;
mod settlement;

/// Future returned by a transactional step.
pub(crate) type TxFuture<'a, T> = Pin<Box<dyn Future<Output = ResultEngine<T>> + Send + 'a>>;

/// Handle over the ledger database.
///
/// The engine keeps no in-memory ledger state: every operation reads and
/// writes through the database, so clones can serve concurrent callers.
#[derive(Clone, Debug)]
pub struct Engine {
    database: DatabaseConnection,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
}

impl Engine {
    /// Return a builder for `Engine`. Help to build the struct.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Runs `op` inside a fresh transaction, retrying the whole transaction
    /// with exponential backoff while it fails with a retryable conflict.
    ///
    /// `op` may run several times, so it must not have effects outside the
    /// transaction it is handed.
    pub(crate) async fn with_retry<T, F>(&self, label: &'static str, op: F) -> ResultEngine<T>
    where
        T: Send + 'static,
        F: for<'a> Fn(&'a Engine, &'a DatabaseTransaction) -> TxFuture<'a, T> + Send + Sync,
    {
        let max_attempts = self.config.max_tx_retries.max(1);
        let mut attempt = 0u32;
        loop {
            let result: ResultEngine<T> = async {
                let db_tx = self.database.begin().await?;
                let value = op(self, &db_tx).await?;
                db_tx.commit().await?;
                Ok(value)
            }
            .await;

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                    warn!(operation = label, attempt, error = %err, "transaction conflict, retrying");
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(err) if err.is_retryable() => {
                    warn!(operation = label, attempts = max_attempts, error = %err, "transaction conflict, giving up");
                    return Err(EngineError::TransactionConflict(format!(
                        "{label}: retries exhausted ({err})"
                    )));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// The builder for `Engine`
#[derive(Default)]
pub struct EngineBuilder {
    database: DatabaseConnection,
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    /// Pass the required database
    pub fn database(mut self, db: DatabaseConnection) -> EngineBuilder {
        self.database = db;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> EngineBuilder {
        self.config = config;
        self
    }

    /// Override the time source (defaults to the system clock).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> EngineBuilder {
        self.clock = Some(clock);
        self
    }

    /// Construct `Engine`
    pub async fn build(self) -> ResultEngine<Engine> {
        Ok(Engine {
            database: self.database,
            config: self.config,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        })
    }
}
