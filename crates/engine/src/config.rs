use std::time::Duration;

use serde::Deserialize;

/// Tunables for the engine, usually deserialized from the `[engine]` section
/// of the application settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts per mutating operation before a conflict is surfaced.
    pub max_tx_retries: u32,
    /// First backoff between attempts; doubled after every conflict.
    pub retry_backoff_ms: u64,
    /// Minimum time between two non-forced rebuilds of the same target.
    pub rebuild_cooldown_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tx_retries: 5,
            retry_backoff_ms: 10,
            rebuild_cooldown_secs: 30,
        }
    }
}

impl EngineConfig {
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(10);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    pub(crate) fn rebuild_cooldown(&self) -> chrono::Duration {
        i64::try_from(self.rebuild_cooldown_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = EngineConfig {
            retry_backoff_ms: 5,
            ..EngineConfig::default()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(5));
        assert_eq!(config.backoff(1), Duration::from_millis(10));
        assert_eq!(config.backoff(3), Duration::from_millis(40));
    }
}
