//! Handles settings for the application. Configuration is written in
//! `settings.toml`.
//!
//! See `settings.example.toml` for the configuration.
use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct App {
    pub level: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Database {
    Memory,
    Sqlite(String),
}

/// Periodic drift sweep over the listed managements.
#[derive(Debug, Deserialize)]
pub struct Drift {
    pub managements: Vec<String>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_sample_limit")]
    pub sample_limit: u64,
    #[serde(default)]
    pub auto_rebuild: bool,
    /// Uid recorded on rebuilds done by the sweep.
    #[serde(default = "default_actor")]
    pub actor: String,
}

fn default_actor() -> String {
    "system".to_string()
}

fn default_interval_secs() -> u64 {
    300
}

fn default_sample_limit() -> u64 {
    200
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub app: App,
    pub database: Database,
    #[serde(default)]
    pub engine: engine::EngineConfig,
    pub drift: Option<Drift>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name("settings"))
            .build()?;

        settings.try_deserialize()
    }
}
