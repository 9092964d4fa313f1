use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use lpcache_delivery_influxdb::InfluxDbConfig;
use lpcache_engine::DrainConfig;
use lpcache_storage_sqlite::SqliteStoreConfig;

use crate::error::ConsumerError;

#[derive(Parser)]
#[command(name = "lpcache-consumer", about = "Drains the line protocol cache into InfluxDB")]
pub struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = "lpcache.toml", env = "LPCACHE_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drain the cache until SIGINT/SIGTERM
    Run,
    /// Print cursor and backlog as JSON
    Status,
    /// Append line protocol from stdin to the cache
    Ingest(IngestArgs),
}

#[derive(Args, Clone, Debug)]
pub struct IngestArgs {
    /// Lines per insert transaction
    #[arg(long, default_value_t = 1000)]
    pub chunk: usize,
}

// ---- TOML Config ----

#[derive(Debug, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub cache: SqliteStoreConfig,
    #[serde(default)]
    pub drain: DrainConfig,
    #[serde(default)]
    pub destinations: Vec<InfluxDbConfig>,
    /// Destination for the backlog gauge.
    #[serde(default)]
    pub stats: Option<InfluxDbConfig>,
}

impl ConsumerConfig {
    pub fn load(path: &Path) -> Result<Self, ConsumerError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConsumerError::Config {
            context: "read",
            detail: format!("'{}': {e}", path.display()),
        })?;
        let config = Self::parse(&content).map_err(|e| match e {
            ConsumerError::Config { context, detail } => ConsumerError::Config {
                context,
                detail: format!("'{}': {detail}", path.display()),
            },
            other => other,
        })?;
        tracing::info!(config = %path.display(), destinations = config.destinations.len(), "loaded config");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConsumerError> {
        let config: Self = toml::from_str(content).map_err(|e| ConsumerError::Config {
            context: "parse",
            detail: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConsumerError> {
        let invalid = |detail: String| ConsumerError::Config { context: "validate", detail };

        self.cache.validate().map_err(|e| invalid(e.to_string()))?;
        self.drain.validate().map_err(|e| invalid(e.to_string()))?;
        for destination in self.destinations.iter().chain(self.stats.as_ref()) {
            destination.validate().map_err(|e| invalid(e.to_string()))?;
        }
        Ok(())
    }
}
