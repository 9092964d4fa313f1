use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use lpcache_api::delivery::DeliveryClient;
use lpcache_delivery_influxdb::{InfluxDbClient, InfluxDbConfig};
use lpcache_engine::{BacklogGauge, ConsumerLock, DrainLoop, FanOutClient, PositionTracker};
use lpcache_storage_sqlite::SqliteCacheStore;

use crate::config::ConsumerConfig;
use crate::error::ConsumerError;

pub async fn run(config_path: &Path) -> Result<(), ConsumerError> {
    tracing::info!("lpcache-consumer starting");

    // --- Load config ---
    let config = ConsumerConfig::load(config_path)?;
    if config.destinations.is_empty() {
        return Err(ConsumerError::NoComponents("[[destinations]]"));
    }

    // --- Single consumer per cache ---
    let _lock = ConsumerLock::acquire(config.cache.lock_path())?;

    // --- Store, client, cursor ---
    let store = Arc::new(SqliteCacheStore::open(&config.cache)?);
    let client = build_client(&config.destinations)?;
    let tracker = PositionTracker::new(config.cache.cursor_path());

    let mut drain = DrainLoop::new(store, client, tracker, &config.drain);
    if let Some(stats) = &config.stats {
        let gauge_client: Arc<dyn DeliveryClient> = Arc::new(InfluxDbClient::new(stats)?);
        drain = drain.with_backlog_gauge(BacklogGauge::new(gauge_client));
        tracing::info!(destination = %stats.display_name(), "backlog gauge enabled");
    }

    // --- CancellationToken for graceful shutdown ---
    let token = CancellationToken::new();
    let mut handle = tokio::spawn(drain.run(token.clone()));
    tracing::info!("consumer ready");

    let summary = tokio::select! {
        // Drain stopped on its own: halted batch or fatal store error.
        result = &mut handle => result??,
        signal = shutdown_signal() => {
            signal?;
            tracing::info!("shutting down...");
            // The in-flight attempt and cursor write finish before the task returns.
            token.cancel();
            handle.await??
        }
    };

    tracing::info!(cursor = summary.cursor, "shutdown complete");
    Ok(())
}

fn build_client(destinations: &[InfluxDbConfig]) -> Result<Arc<dyn DeliveryClient>, ConsumerError> {
    let mut clients: Vec<Arc<dyn DeliveryClient>> = Vec::with_capacity(destinations.len());
    for destination in destinations {
        clients.push(Arc::new(InfluxDbClient::new(destination)?));
        tracing::info!(
            destination = %destination.display_name(),
            timeout_ms = destination.timeout_ms,
            gzip = destination.gzip,
            "destination configured"
        );
    }

    if clients.len() == 1 {
        return Ok(clients.remove(0));
    }
    Ok(Arc::new(FanOutClient::new(clients)))
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
