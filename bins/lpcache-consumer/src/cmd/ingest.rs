use std::path::Path;

use tokio::io::{AsyncBufReadExt, BufReader};

use lpcache_storage_sqlite::SqliteCacheStore;

use crate::config::{ConsumerConfig, IngestArgs};
use crate::error::ConsumerError;

/// Minimal producer: append stdin lines to the cache, `chunk` lines per
/// transaction. Blank lines are dropped.
pub async fn run(config_path: &Path, args: IngestArgs) -> Result<(), ConsumerError> {
    let config = ConsumerConfig::load(config_path)?;
    let store = SqliteCacheStore::open(&config.cache)?;
    let chunk = args.chunk.max(1);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending: Vec<String> = Vec::with_capacity(chunk);
    let mut total = 0usize;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        pending.push(line.to_string());
        if pending.len() >= chunk {
            total += store.append(pending.drain(..)).await?.len();
        }
    }
    if !pending.is_empty() {
        total += store.append(pending).await?.len();
    }

    tracing::info!(lines = total, cache = %store.path().display(), "ingest finished");
    Ok(())
}
