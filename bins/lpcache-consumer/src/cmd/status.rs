use std::path::Path;

use serde::Serialize;

use lpcache_api::record::Offset;
use lpcache_api::store::CacheStore;
use lpcache_engine::PositionTracker;
use lpcache_storage_sqlite::SqliteCacheStore;

use crate::config::ConsumerConfig;
use crate::error::ConsumerError;

#[derive(Debug, Serialize)]
struct Status {
    cache: String,
    cursor_path: String,
    /// `None` until a consumer ran once.
    cursor: Option<Offset>,
    first_offset: Option<Offset>,
    end_offset: Offset,
    /// Records at or after the cursor.
    pending: u64,
}

/// Read-only view of the consumer position. Never writes the cursor and
/// does not need the consumer lock.
pub async fn run(config_path: &Path) -> Result<(), ConsumerError> {
    let config = ConsumerConfig::load(config_path)?;
    let cursor_path = config.cache.cursor_path();
    let cursor = PositionTracker::read(&cursor_path)?;

    let store = SqliteCacheStore::open_read_only(&config.cache)?;
    let first_offset = store.first_offset().await?;
    let end_offset = store.end_offset().await?;
    let pending = store.count_from(cursor.or(first_offset).unwrap_or(end_offset)).await?;

    let status = Status {
        cache: config.cache.path.display().to_string(),
        cursor_path: cursor_path.display().to_string(),
        cursor,
        first_offset,
        end_offset,
        pending,
    };
    let json = serde_json::to_string_pretty(&status).map_err(std::io::Error::other)?;
    println!("{json}");
    Ok(())
}
