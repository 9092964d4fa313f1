use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags, params};
use tokio::sync::Notify;

use lpcache_api::error::CacheError;
use lpcache_api::record::{Offset, Record};
use lpcache_api::store::CacheStore;

use crate::config::SqliteStoreConfig;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS LineProtocolCache (line_protocol TEXT NOT NULL)";

const INSERT_ROW: &str = "INSERT INTO LineProtocolCache (line_protocol) VALUES (?1)";

const SELECT_FROM: &str = "SELECT rowid, line_protocol FROM LineProtocolCache \
                           WHERE rowid >= ?1 ORDER BY rowid LIMIT ?2";

const SELECT_MIN_ROWID: &str = "SELECT MIN(rowid) FROM LineProtocolCache";

const SELECT_MAX_ROWID: &str = "SELECT MAX(rowid) FROM LineProtocolCache";

const COUNT_FROM: &str = "SELECT COUNT(*) FROM LineProtocolCache WHERE rowid >= ?1";

// The newest row is kept: SQLite without AUTOINCREMENT hands out
// MAX(rowid) + 1, so an emptied table would reuse rowids below the cursor.
const DELETE_BEFORE: &str = "DELETE FROM LineProtocolCache \
                             WHERE rowid < ?1 AND rowid <> (SELECT MAX(rowid) FROM LineProtocolCache)";

// ════════════════════════════════════════════════════════════════
//  SqliteCacheStore
// ════════════════════════════════════════════════════════════════

/// Cache store backed by the `LineProtocolCache` table of a SQLite file,
/// the layout shared with the producers. Offsets are rowids.
///
/// All statements run on the blocking pool; the connection is never held
/// across an await point.
#[derive(Clone)]
pub struct SqliteCacheStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    notify: Arc<Notify>,
}

impl SqliteCacheStore {
    /// Open (creating if needed) the cache file and switch it to WAL.
    pub fn open(config: &SqliteStoreConfig) -> Result<Self, CacheError> {
        config.validate()?;
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| CacheError::unavailable(format!("mkdir {}: {e}", parent.display())))?;
        }

        let conn = Connection::open(&config.path).map_err(sql_err)?;
        conn.busy_timeout(config.timeout()).map_err(sql_err)?;
        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(sql_err)?;
        conn.execute(CREATE_TABLE, []).map_err(sql_err)?;

        tracing::info!(
            path = %config.path.display(),
            journal_mode = %mode,
            timeout_ms = config.timeout_ms,
            "cache store opened"
        );

        Ok(Self::from_connection(config, conn))
    }

    /// Open an existing cache file for inspection. Creates nothing and
    /// leaves the journal mode alone.
    pub fn open_read_only(config: &SqliteStoreConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let conn = Connection::open_with_flags(&config.path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| sql_err(e).with_context(config.path.display()))?;
        conn.busy_timeout(config.timeout()).map_err(sql_err)?;

        tracing::debug!(path = %config.path.display(), "cache store opened read-only");
        Ok(Self::from_connection(config, conn))
    }

    fn from_connection(config: &SqliteStoreConfig, conn: Connection) -> Self {
        Self {
            path: config.path.clone(),
            conn: Arc::new(Mutex::new(conn)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writer path: insert `lines` in one transaction and return their
    /// offsets. Wakes a consumer waiting in this process.
    pub async fn append<I, L>(&self, lines: I) -> Result<Vec<Offset>, CacheError>
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        if lines.is_empty() {
            return Ok(Vec::new());
        }

        let offsets = self
            .blocking(move |conn| {
                let tx = conn.transaction().map_err(sql_err)?;
                let mut offsets = Vec::with_capacity(lines.len());
                {
                    let mut stmt = tx.prepare_cached(INSERT_ROW).map_err(sql_err)?;
                    for line in &lines {
                        stmt.execute(params![line]).map_err(sql_err)?;
                        offsets.push(to_offset(tx.last_insert_rowid()));
                    }
                }
                tx.commit().map_err(sql_err)?;
                Ok(offsets)
            })
            .await?;

        self.notify.notify_waiters();
        tracing::debug!(count = offsets.len(), "lines appended");
        Ok(offsets)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, CacheError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| CacheError::unavailable(format!("blocking task: {e}")))?
    }

    async fn max_rowid(&self) -> Result<Option<Offset>, CacheError> {
        self.blocking(|conn| {
            let max: Option<i64> = conn
                .query_row(SELECT_MAX_ROWID, [], |row| row.get(0))
                .map_err(sql_err)?;
            Ok(max.map(to_offset))
        })
        .await
    }
}

impl CacheStore for SqliteCacheStore {
    fn read_from(
        &self,
        from: Offset,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Record>, CacheError>> + Send + '_>> {
        Box::pin(self.blocking(move |conn| {
            let mut stmt = conn.prepare_cached(SELECT_FROM).map_err(sql_err)?;
            let mut rows = stmt
                .query(params![to_rowid(from), i64::try_from(limit).unwrap_or(i64::MAX)])
                .map_err(sql_err)?;

            let mut records = Vec::new();
            while let Some(row) = rows.next().map_err(sql_err)? {
                let rowid: i64 = row.get(0).map_err(sql_err)?;
                let line = match row.get_ref(1).map_err(sql_err)? {
                    ValueRef::Text(text) => text.to_vec(),
                    ValueRef::Blob(blob) => blob.to_vec(),
                    other => {
                        return Err(CacheError::format(format!(
                            "invalid row {rowid}: expected text, got {:?}",
                            other.data_type()
                        )));
                    }
                };
                records.push(Record::new(to_offset(rowid), line));
            }
            Ok(records)
        }))
    }

    fn first_offset(&self) -> Pin<Box<dyn Future<Output = Result<Option<Offset>, CacheError>> + Send + '_>> {
        Box::pin(self.blocking(|conn| {
            let min: Option<i64> = conn
                .query_row(SELECT_MIN_ROWID, [], |row| row.get(0))
                .map_err(sql_err)?;
            Ok(min.map(to_offset))
        }))
    }

    fn end_offset(&self) -> Pin<Box<dyn Future<Output = Result<Offset, CacheError>> + Send + '_>> {
        Box::pin(async move { Ok(self.max_rowid().await?.map_or(1, |max| max + 1)) })
    }

    fn count_from(&self, from: Offset) -> Pin<Box<dyn Future<Output = Result<u64, CacheError>> + Send + '_>> {
        Box::pin(self.blocking(move |conn| {
            let count: i64 = conn
                .query_row(COUNT_FROM, params![to_rowid(from)], |row| row.get(0))
                .map_err(sql_err)?;
            Ok(to_offset(count))
        }))
    }

    fn reclaim(&self, before: Offset) -> Pin<Box<dyn Future<Output = Result<u64, CacheError>> + Send + '_>> {
        Box::pin(self.blocking(move |conn| {
            let removed = conn.execute(DELETE_BEFORE, params![to_rowid(before)]).map_err(sql_err)?;
            Ok(removed as u64)
        }))
    }

    fn wait_for_data(&self, from: Offset, timeout: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Producers in other processes cannot notify; the caller's
            // timeout doubles as the poll interval for them.
            if matches!(self.max_rowid().await, Ok(Some(max)) if max >= from) {
                return;
            }
            let _ = tokio::time::timeout(timeout, notified).await;
        })
    }
}

// ════════════════════════════════════════════════════════════════
//  Helpers
// ════════════════════════════════════════════════════════════════

fn sql_err(e: rusqlite::Error) -> CacheError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::SystemIoFailure
            | ErrorCode::CannotOpen
            | ErrorCode::DiskFull
            | ErrorCode::OutOfMemory => CacheError::unavailable(format!("sqlite: {e}")),
            _ => CacheError::corrupt(format!("sqlite: {e}")),
        },
        rusqlite::Error::InvalidColumnType(..) | rusqlite::Error::FromSqlConversionFailure(..) => {
            CacheError::format(format!("sqlite: {e}"))
        }
        _ => CacheError::corrupt(format!("sqlite: {e}")),
    }
}

fn to_rowid(offset: Offset) -> i64 {
    i64::try_from(offset).unwrap_or(i64::MAX)
}

fn to_offset(rowid: i64) -> Offset {
    rowid.max(0) as Offset
}
