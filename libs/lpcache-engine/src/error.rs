use std::path::PathBuf;

use lpcache_api::error::{CacheError, ErrorKind};
use lpcache_api::record::Offset;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    /// Persisted consumer state cannot be trusted. The consumer must not
    /// guess a position and refuses to run.
    #[error("corrupt state ({}): {detail}", path.display())]
    CorruptState { path: PathBuf, detail: String },

    #[error("cursor cannot move backwards ({from} -> {to})")]
    CursorRegression { from: Offset, to: Offset },

    #[error("another consumer holds the lock {}", path.display())]
    LockHeld { path: PathBuf },

    #[error("store error: {0}")]
    Store(#[from] CacheError),

    /// A batch could not be delivered and the configured policy halts draining.
    #[error("batch [{first}..={last}] permanently failed after {attempts} attempt(s): {reason}")]
    PermanentFailure {
        first: Offset,
        last: Offset,
        attempts: u32,
        reason: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// The store is unavailable right now; worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Store(e) if e.kind() == ErrorKind::Unavailable)
    }
}
