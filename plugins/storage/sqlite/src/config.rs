use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use lpcache_api::error::CacheError;

// ════════════════════════════════════════════════════════════════
//  Configuration
// ════════════════════════════════════════════════════════════════

/// `[cache]` section: where the cache file lives and how long to wait on a
/// writer holding the database lock.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteStoreConfig {
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// SQLite busy timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Consumer cursor file. Default: `<path>.cursor`.
    #[serde(default)]
    pub cursor_path: Option<PathBuf>,

    /// Single-consumer lock file. Default: `<path>.lock`.
    #[serde(default)]
    pub lock_path: Option<PathBuf>,
}

fn default_path() -> PathBuf {
    PathBuf::from("data/line-protocol-cache/cache.sqlite")
}

fn default_timeout_ms() -> u64 {
    20_000
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            timeout_ms: default_timeout_ms(),
            cursor_path: None,
            lock_path: None,
        }
    }
}

impl SqliteStoreConfig {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cursor_path(&self) -> PathBuf {
        self.cursor_path.clone().unwrap_or_else(|| sibling(&self.path, ".cursor"))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.lock_path.clone().unwrap_or_else(|| sibling(&self.path, ".lock"))
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.path.as_os_str().is_empty() {
            return Err(CacheError::config("cache.path must not be empty"));
        }
        if self.cursor_path() == self.path || self.lock_path() == self.path {
            return Err(CacheError::config("cache.cursor_path and cache.lock_path must differ from cache.path"));
        }
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}
