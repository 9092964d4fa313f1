use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use lpcache_api::record::Offset;

use crate::error::EngineError;

const CURSOR_VERSION: u32 = 1;

/// On-disk form of the cursor: the offset plus a checksum over it.
#[derive(Debug, Serialize, Deserialize)]
struct CursorFile {
    version: u32,
    offset: Offset,
    crc32: u32,
}

impl CursorFile {
    fn new(offset: Offset) -> Self {
        Self {
            version: CURSOR_VERSION,
            offset,
            crc32: checksum(CURSOR_VERSION, offset),
        }
    }
}

fn checksum(version: u32, offset: Offset) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&version.to_le_bytes());
    hasher.update(&offset.to_le_bytes());
    hasher.finalize()
}

/// Durable consumer cursor.
///
/// Every `advance` replaces the file atomically (temp file → fsync →
/// rename → fsync directory). A crash leaves either the old or the new
/// value on disk, never a torn one.
#[derive(Debug)]
pub struct PositionTracker {
    path: PathBuf,
    current: Option<Offset>,
}

impl PositionTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last value loaded or persisted by this tracker.
    pub fn current(&self) -> Option<Offset> {
        self.current
    }

    /// Load the persisted cursor. `Ok(None)` means no cursor was ever
    /// persisted (first start).
    pub fn load(&mut self) -> Result<Option<Offset>, EngineError> {
        let offset = Self::read(&self.path)?;
        self.current = offset;
        Ok(offset)
    }

    /// Read a cursor file without taking ownership of it.
    pub fn read(path: &Path) -> Result<Option<Offset>, EngineError> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(corrupt(path, format!("read: {e}"))),
        };

        let file: CursorFile = serde_json::from_str(content.trim())
            .map_err(|e| corrupt(path, format!("parse: {e}")))?;

        if file.version != CURSOR_VERSION {
            return Err(corrupt(path, format!("unsupported version {}", file.version)));
        }
        if file.crc32 != checksum(file.version, file.offset) {
            return Err(corrupt(
                path,
                format!("checksum mismatch for offset {}", file.offset),
            ));
        }
        Ok(Some(file.offset))
    }

    /// Durably persist `offset` as the new cursor.
    ///
    /// The cursor never moves backwards; re-persisting the current value is
    /// a no-op.
    pub fn advance(&mut self, offset: Offset) -> Result<(), EngineError> {
        if let Some(current) = self.current {
            if offset < current {
                return Err(EngineError::CursorRegression { from: current, to: offset });
            }
            if offset == current {
                return Ok(());
            }
        }

        self.write_atomic(offset)?;
        tracing::debug!(path = %self.path.display(), offset, "cursor advanced");
        self.current = Some(offset);
        Ok(())
    }

    /// Persist the initial cursor of a first start.
    pub(crate) fn initialize(&mut self, offset: Offset) -> Result<(), EngineError> {
        self.write_atomic(offset)?;
        self.current = Some(offset);
        Ok(())
    }

    fn write_atomic(&self, offset: Offset) -> Result<(), EngineError> {
        let temp_path = temp_path(&self.path);
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &CursorFile::new(offset))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        fs::rename(&temp_path, &self.path)?;
        sync_parent_dir(&self.path)?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => File::open(dir)?.sync_all(),
        None => File::open(".")?.sync_all(),
    }
}

// Directory handles cannot be fsynced here; the rename itself is atomic.
#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn corrupt(path: &Path, detail: String) -> EngineError {
    EngineError::CorruptState {
        path: path.to_path_buf(),
        detail,
    }
}
