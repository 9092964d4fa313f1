use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::EngineError;

/// Exclusive ownership of a cursor/store pair.
///
/// Two drainers on the same cache would double-deliver and race on the
/// cursor. The lock is an OS advisory lock on an open file, so it is
/// released on drop and also when the process dies.
#[derive(Debug)]
pub struct ConsumerLock {
    path: PathBuf,
    file: File,
}

impl ConsumerLock {
    /// Try to take the lock without waiting.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if !is_contended(&e) {
                return Err(EngineError::Io(e));
            }
            tracing::debug!(path = %path.display(), error = %e, "lock busy");
            return Err(EngineError::LockHeld { path });
        }

        // Owner pid, for operators only. Failing to write it is not fatal.
        if file.set_len(0).is_ok() {
            let _ = writeln!(file, "{}", std::process::id());
            let _ = file.flush();
        }

        tracing::info!(path = %path.display(), "consumer lock acquired");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Another handle holds the lock, as opposed to the lock call failing.
fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || (e.raw_os_error().is_some() && e.raw_os_error() == fs2::lock_contended_error().raw_os_error())
}

impl Drop for ConsumerLock {
    fn drop(&mut self) {
        // Explicit fs2 call to avoid the std `File::unlock` of newer toolchains.
        let _ = fs2::FileExt::unlock(&self.file);
        tracing::debug!(path = %self.path.display(), "consumer lock released");
    }
}
