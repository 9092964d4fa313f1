use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use lpcache_api::batch::Batch;
use lpcache_api::record::Offset;

use crate::error::EngineError;

/// A batch given up on by the retry controller.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub first_offset: Offset,
    pub last_offset: Offset,
    pub records: usize,
    pub attempts: u32,
    pub reason: String,
    /// `true` when the drain loop moves past the batch (data loss).
    pub skipped: bool,
}

impl Rejection {
    pub fn new(batch: &Batch, attempts: u32, reason: impl Into<String>, skipped: bool) -> Self {
        Self {
            first_offset: batch.first_offset(),
            last_offset: batch.last_offset(),
            records: batch.len(),
            attempts,
            reason: reason.into(),
            skipped,
        }
    }
}

/// Observability boundary for permanently failed batches.
///
/// Rejections are always reported, whatever the policy does next.
pub trait RejectionSink: Send + Sync {
    fn report(&self, rejection: &Rejection, batch: &Batch) -> Result<(), EngineError>;
}

/// Reports rejections through `tracing` at error level.
#[derive(Debug, Default)]
pub struct LogRejections;

impl RejectionSink for LogRejections {
    fn report(&self, rejection: &Rejection, _batch: &Batch) -> Result<(), EngineError> {
        tracing::error!(
            first_offset = rejection.first_offset,
            last_offset = rejection.last_offset,
            records = rejection.records,
            attempts = rejection.attempts,
            skipped = rejection.skipped,
            reason = %rejection.reason,
            "batch permanently rejected"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct DeadLetterEntry<'a> {
    first_offset: Offset,
    last_offset: Offset,
    attempts: u32,
    reason: &'a str,
    lines: Vec<std::borrow::Cow<'a, str>>,
}

/// Appends skipped batches to a JSON-lines file so an operator can replay
/// them. Halted batches stay in the cache and are not written.
#[derive(Debug)]
pub struct DeadLetterFile {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl DeadLetterFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

impl RejectionSink for DeadLetterFile {
    fn report(&self, rejection: &Rejection, batch: &Batch) -> Result<(), EngineError> {
        LogRejections.report(rejection, batch)?;
        if !rejection.skipped {
            return Ok(());
        }

        let entry = DeadLetterEntry {
            first_offset: rejection.first_offset,
            last_offset: rejection.last_offset,
            attempts: rejection.attempts,
            reason: &rejection.reason,
            lines: batch.lines().map(String::from_utf8_lossy).collect(),
        };
        let mut line = serde_json::to_vec(&entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        f.write_all(&line)?;
        f.sync_data()?;

        tracing::warn!(
            path = %self.path.display(),
            first_offset = rejection.first_offset,
            records = rejection.records,
            "skipped batch written to dead-letter file"
        );
        Ok(())
    }
}

/// Counters updated by the drain loop, readable from any task.
#[derive(Debug, Default)]
pub struct DrainStats {
    delivered_batches: AtomicU64,
    delivered_records: AtomicU64,
    skipped_batches: AtomicU64,
    skipped_records: AtomicU64,
    retries: AtomicU64,
}

impl DrainStats {
    pub(crate) fn record_delivered(&self, records: usize) {
        self.delivered_batches.fetch_add(1, Ordering::Relaxed);
        self.delivered_records.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self, records: usize) {
        self.skipped_batches.fetch_add(1, Ordering::Relaxed);
        self.skipped_records.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered_batches(&self) -> u64 {
        self.delivered_batches.load(Ordering::Relaxed)
    }

    pub fn delivered_records(&self) -> u64 {
        self.delivered_records.load(Ordering::Relaxed)
    }

    pub fn skipped_batches(&self) -> u64 {
        self.skipped_batches.load(Ordering::Relaxed)
    }

    pub fn skipped_records(&self) -> u64 {
        self.skipped_records.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}
