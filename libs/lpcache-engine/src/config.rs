use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use lpcache_api::record::Offset;

use crate::error::EngineError;

/// Drain loop configuration: the `[drain]` section of the consumer config.
#[derive(Debug, Clone, Deserialize)]
pub struct DrainConfig {
    /// Where a consumer without a persisted cursor starts reading.
    #[serde(default)]
    pub start: StartPosition,

    /// Delete consumed records from the store after each advance.
    #[serde(default = "default_reclaim")]
    pub reclaim: bool,

    /// Upper bound on an idle wait before the store is re-read.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Log one cached line every N ms. `0` logs every line, absent disables.
    #[serde(default)]
    pub sample_interval_ms: Option<u64>,

    /// JSON-lines file receiving batches skipped by the `skip` policy.
    #[serde(default)]
    pub dead_letter_path: Option<PathBuf>,

    #[serde(default)]
    pub batch: BatchLimits,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_reclaim() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            start: StartPosition::default(),
            reclaim: default_reclaim(),
            poll_interval_ms: default_poll_interval_ms(),
            sample_interval_ms: None,
            dead_letter_path: None,
            batch: BatchLimits::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl DrainConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sample_interval(&self) -> Option<Duration> {
        self.sample_interval_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.poll_interval_ms == 0 {
            return Err(EngineError::Config("drain.poll_interval_ms must be > 0".into()));
        }
        self.batch.validate()?;
        self.retry.validate()
    }
}

/// Starting point for a consumer that has never persisted a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Oldest record still in the store.
    #[default]
    Earliest,
    /// Current append end: skip whatever is already cached.
    Latest,
    /// Explicit offset, clamped to the store's append end.
    Offset(Offset),
}

/// Bounds on one delivery batch. Whichever limit is hit first closes it.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BatchLimits {
    #[serde(default = "default_max_count")]
    pub max_count: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    /// Longest time a partially filled batch waits for more records.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

// 5000 lines is the write batch size InfluxDB recommends.
fn default_max_count() -> usize {
    5_000
}

fn default_max_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_max_wait_ms() -> u64 {
    5_000
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_count: default_max_count(),
            max_bytes: default_max_bytes(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl BatchLimits {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_count == 0 {
            return Err(EngineError::Config("drain.batch.max_count must be > 0".into()));
        }
        if self.max_bytes == 0 {
            return Err(EngineError::Config("drain.batch.max_bytes must be > 0".into()));
        }
        Ok(())
    }
}

/// What happens to a batch that can never be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermanentFailurePolicy {
    /// Stop draining and surface the failure; an operator must intervene.
    #[default]
    Halt,
    /// Report the batch and move past it. Data loss, always reported.
    Skip,
}

/// Backoff and escalation for failed delivery attempts.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry; doubles on every further attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on the nominal delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of the nominal delay used as the randomization window:
    /// a delay falls within `[nominal * (1 - jitter), nominal]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Attempts after which a batch counts as permanently failed.
    /// Absent: retry forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub on_permanent_failure: PermanentFailurePolicy,
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            max_attempts: None,
            on_permanent_failure: PermanentFailurePolicy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.base_delay_ms == 0 {
            return Err(EngineError::Config("drain.retry.base_delay_ms must be > 0".into()));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(EngineError::Config(format!(
                "drain.retry.base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(EngineError::Config(format!(
                "drain.retry.jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(EngineError::Config("drain.retry.max_attempts must be > 0".into()));
        }
        Ok(())
    }
}
