use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use lpcache_api::batch::Batch;
use lpcache_api::error::CacheError;
use lpcache_api::record::{Offset, Record};
use lpcache_api::store::CacheStore;

use crate::config::{BatchLimits, RetryPolicy};
use crate::error::EngineError;
use crate::retry::Backoff;

/// Logs one cached line per interval. `Duration::ZERO` logs every line.
#[derive(Debug)]
struct LineSampler {
    interval: Option<Duration>,
    last: Option<Instant>,
}

impl LineSampler {
    fn observe(&mut self, record: &Record) {
        let Some(interval) = self.interval else {
            return;
        };
        let now = Instant::now();
        if self.last.is_none_or(|last| now.duration_since(last) >= interval) {
            tracing::info!(offset = record.offset, line = %record.line_lossy(), "sampled line");
            self.last = Some(now);
        }
    }
}

/// Records already read from the store but left out of the previous batch.
#[derive(Debug)]
struct Lookahead {
    from: Offset,
    records: VecDeque<Record>,
}

/// Groups unconsumed records into bounded batches.
///
/// A batch closes when it holds `max_count` records, when the next record
/// would push it past `max_bytes`, or once `max_wait` has elapsed since its
/// first record. A record larger than `max_bytes` forms a batch of its own.
/// With nothing to read the assembler waits (store notification or poll
/// interval) instead of returning an empty batch.
pub struct BatchAssembler {
    store: Arc<dyn CacheStore>,
    limits: BatchLimits,
    poll_interval: Duration,
    read_retry: RetryPolicy,
    sampler: LineSampler,
    lookahead: Option<Lookahead>,
}

impl BatchAssembler {
    pub fn new(store: Arc<dyn CacheStore>, limits: BatchLimits, poll_interval: Duration) -> Self {
        Self {
            store,
            limits,
            poll_interval,
            read_retry: RetryPolicy::default(),
            sampler: LineSampler {
                interval: None,
                last: None,
            },
            lookahead: None,
        }
    }

    /// Backoff applied to transient store read failures.
    pub fn with_read_retry(mut self, policy: RetryPolicy) -> Self {
        self.read_retry = policy;
        self
    }

    pub fn with_sample_interval(mut self, interval: Option<Duration>) -> Self {
        self.sampler.interval = interval;
        self
    }

    /// Assemble the next batch starting at `cursor`.
    ///
    /// Returns the batch and the candidate cursor (offset after its last
    /// record), or `None` when `cancel` fired first. The candidate is not
    /// durable until the drain loop persists it.
    pub async fn next_batch(
        &mut self,
        cursor: Offset,
        cancel: &CancellationToken,
    ) -> Result<Option<(Batch, Offset)>, EngineError> {
        let mut records: Vec<Record> = Vec::new();
        let mut bytes: usize = 0;
        let mut next = cursor;
        let mut deadline: Option<Instant> = None;
        let mut read_backoff: Option<Backoff> = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let limit = self.limits.max_count - records.len();
            let chunk = match self.read(next, limit).await {
                Ok(chunk) => {
                    read_backoff = None;
                    chunk
                }
                Err(e) if e.is_transient() => {
                    let backoff = read_backoff.get_or_insert_with(|| Backoff::new(&self.read_retry));
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        from = next,
                        error = %e,
                        attempt = backoff.retries(),
                        delay_ms = delay.as_millis() as u64,
                        "store unavailable, retrying read"
                    );
                    if sleep_or_cancel(delay, cancel).await {
                        return Ok(None);
                    }
                    continue;
                }
                Err(e) => return Err(EngineError::Store(e.with_context(format!("read from {next}")))),
            };

            let mut full = false;
            let mut chunk = chunk.into_iter();
            while let Some(record) = chunk.next() {
                if records.len() >= self.limits.max_count
                    || (!records.is_empty() && bytes + record.len() > self.limits.max_bytes)
                {
                    let mut rest: VecDeque<Record> = VecDeque::from([record]);
                    rest.extend(chunk);
                    self.lookahead = Some(Lookahead { from: next, records: rest });
                    full = true;
                    break;
                }

                next = record.next_offset();
                bytes += record.len();
                self.sampler.observe(&record);
                records.push(record);
                if deadline.is_none() {
                    deadline = Some(Instant::now() + self.limits.max_wait());
                }
            }

            if full || records.len() >= self.limits.max_count || bytes >= self.limits.max_bytes {
                break;
            }

            // Caught up with the writer: wait for more, but not past the deadline.
            let wait = match deadline {
                None => self.poll_interval,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    (deadline - now).min(self.poll_interval)
                }
            };

            tokio::select! {
                _ = self.store.wait_for_data(next, wait) => {}
                _ = cancel.cancelled() => return Ok(None),
            }
        }

        Ok(Batch::new(records).map(|batch| {
            let candidate = batch.next_offset();
            tracing::debug!(
                first_offset = batch.first_offset(),
                records = batch.len(),
                bytes = batch.byte_size(),
                "batch assembled"
            );
            (batch, candidate)
        }))
    }

    /// Serve from the lookahead when it continues exactly at `from`,
    /// otherwise read the store.
    async fn read(&mut self, from: Offset, limit: usize) -> Result<Vec<Record>, CacheError> {
        if let Some(mut lookahead) = self.lookahead.take() {
            if lookahead.from == from && !lookahead.records.is_empty() {
                let take = limit.min(lookahead.records.len());
                let chunk: Vec<Record> = lookahead.records.drain(..take).collect();
                if !lookahead.records.is_empty() {
                    if let Some(last) = chunk.last() {
                        lookahead.from = last.next_offset();
                    }
                    self.lookahead = Some(lookahead);
                }
                return Ok(chunk);
            }
        }
        self.store.read_from(from, limit).await
    }
}

/// Returns `true` when cancelled before the delay elapsed.
pub(crate) async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = cancel.cancelled() => true,
    }
}
