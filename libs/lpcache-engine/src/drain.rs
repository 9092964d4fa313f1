use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use lpcache_api::delivery::DeliveryClient;
use lpcache_api::error::CacheError;
use lpcache_api::record::Offset;
use lpcache_api::store::CacheStore;

use crate::batch::{BatchAssembler, sleep_or_cancel};
use crate::config::{DrainConfig, RetryPolicy, StartPosition};
use crate::cursor::PositionTracker;
use crate::error::EngineError;
use crate::gauge::BacklogGauge;
use crate::report::{DeadLetterFile, DrainStats, LogRejections, RejectionSink};
use crate::retry::{Backoff, Resolution, RetryController};

/// Final state of a drain run that stopped cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainSummary {
    /// Durable cursor at shutdown.
    pub cursor: Offset,
    pub delivered_batches: u64,
    pub delivered_records: u64,
    pub skipped_batches: u64,
    pub skipped_records: u64,
    pub retries: u64,
}

// ═══════════════════════════════════════════════════════════════
//  DrainLoop
// ═══════════════════════════════════════════════════════════════

/// Moves records from the cache store to a delivery client, one batch at a
/// time, with at-least-once semantics.
///
/// Per cycle: assemble a batch at the cursor, drive it to a resolution, then
/// persist the cursor past it (accepted or skipped). The next batch is only
/// built after the previous cursor write returned, so the durable cursor
/// never passes a record that was not accepted or reported.
///
/// Cancellation is honoured while waiting for data, while sleeping between
/// attempts and between cycles. A delivery attempt or a cursor write is
/// never interrupted.
pub struct DrainLoop {
    store: Arc<dyn CacheStore>,
    client: Arc<dyn DeliveryClient>,
    tracker: PositionTracker,
    assembler: BatchAssembler,
    retry: RetryPolicy,
    rejections: Arc<dyn RejectionSink>,
    seed: Option<u64>,
    start: StartPosition,
    reclaim: bool,
    gauge: Option<BacklogGauge>,
    stats: Arc<DrainStats>,
}

impl DrainLoop {
    pub fn new(
        store: Arc<dyn CacheStore>,
        client: Arc<dyn DeliveryClient>,
        tracker: PositionTracker,
        config: &DrainConfig,
    ) -> Self {
        let assembler = BatchAssembler::new(store.clone(), config.batch, config.poll_interval())
            .with_read_retry(config.retry)
            .with_sample_interval(config.sample_interval());

        let rejections: Arc<dyn RejectionSink> = match &config.dead_letter_path {
            Some(path) => Arc::new(DeadLetterFile::new(path)),
            None => Arc::new(LogRejections),
        };

        Self {
            store,
            client,
            tracker,
            assembler,
            retry: config.retry,
            rejections,
            seed: None,
            start: config.start,
            reclaim: config.reclaim,
            gauge: None,
            stats: Arc::new(DrainStats::default()),
        }
    }

    pub fn with_rejection_sink(mut self, sink: Arc<dyn RejectionSink>) -> Self {
        self.rejections = sink;
        self
    }

    pub fn with_backlog_gauge(mut self, gauge: BacklogGauge) -> Self {
        self.gauge = Some(gauge);
        self
    }

    /// Deterministic backoff jitter, for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Drain until `cancel` fires or a batch fails permanently under the
    /// `halt` policy.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<DrainSummary, EngineError> {
        let Some(mut cursor) = self.resume(&cancel).await? else {
            tracing::info!("drain cancelled before start");
            return Ok(self.summary(self.tracker.current().unwrap_or_default()));
        };
        tracing::info!(
            cursor,
            destination = %self.client.name(),
            cursor_path = %self.tracker.path().display(),
            "drain started"
        );

        if self.reclaim {
            self.reclaim_below(cursor).await;
        }

        let gauge = self
            .gauge
            .take()
            .map(|gauge| gauge.spawn(self.store.clone(), cancel.clone()));

        let mut controller = RetryController::new(self.retry, self.rejections.clone(), self.stats.clone());
        if let Some(seed) = self.seed {
            controller = controller.with_seed(seed);
        }

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            let (batch, candidate) = match self.assembler.next_batch(cursor, &cancel).await {
                Ok(Some(next)) => next,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            let resolution = controller.deliver(&*self.client, &batch, &cancel).await;
            match resolution {
                Resolution::Accepted { attempts } => {
                    if let Err(e) = self.tracker.advance(candidate) {
                        break Err(e);
                    }
                    self.stats.record_delivered(batch.len());
                    tracing::debug!(
                        first_offset = batch.first_offset(),
                        records = batch.len(),
                        attempts,
                        cursor = candidate,
                        "batch delivered"
                    );
                }
                Resolution::Skipped { attempts, reason } => {
                    if let Err(e) = self.tracker.advance(candidate) {
                        break Err(e);
                    }
                    self.stats.record_skipped(batch.len());
                    tracing::warn!(
                        first_offset = batch.first_offset(),
                        last_offset = batch.last_offset(),
                        records = batch.len(),
                        attempts,
                        reason = %reason,
                        cursor = candidate,
                        "batch skipped"
                    );
                }
                Resolution::Halted { attempts, reason } => {
                    break Err(EngineError::PermanentFailure {
                        first: batch.first_offset(),
                        last: batch.last_offset(),
                        attempts,
                        reason,
                    });
                }
                Resolution::Cancelled { .. } => break Ok(()),
            }

            cursor = candidate;
            if self.reclaim {
                self.reclaim_below(cursor).await;
            }
            if let Some(gauge) = &gauge {
                gauge.publish(cursor);
            }
        };

        let summary = self.summary(cursor);
        tracing::info!(
            cursor = summary.cursor,
            delivered_batches = summary.delivered_batches,
            delivered_records = summary.delivered_records,
            skipped_batches = summary.skipped_batches,
            skipped_records = summary.skipped_records,
            retries = summary.retries,
            "drain stopped"
        );
        result.map(|()| summary)
    }

    /// Load the persisted cursor, or place and persist the initial one.
    /// `None` when cancelled while the store was unavailable.
    async fn resume(&mut self, cancel: &CancellationToken) -> Result<Option<Offset>, EngineError> {
        let store = self.store.clone();
        let Some(end) = self.query("end offset", cancel, || store.end_offset()).await? else {
            return Ok(None);
        };

        if let Some(cursor) = self.tracker.load()? {
            if cursor > end {
                return Err(EngineError::CorruptState {
                    path: self.tracker.path().to_path_buf(),
                    detail: format!("cursor {cursor} is past the store end {end}"),
                });
            }
            return Ok(Some(cursor));
        }

        let initial = match self.start {
            StartPosition::Earliest => match self.query("first offset", cancel, || store.first_offset()).await? {
                Some(first) => first.unwrap_or(end),
                None => return Ok(None),
            },
            StartPosition::Latest => end,
            StartPosition::Offset(offset) => offset.min(end),
        };
        self.tracker.initialize(initial)?;
        tracing::info!(cursor = initial, start = ?self.start, "no persisted cursor, starting fresh");
        Ok(Some(initial))
    }

    /// Run a store query, retrying with backoff while the store is
    /// unavailable. Other errors are returned as is. `None` on cancel.
    async fn query<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<Option<T>, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let mut backoff: Option<Backoff> = None;
        loop {
            let e = match op().await {
                Ok(value) => return Ok(Some(value)),
                Err(e) => EngineError::from(e),
            };
            if !e.is_transient() {
                return Err(e);
            }

            let backoff = backoff.get_or_insert_with(|| match self.seed {
                Some(seed) => Backoff::with_seed(&self.retry, seed),
                None => Backoff::new(&self.retry),
            });
            let delay = backoff.next_delay();
            tracing::warn!(
                query = what,
                error = %e,
                attempt = backoff.retries(),
                delay_ms = delay.as_millis() as u64,
                "store unavailable at startup, retrying"
            );
            if sleep_or_cancel(delay, cancel).await {
                return Ok(None);
            }
        }
    }

    /// Best effort: a failed reclaim only delays freeing space.
    async fn reclaim_below(&self, cursor: Offset) {
        match self.store.reclaim(cursor).await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(cursor, removed, "consumed records reclaimed"),
            Err(e) => tracing::warn!(cursor, error = %e, "reclaim failed"),
        }
    }

    fn summary(&self, cursor: Offset) -> DrainSummary {
        DrainSummary {
            cursor,
            delivered_batches: self.stats.delivered_batches(),
            delivered_records: self.stats.delivered_records(),
            skipped_batches: self.stats.skipped_batches(),
            skipped_records: self.stats.skipped_records(),
            retries: self.stats.retries(),
        }
    }
}
