use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use lpcache_api::batch::Batch;
use lpcache_api::delivery::DeliveryClient;
use lpcache_api::record::{Offset, Record};
use lpcache_api::store::CacheStore;

const MEASUREMENT: &str = "line_protocol_cache";

/// Publishes the drain backlog as a line-protocol point to a stats
/// destination.
///
/// One attempt per report. Failures are logged and dropped. Reports run on
/// their own task (see [`BacklogGauge::spawn`]) so a slow stats destination
/// never holds up draining.
pub struct BacklogGauge {
    client: Arc<dyn DeliveryClient>,
}

/// Drain-side handle of a spawned gauge.
///
/// `publish` never waits. Cursors published while a report is in flight
/// collapse into the latest one. Dropping the handle stops the task.
pub struct GaugeHandle {
    latest: watch::Sender<Option<Offset>>,
}

impl GaugeHandle {
    pub fn publish(&self, cursor: Offset) {
        self.latest.send_replace(Some(cursor));
    }
}

impl BacklogGauge {
    pub fn new(client: Arc<dyn DeliveryClient>) -> Self {
        Self { client }
    }

    /// Move the gauge onto its own task. The task stops when `cancel` fires
    /// (abandoning a report in flight) or when the handle is dropped.
    pub fn spawn(self, store: Arc<dyn CacheStore>, cancel: CancellationToken) -> GaugeHandle {
        let (latest, mut updates) = watch::channel(None);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }

                let cursor = *updates.borrow_and_update();
                let Some(cursor) = cursor else {
                    continue;
                };
                tokio::select! {
                    _ = self.report(&*store, cursor) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            tracing::debug!(destination = %self.client.name(), "backlog gauge stopped");
        });

        GaugeHandle { latest }
    }

    async fn report(&self, store: &dyn CacheStore, cursor: Offset) {
        let (end, backlog) = match (store.end_offset().await, store.count_from(cursor).await) {
            (Ok(end), Ok(backlog)) => (end, backlog),
            (Err(e), _) | (_, Err(e)) => {
                tracing::debug!(error = %e, "backlog gauge skipped, store unavailable");
                return;
            }
        };

        let line = point(end.saturating_sub(1), cursor, backlog, now_ns());
        let Some(batch) = Batch::new(vec![Record::new(cursor, line)]) else {
            return;
        };

        let outcome = self.client.deliver(&batch).await;
        if outcome.is_accepted() {
            tracing::trace!(cursor, backlog, "backlog gauge reported");
        } else {
            tracing::warn!(
                destination = %self.client.name(),
                outcome = %outcome,
                "backlog gauge write failed"
            );
        }
    }
}

fn point(max_rowid: Offset, cursor: Offset, backlog: u64, timestamp_ns: u128) -> String {
    format!("{MEASUREMENT} max_rowid={max_rowid}i,cursor={cursor}i,backlog={backlog}i {timestamp_ns}")
}

fn now_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}
