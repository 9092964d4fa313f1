use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use lpcache_api::batch::Batch;
use lpcache_api::delivery::{DeliveryClient, Outcome};

use crate::config::{PermanentFailurePolicy, RetryPolicy};
use crate::report::{DrainStats, Rejection, RejectionSink};

// ════════════════════════════════════════════════════════════════
//  Backoff
// ════════════════════════════════════════════════════════════════

/// Exponential backoff with jitter for one batch.
///
/// The nominal delay doubles per retry up to `max_delay_ms`. Each delay is
/// drawn from `[nominal * (1 - jitter), nominal]`. While the nominal delay
/// is still growing a delay never falls below the previous one; at the cap
/// every delay is drawn afresh from the cap's window.
#[derive(Debug)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
    jitter: f64,
    retries: u32,
    last_ms: u64,
    rng: StdRng,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    /// Deterministic jitter, for tests.
    pub fn with_seed(policy: &RetryPolicy, seed: u64) -> Self {
        Self::with_rng(policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: &RetryPolicy, rng: StdRng) -> Self {
        Self {
            base_ms: policy.base_delay_ms,
            cap_ms: policy.max_delay_ms.max(policy.base_delay_ms),
            jitter: policy.jitter.clamp(0.0, 1.0),
            retries: 0,
            last_ms: 0,
            rng,
        }
    }

    /// Number of delays handed out so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Nominal (un-jittered) delay before retry number `retry` (0-based).
    pub fn nominal(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.cap_ms))
    }

    /// Jitter window for retry number `retry`: `(low, high)` inclusive.
    pub fn window(&self, retry: u32) -> (Duration, Duration) {
        let high = self.nominal(retry).as_millis() as u64;
        let span = (high as f64 * self.jitter).floor() as u64;
        (Duration::from_millis(high - span.min(high)), Duration::from_millis(high))
    }

    pub fn next_delay(&mut self) -> Duration {
        let (low, high) = self.window(self.retries);
        let (low, high) = (low.as_millis() as u64, high.as_millis() as u64);
        let sampled = if low == high { high } else { self.rng.gen_range(low..=high) };
        let delay = if high < self.cap_ms {
            sampled.max(self.last_ms).min(high)
        } else {
            sampled
        };

        self.retries = self.retries.saturating_add(1);
        self.last_ms = delay;
        Duration::from_millis(delay)
    }
}

// ════════════════════════════════════════════════════════════════
//  RetryController
// ════════════════════════════════════════════════════════════════

/// Terminal state of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Downstream accepted the batch; the cursor may move past it.
    Accepted { attempts: u32 },
    /// Permanently failed under the `skip` policy; the cursor moves past it
    /// and the loss has been reported.
    Skipped { attempts: u32, reason: String },
    /// Permanently failed under the `halt` policy; draining must stop.
    Halted { attempts: u32, reason: String },
    /// Stop requested during a backoff sleep. The batch stays unresolved and
    /// is delivered again on the next start.
    Cancelled { attempts: u32 },
}

/// Drives one batch through `Pending -> Attempting -> {Accepted,
/// PermanentlyFailed, Attempting(retry)}`.
///
/// The same batch (same records, same order) is re-sent on every retry and
/// the controller returns only once it is resolved, so no later batch is
/// ever in flight before an earlier one.
pub struct RetryController {
    policy: RetryPolicy,
    rejections: Arc<dyn RejectionSink>,
    stats: Arc<DrainStats>,
    seed: Option<u64>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, rejections: Arc<dyn RejectionSink>, stats: Arc<DrainStats>) -> Self {
        Self {
            policy,
            rejections,
            stats,
            seed: None,
        }
    }

    /// Seed the jitter of every backoff sequence, for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Deliver `batch` until it resolves.
    ///
    /// Cancellation is honoured only while sleeping between attempts. An
    /// attempt in flight always runs to its own completion or timeout.
    pub async fn deliver(
        &self,
        client: &dyn DeliveryClient,
        batch: &Batch,
        cancel: &CancellationToken,
    ) -> Resolution {
        let mut backoff = match self.seed {
            Some(seed) => Backoff::with_seed(&self.policy, seed),
            None => Backoff::new(&self.policy),
        };
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);
            let outcome = client.deliver(batch).await;

            let reason = match &outcome {
                Outcome::Accepted => {
                    if attempts > 1 {
                        tracing::info!(
                            destination = %client.name(),
                            first_offset = batch.first_offset(),
                            attempts,
                            "batch accepted after retries"
                        );
                    }
                    return Resolution::Accepted { attempts };
                }
                Outcome::RejectedPermanent(reason) => {
                    return self.give_up(batch, attempts, reason.clone());
                }
                Outcome::RejectedTransient(_) | Outcome::NetworkFailure(_) => outcome.to_string(),
            };

            if let Some(max) = self.policy.max_attempts {
                if attempts >= max {
                    return self.give_up(batch, attempts, format!("retry ceiling ({max}) reached, last: {reason}"));
                }
            }

            let delay = backoff.next_delay();
            self.stats.record_retry();
            tracing::warn!(
                destination = %client.name(),
                first_offset = batch.first_offset(),
                records = batch.len(),
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "delivery failed, backing off"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    tracing::info!(first_offset = batch.first_offset(), attempts, "backoff interrupted by shutdown");
                    return Resolution::Cancelled { attempts };
                }
            }
        }
    }

    fn give_up(&self, batch: &Batch, attempts: u32, reason: String) -> Resolution {
        let skip = self.policy.on_permanent_failure == PermanentFailurePolicy::Skip;
        let rejection = Rejection::new(batch, attempts, reason.clone(), skip);

        if let Err(e) = self.rejections.report(&rejection, batch) {
            // A skip that cannot be recorded would be silent data loss.
            tracing::error!(error = %e, first_offset = batch.first_offset(), "rejection report failed, halting");
            return Resolution::Halted {
                attempts,
                reason: format!("{reason} (report failed: {e})"),
            };
        }

        if skip {
            Resolution::Skipped { attempts, reason }
        } else {
            Resolution::Halted { attempts, reason }
        }
    }
}
