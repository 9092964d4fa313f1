use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use lpcache_api::batch::Batch;
use lpcache_api::delivery::{DeliveryClient, Outcome};
use lpcache_api::record::Offset;
use lpcache_engine::{
    BacklogGauge, BatchLimits, DrainConfig, DrainLoop, EngineError, PermanentFailurePolicy, PositionTracker, Rejection,
    RejectionSink, RetryPolicy, StartPosition,
};
use lpcache_storage_memory::MemoryCacheStore;

// ─── fakes ───────────────────────────────────────────────────────

/// Records every attempt; answers from a script, then accepts.
#[derive(Default)]
struct Recorder {
    script: Mutex<VecDeque<Outcome>>,
    attempts: Mutex<Vec<Vec<Offset>>>,
    accepted: Mutex<Vec<Offset>>,
}

impl Recorder {
    fn scripted(outcomes: Vec<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes.into()),
            ..Self::default()
        })
    }

    fn attempts(&self) -> Vec<Vec<Offset>> {
        self.attempts.lock().unwrap().clone()
    }

    fn accepted(&self) -> Vec<Offset> {
        self.accepted.lock().unwrap().clone()
    }
}

impl DeliveryClient for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn deliver<'a>(&'a self, batch: &'a Batch) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let offsets: Vec<Offset> = batch.records().iter().map(|r| r.offset).collect();
            self.attempts.lock().unwrap().push(offsets.clone());
            let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Outcome::Accepted);
            if outcome.is_accepted() {
                self.accepted.lock().unwrap().extend(offsets);
            }
            outcome
        })
    }
}

/// Accepts every batch except the one holding `at`, whose attempt never
/// returns. With `accept_first` those records reach downstream before the
/// hang, like a write acknowledged just as the process dies.
#[derive(Default)]
struct Stall {
    at: Offset,
    accept_first: bool,
    stalled: AtomicBool,
    accepted: Mutex<Vec<Offset>>,
}

impl Stall {
    fn at(at: Offset, accept_first: bool) -> Arc<Self> {
        Arc::new(Self {
            at,
            accept_first,
            ..Self::default()
        })
    }

    fn accepted(&self) -> Vec<Offset> {
        self.accepted.lock().unwrap().clone()
    }
}

impl DeliveryClient for Stall {
    fn name(&self) -> &str {
        "stall"
    }

    fn deliver<'a>(&'a self, batch: &'a Batch) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let offsets: Vec<Offset> = batch.records().iter().map(|r| r.offset).collect();
            if !offsets.contains(&self.at) {
                self.accepted.lock().unwrap().extend(offsets);
                return Outcome::Accepted;
            }
            if self.accept_first {
                self.accepted.lock().unwrap().extend(offsets);
            }
            self.stalled.store(true, Ordering::SeqCst);
            std::future::pending::<Outcome>().await
        })
    }
}

/// Stats destination that takes its time with every write.
struct SlowStats;

impl DeliveryClient for SlowStats {
    fn name(&self) -> &str {
        "slow-stats"
    }

    fn deliver<'a>(&'a self, _batch: &'a Batch) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Outcome::Accepted
        })
    }
}

#[derive(Default)]
struct Collect(Mutex<Vec<Rejection>>);

impl RejectionSink for Collect {
    fn report(&self, rejection: &Rejection, _batch: &Batch) -> Result<(), EngineError> {
        self.0.lock().unwrap().push(rejection.clone());
        Ok(())
    }
}

// ─── helpers ─────────────────────────────────────────────────────

fn config() -> DrainConfig {
    DrainConfig {
        poll_interval_ms: 10,
        batch: BatchLimits {
            max_count: 3,
            max_bytes: 1_024,
            max_wait_ms: 0,
        },
        retry: RetryPolicy {
            base_delay_ms: 1,
            max_delay_ms: 4,
            ..RetryPolicy::default()
        },
        ..DrainConfig::default()
    }
}

fn cursor_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("cache.cursor")
}

fn drain(
    store: &Arc<MemoryCacheStore>,
    client: &Arc<Recorder>,
    dir: &tempfile::TempDir,
    config: &DrainConfig,
) -> DrainLoop {
    drain_to(store, client.clone(), dir, config)
}

fn drain_to(
    store: &Arc<MemoryCacheStore>,
    client: Arc<dyn DeliveryClient>,
    dir: &tempfile::TempDir,
    config: &DrainConfig,
) -> DrainLoop {
    DrainLoop::new(store.clone(), client, PositionTracker::new(cursor_path(dir)), config).with_seed(11)
}

async fn fill(store: &MemoryCacheStore, n: usize) {
    store.append((0..n).map(|i| format!("cpu,host=a usage={i}i {i}"))).await;
}

/// Run until the cursor reaches `target`, then cancel and return the result.
async fn run_until(
    drain: DrainLoop,
    dir: &tempfile::TempDir,
    target: Offset,
) -> Result<lpcache_engine::DrainSummary, EngineError> {
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(drain.run(cancel.clone()));

    let path = cursor_path(dir);
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if handle.is_finished() {
                return;
            }
            if matches!(PositionTracker::read(&path), Ok(Some(c)) if c >= target) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "cursor never reached {target}");

    cancel.cancel();
    handle.await.unwrap()
}

/// Run until `stall` hangs on its batch, then kill the task without a
/// graceful shutdown.
async fn run_until_stalled(drain: DrainLoop, stall: &Stall) {
    let handle = tokio::spawn(drain.run(CancellationToken::new()));
    let stalled = tokio::time::timeout(Duration::from_secs(10), async {
        while !stall.stalled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(stalled.is_ok(), "delivery never reached offset {}", stall.at);

    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());
}

fn merged(mut seen: Vec<Offset>) -> Vec<Offset> {
    seen.sort_unstable();
    seen.dedup();
    seen
}

// ─── tests ───────────────────────────────────────────────────────

#[tokio::test]
async fn delivers_every_record_once_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    fill(&store, 10).await;
    let client = Recorder::scripted(Vec::new());

    let summary = run_until(drain(&store, &client, &dir, &config()), &dir, 11).await.unwrap();

    assert_eq!(client.accepted(), (1..=10).collect::<Vec<_>>());
    assert_eq!(summary.cursor, 11);
    assert_eq!(summary.delivered_records, 10);
    assert_eq!(summary.delivered_batches, 4);
    assert!(client.attempts().iter().all(|batch| batch.len() <= 3));
}

#[tokio::test]
async fn consumed_records_are_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    fill(&store, 5).await;
    let client = Recorder::scripted(Vec::new());

    run_until(drain(&store, &client, &dir, &config()), &dir, 6).await.unwrap();

    assert!(store.snapshot().await.is_empty());
    // New appends continue above the cursor.
    assert_eq!(store.append(["late v=1"]).await, vec![6]);
}

#[tokio::test]
async fn restart_resumes_without_loss() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    fill(&store, 6).await;
    let cfg = DrainConfig { reclaim: false, ..config() };

    let first = Recorder::scripted(Vec::new());
    run_until(drain(&store, &first, &dir, &cfg), &dir, 4).await.unwrap();
    let persisted = PositionTracker::read(&cursor_path(&dir)).unwrap().unwrap();
    assert!(persisted >= 4);

    fill(&store, 3).await;
    let second = Recorder::scripted(Vec::new());
    run_until(drain(&store, &second, &dir, &cfg), &dir, 10).await.unwrap();

    let mut seen = first.accepted();
    seen.extend(second.accepted());
    seen.dedup();
    assert_eq!(seen, (1..=9).collect::<Vec<_>>());
    assert!(second.accepted().iter().all(|&o| o >= persisted));
}

#[tokio::test]
async fn restart_on_drained_store_sends_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    fill(&store, 2).await;

    let first = Recorder::scripted(Vec::new());
    run_until(drain(&store, &first, &dir, &config()), &dir, 3).await.unwrap();

    let second = Recorder::scripted(Vec::new());
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(drain(&store, &second, &dir, &config()).run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(60)).await;
    cancel.cancel();

    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.cursor, 3);
    assert!(second.attempts().is_empty());
}

#[tokio::test]
async fn network_failures_then_accept_advance_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    fill(&store, 3).await;
    let client = Recorder::scripted(vec![
        Outcome::NetworkFailure("connection refused".into()),
        Outcome::NetworkFailure("connection refused".into()),
        Outcome::Accepted,
    ]);

    let summary = run_until(drain(&store, &client, &dir, &config()), &dir, 4).await.unwrap();

    let attempts = client.attempts();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a == &vec![1, 2, 3]));
    assert_eq!(summary.cursor, 4);
    assert_eq!(summary.retries, 2);
    assert_eq!(summary.delivered_batches, 1);
    assert_eq!(PositionTracker::read(&cursor_path(&dir)).unwrap(), Some(4));
}

#[tokio::test]
async fn skip_policy_moves_past_rejected_batch() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    fill(&store, 5).await;
    let client = Recorder::scripted(vec![Outcome::RejectedPermanent("400: unable to parse".into())]);
    let mut cfg = config();
    cfg.retry.on_permanent_failure = PermanentFailurePolicy::Skip;
    let sink = Arc::new(Collect::default());

    let drain = drain(&store, &client, &dir, &cfg).with_rejection_sink(sink.clone());
    let summary = run_until(drain, &dir, 6).await.unwrap();

    assert_eq!(client.accepted(), vec![4, 5]);
    assert_eq!(summary.skipped_batches, 1);
    assert_eq!(summary.skipped_records, 3);
    let rejections = sink.0.lock().unwrap();
    assert_eq!(rejections.len(), 1);
    assert!(rejections[0].skipped);
    assert_eq!((rejections[0].first_offset, rejections[0].last_offset), (1, 3));
}

#[tokio::test]
async fn halt_policy_stops_and_keeps_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    fill(&store, 5).await;
    let client = Recorder::scripted(vec![Outcome::RejectedPermanent("400: unable to parse".into())]);

    let result = drain(&store, &client, &dir, &config())
        .run(CancellationToken::new())
        .await;

    match result {
        Err(EngineError::PermanentFailure { first, last, attempts, .. }) => {
            assert_eq!((first, last, attempts), (1, 3, 1));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(PositionTracker::read(&cursor_path(&dir)).unwrap(), Some(1));
    assert_eq!(store.snapshot().await.len(), 5);
}

#[tokio::test]
async fn cursor_past_store_end_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    fill(&store, 2).await;
    PositionTracker::new(cursor_path(&dir)).advance(50).unwrap();
    let client = Recorder::scripted(Vec::new());

    let result = drain(&store, &client, &dir, &config())
        .run(CancellationToken::new())
        .await;

    assert!(matches!(result, Err(EngineError::CorruptState { .. })));
    assert!(client.attempts().is_empty());
}

#[tokio::test]
async fn latest_start_skips_existing_backlog() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    fill(&store, 4).await;
    let client = Recorder::scripted(Vec::new());
    let cfg = DrainConfig {
        start: StartPosition::Latest,
        ..config()
    };

    let writer = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        writer.append(["fresh v=1"]).await;
    });
    run_until(drain(&store, &client, &dir, &cfg), &dir, 6).await.unwrap();

    assert_eq!(client.accepted(), vec![5]);
}

#[tokio::test]
async fn transient_store_errors_do_not_stop_draining() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    fill(&store, 2).await;
    store.fail_next_reads(3);
    let client = Recorder::scripted(Vec::new());

    let summary = run_until(drain(&store, &client, &dir, &config()), &dir, 3).await.unwrap();
    assert_eq!(summary.cursor, 3);
    assert_eq!(client.accepted(), vec![1, 2]);
}

#[tokio::test]
async fn store_unavailable_at_startup_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    fill(&store, 2).await;
    // Fails the end offset query, then the first offset query.
    store.fail_next_queries(2);
    let client = Recorder::scripted(Vec::new());

    let summary = run_until(drain(&store, &client, &dir, &config()), &dir, 3).await.unwrap();

    assert_eq!(summary.cursor, 3);
    assert_eq!(client.accepted(), vec![1, 2]);
}

#[tokio::test]
async fn shutdown_while_store_unavailable_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    fill(&store, 2).await;
    store.fail_next_queries(usize::MAX);
    let client = Recorder::scripted(Vec::new());

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(drain(&store, &client, &dir, &config()).run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(!handle.is_finished());
    cancel.cancel();

    handle.await.unwrap().unwrap();
    assert!(client.attempts().is_empty());
    assert_eq!(PositionTracker::read(&cursor_path(&dir)).unwrap(), None);
}

#[tokio::test]
async fn slow_stats_destination_does_not_hold_up_draining() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    fill(&store, 4).await;
    let client = Recorder::scripted(Vec::new());
    let cfg = DrainConfig {
        batch: BatchLimits {
            max_count: 1,
            ..config().batch
        },
        ..config()
    };

    let started = Instant::now();
    let drain = drain(&store, &client, &dir, &cfg).with_backlog_gauge(BacklogGauge::new(Arc::new(SlowStats)));
    let summary = run_until(drain, &dir, 5).await.unwrap();

    assert_eq!(summary.delivered_batches, 4);
    assert!(
        started.elapsed() < Duration::from_millis(1_000),
        "draining took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn killed_mid_delivery_resumes_without_loss() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    fill(&store, 9).await;

    let stall = Stall::at(5, false);
    run_until_stalled(drain_to(&store, stall.clone(), &dir, &config()), &stall).await;
    assert_eq!(stall.accepted(), vec![1, 2, 3]);
    assert_eq!(PositionTracker::read(&cursor_path(&dir)).unwrap(), Some(4));

    let second = Recorder::scripted(Vec::new());
    run_until(drain(&store, &second, &dir, &config()), &dir, 10).await.unwrap();

    assert_eq!(second.accepted(), (4..=9).collect::<Vec<_>>());
    let mut seen = stall.accepted();
    seen.extend(second.accepted());
    assert_eq!(merged(seen), (1..=9).collect::<Vec<_>>());
}

#[tokio::test]
async fn killed_after_downstream_accept_redelivers_batch() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    fill(&store, 9).await;

    // Batch [4, 5, 6] reaches downstream but the cursor never moves past it.
    let stall = Stall::at(5, true);
    run_until_stalled(drain_to(&store, stall.clone(), &dir, &config()), &stall).await;
    assert_eq!(stall.accepted(), (1..=6).collect::<Vec<_>>());
    assert_eq!(PositionTracker::read(&cursor_path(&dir)).unwrap(), Some(4));

    let second = Recorder::scripted(Vec::new());
    run_until(drain(&store, &second, &dir, &config()), &dir, 10).await.unwrap();

    // Duplicates are allowed, gaps are not.
    assert_eq!(second.accepted(), (4..=9).collect::<Vec<_>>());
    let mut seen = stall.accepted();
    seen.extend(second.accepted());
    assert_eq!(merged(seen), (1..=9).collect::<Vec<_>>());
}

#[tokio::test]
async fn leftover_temp_cursor_after_kill_is_not_corrupt_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCacheStore::new());
    fill(&store, 6).await;

    let stall = Stall::at(4, false);
    run_until_stalled(drain_to(&store, stall.clone(), &dir, &config()), &stall).await;
    // A kill between writing the temp file and renaming it.
    std::fs::write(dir.path().join("cache.cursor.tmp"), "{\"version\":1,\"off").unwrap();

    let second = Recorder::scripted(Vec::new());
    let summary = run_until(drain(&store, &second, &dir, &config()), &dir, 7).await.unwrap();

    assert_eq!(summary.cursor, 7);
    assert_eq!(second.accepted(), vec![4, 5, 6]);
    let mut seen = stall.accepted();
    seen.extend(second.accepted());
    assert_eq!(merged(seen), (1..=6).collect::<Vec<_>>());
}
