use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, RwLock};

use lpcache_api::error::CacheError;
use lpcache_api::record::{Offset, Record};
use lpcache_api::store::CacheStore;

// ═══════════════════════════════════════════════════════════════
//  MemoryCacheStore
// ═══════════════════════════════════════════════════════════════

/// In-memory cache store. Nothing survives the process; used for tests and
/// for wiring checks without a cache file.
///
/// Offsets start at 1 and never repeat, even after `reclaim`.
pub struct MemoryCacheStore {
    inner: RwLock<Inner>,
    notify: Notify,
    failing_reads: AtomicUsize,
    failing_queries: AtomicUsize,
}

struct Inner {
    records: VecDeque<Record>,
    next_offset: Offset,
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                records: VecDeque::new(),
                next_offset: 1,
            }),
            notify: Notify::new(),
            failing_reads: AtomicUsize::new(0),
            failing_queries: AtomicUsize::new(0),
        }
    }

    /// Writer path: append lines, return their offsets.
    pub async fn append<I, L>(&self, lines: I) -> Vec<Offset>
    where
        I: IntoIterator<Item = L>,
        L: Into<Vec<u8>>,
    {
        let mut inner = self.inner.write().await;
        let mut offsets = Vec::new();
        for line in lines {
            let offset = inner.next_offset;
            inner.next_offset += 1;
            inner.records.push_back(Record::new(offset, line));
            offsets.push(offset);
        }
        drop(inner);
        if !offsets.is_empty() {
            self.notify.notify_waiters();
        }
        offsets
    }

    /// Make the next `n` reads fail with an `Unavailable` error.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` first/end offset queries fail with an
    /// `Unavailable` error.
    pub fn fail_next_queries(&self, n: usize) {
        self.failing_queries.store(n, Ordering::SeqCst);
    }

    /// Records still held, oldest first.
    pub async fn snapshot(&self) -> Vec<Record> {
        self.inner.read().await.records.iter().cloned().collect()
    }

    fn take_injected_failure(&self) -> bool {
        take_one(&self.failing_reads)
    }

    fn take_injected_query_failure(&self) -> bool {
        take_one(&self.failing_queries)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl CacheStore for MemoryCacheStore {
    fn read_from(
        &self,
        from: Offset,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Record>, CacheError>> + Send + '_>> {
        Box::pin(async move {
            if self.take_injected_failure() {
                return Err(CacheError::unavailable("injected read failure"));
            }
            let inner = self.inner.read().await;
            Ok(inner
                .records
                .iter()
                .filter(|r| r.offset >= from)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn first_offset(&self) -> Pin<Box<dyn Future<Output = Result<Option<Offset>, CacheError>> + Send + '_>> {
        Box::pin(async move {
            if self.take_injected_query_failure() {
                return Err(CacheError::unavailable("injected query failure"));
            }
            Ok(self.inner.read().await.records.front().map(|r| r.offset))
        })
    }

    fn end_offset(&self) -> Pin<Box<dyn Future<Output = Result<Offset, CacheError>> + Send + '_>> {
        Box::pin(async move {
            if self.take_injected_query_failure() {
                return Err(CacheError::unavailable("injected query failure"));
            }
            Ok(self.inner.read().await.next_offset)
        })
    }

    fn count_from(&self, from: Offset) -> Pin<Box<dyn Future<Output = Result<u64, CacheError>> + Send + '_>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner.records.iter().filter(|r| r.offset >= from).count() as u64)
        })
    }

    fn reclaim(&self, before: Offset) -> Pin<Box<dyn Future<Output = Result<u64, CacheError>> + Send + '_>> {
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            let mut removed = 0;
            while inner.records.front().is_some_and(|r| r.offset < before) {
                inner.records.pop_front();
                removed += 1;
            }
            Ok(removed)
        })
    }

    fn wait_for_data(&self, from: Offset, timeout: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so an append in between is not missed.
            notified.as_mut().enable();
            if self.inner.read().await.next_offset > from {
                return;
            }
            let _ = tokio::time::timeout(timeout, notified).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offsets_survive_reclaim() {
        let store = MemoryCacheStore::new();
        assert_eq!(store.append(["a", "b", "c"]).await, vec![1, 2, 3]);
        assert_eq!(store.reclaim(3).await.unwrap(), 2);
        assert_eq!(store.first_offset().await.unwrap(), Some(3));
        assert_eq!(store.append(["d"]).await, vec![4]);
        assert_eq!(store.end_offset().await.unwrap(), 5);
        assert_eq!(store.count_from(3).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = MemoryCacheStore::new();
        store.append(["a"]).await;
        store.fail_next_reads(1);
        assert!(store.read_from(1, 10).await.unwrap_err().is_transient());
        assert_eq!(store.read_from(1, 10).await.unwrap().len(), 1);

        store.fail_next_queries(2);
        assert!(store.end_offset().await.unwrap_err().is_transient());
        assert!(store.first_offset().await.unwrap_err().is_transient());
        assert_eq!(store.end_offset().await.unwrap(), 2);
    }
}
