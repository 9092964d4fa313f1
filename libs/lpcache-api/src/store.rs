use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::CacheError;
use crate::record::{Offset, Record};

/// Read side of the durable cache store.
///
/// The writer appends, the consumer reads and advances its own cursor.
/// Neither side mutates existing records. Implementations must be safe to
/// read while another process (or task) appends.
pub trait CacheStore: Send + Sync {
    /// Read up to `limit` records with `offset >= from`, in store order.
    fn read_from(
        &self,
        from: Offset,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Record>, CacheError>> + Send + '_>>;

    /// Earliest offset still held by the store, `None` when empty.
    fn first_offset(&self) -> Pin<Box<dyn Future<Output = Result<Option<Offset>, CacheError>> + Send + '_>>;

    /// Append end: every future append lands at or after this offset.
    fn end_offset(&self) -> Pin<Box<dyn Future<Output = Result<Offset, CacheError>> + Send + '_>>;

    /// Number of records with `offset >= from`.
    fn count_from(&self, from: Offset) -> Pin<Box<dyn Future<Output = Result<u64, CacheError>> + Send + '_>>;

    /// Release space held by records with `offset < before`.
    ///
    /// Only called after the cursor has durably moved past `before`.
    /// Default: the store does not reclaim.
    fn reclaim(&self, _before: Offset) -> Pin<Box<dyn Future<Output = Result<u64, CacheError>> + Send + '_>> {
        Box::pin(async { Ok(0) })
    }

    /// Suspend until records at or after `from` may be available, or until
    /// `timeout` elapses. Spurious wake-ups are allowed; callers re-read.
    fn wait_for_data(&self, from: Offset, timeout: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}
