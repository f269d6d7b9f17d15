//! Query contracts of the indexed store behind the change feed.
//!
//! Both traits are consumed, not implemented, by the feed service and the
//! cleanup job. `InMemoryDicomStore` provides them for tests and the demo
//! binary; a SQL adapter would implement them against its indexes.

use crate::changefeed::types::{ChangeFeedEntry, ChangeFeedOrder, TimeRange};
use crate::clock::Timestamp;
use crate::orchestration::WatermarkRange;
use crate::storage::StoreError;
use std::future::Future;
use std::pin::Pin;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Ordered reads of the change feed
pub trait ChangeFeedStore: Send + Sync + 'static {
    /// Most recent entry by sequence, `None` if the feed is empty
    fn get_latest(&self, order: ChangeFeedOrder) -> StoreFuture<'_, Option<ChangeFeedEntry>>;

    /// Contiguous slice of the feed within `time_range`
    ///
    /// Ascending: entries with `sequence > offset`. Descending: the `offset`
    /// newest entries of the window are skipped. Callers validate arguments.
    fn get_range(
        &self,
        time_range: TimeRange,
        offset: i64,
        limit: usize,
        order: ChangeFeedOrder,
    ) -> StoreFuture<'_, Vec<ChangeFeedEntry>>;

    /// Delete entries whose instance is still deleted, highest watermark first
    fn get_deleted_batch(
        &self,
        batch_size: usize,
        time_window: Option<TimeRange>,
        watermark_range: Option<WatermarkRange>,
    ) -> StoreFuture<'_, Vec<ChangeFeedEntry>>;

    /// Highest watermark among deletions at or before `timestamp`
    fn get_max_deleted_watermark(&self, timestamp: Timestamp) -> StoreFuture<'_, Option<i64>>;
}

/// Instance metadata by object version
pub trait MetadataStore: Send + Sync + 'static {
    /// `Ok(None)` when the version no longer exists
    fn get_instance_metadata(&self, version: i64) -> StoreFuture<'_, Option<serde_json::Value>>;
}
