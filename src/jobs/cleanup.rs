//! Removal of blobs and metadata left behind by deleted instances.
//!
//! Candidates come from the change feed: delete entries whose instance is
//! still deleted, within the job's time window. The first planning pass is
//! anchored at the highest deleted watermark of the window so later
//! deletions do not extend a running cleanup.
//!
//! Deletion is judged per version: a deleted version is reclaimed even when
//! its UID has been stored again since. Versions superseded by an update are
//! not deletions and are left in place.

use crate::changefeed::{ChangeFeedEntry, ChangeFeedStore, TimeRange};
use crate::jobs::for_each_in_batch;
use crate::orchestration::{
    ActivityError, ActivityFuture, OperationProgress, OrchestrationJob, WatermarkRange,
};
use crate::storage::{
    hierarchical_blob_key, legacy_blob_key, metadata_key, InstanceIdentifier, ObjectStore,
};
use std::sync::Arc;
use tracing::debug;

pub struct CleanupJob {
    feed: Arc<dyn ChangeFeedStore>,
    blobs: Arc<dyn ObjectStore>,
}

impl CleanupJob {
    pub fn new(feed: Arc<dyn ChangeFeedStore>, blobs: Arc<dyn ObjectStore>) -> Self {
        CleanupJob { feed, blobs }
    }

    async fn clean_one(&self, entry: &ChangeFeedEntry) -> Result<(), ActivityError> {
        let version = entry.original_version;
        let id = InstanceIdentifier {
            study_uid: entry.study_uid.clone(),
            series_uid: entry.series_uid.clone(),
            sop_uid: entry.sop_uid.clone(),
            watermark: version,
        };
        // Deleting a missing key succeeds, so unmigrated versions are fine
        self.blobs.delete(&hierarchical_blob_key(&id)).await?;
        self.blobs.delete(&legacy_blob_key(version)).await?;
        self.blobs.delete(&metadata_key(version)).await?;
        debug!(watermark = version, sequence = entry.sequence, "Deleted instance cleaned up");
        Ok(())
    }
}

impl OrchestrationJob for CleanupJob {
    /// Event-time window of the deletions to clean up
    type Filter = TimeRange;

    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn fetch_watermarks<'a>(
        &'a self,
        filter: &'a TimeRange,
        upper_bound: Option<i64>,
        limit: usize,
    ) -> ActivityFuture<'a, Vec<i64>> {
        Box::pin(async move {
            let upper = match upper_bound {
                Some(upper) => upper,
                None => match self.feed.get_max_deleted_watermark(filter.end).await? {
                    Some(anchor) => anchor,
                    None => return Ok(Vec::new()),
                },
            };
            let Some(bound) = WatermarkRange::new(i64::MIN, upper) else {
                return Ok(Vec::new());
            };
            let entries = self
                .feed
                .get_deleted_batch(limit, Some(*filter), Some(bound))
                .await?;
            Ok(entries.iter().map(|e| e.original_version).collect())
        })
    }

    fn process_batch<'a>(
        &'a self,
        filter: &'a TimeRange,
        range: WatermarkRange,
    ) -> ActivityFuture<'a, OperationProgress> {
        Box::pin(async move {
            let limit = usize::try_from(range.len()).unwrap_or(usize::MAX);
            let entries = self
                .feed
                .get_deleted_batch(limit, Some(*filter), Some(range))
                .await?;
            for_each_in_batch(self.name(), &entries, |entry| self.clean_one(entry)).await
        })
    }
}
