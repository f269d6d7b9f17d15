//! Blob layout migration: legacy `blobs/{watermark}.dcm` to the
//! hierarchical `v2/{study}/{series}/{sop}/{watermark}.dcm` layout.
//!
//! Runs in two passes. [`MigrationJob`] copies; [`BlobMigrationDeleteJob`]
//! removes the legacy copy once the new one is in place. Readers use
//! `read_instance_blob`, which prefers the new layout, so either pass can be
//! interrupted at any point.

use crate::jobs::for_each_in_batch;
use crate::orchestration::{
    ActivityError, ActivityFuture, OperationProgress, OrchestrationJob, WatermarkRange,
};
use crate::storage::{
    hierarchical_blob_key, legacy_blob_key, InstanceIdentifier, InstanceWatermarkStore,
    ObjectStore,
};
use std::io::ErrorKind;
use std::sync::Arc;
use tracing::debug;

pub struct MigrationJob {
    index: Arc<dyn InstanceWatermarkStore>,
    blobs: Arc<dyn ObjectStore>,
}

impl MigrationJob {
    pub fn new(index: Arc<dyn InstanceWatermarkStore>, blobs: Arc<dyn ObjectStore>) -> Self {
        MigrationJob { index, blobs }
    }

    async fn migrate_one(&self, id: &InstanceIdentifier) -> Result<(), ActivityError> {
        let target = hierarchical_blob_key(id);
        let data = match self.blobs.get(&legacy_blob_key(id.watermark)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Copied and cleaned up by an earlier run
                if self.blobs.exists(&target).await? {
                    return Ok(());
                }
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        self.blobs.put(&target, &data).await?;
        debug!(watermark = id.watermark, target = %target, "Blob migrated");
        Ok(())
    }
}

impl OrchestrationJob for MigrationJob {
    type Filter = ();

    fn name(&self) -> &'static str {
        "migration"
    }

    fn fetch_watermarks<'a>(
        &'a self,
        _filter: &'a (),
        upper_bound: Option<i64>,
        limit: usize,
    ) -> ActivityFuture<'a, Vec<i64>> {
        Box::pin(async move { Ok(self.index.watermarks_desc(upper_bound, limit).await?) })
    }

    fn process_batch<'a>(
        &'a self,
        _filter: &'a (),
        range: WatermarkRange,
    ) -> ActivityFuture<'a, OperationProgress> {
        Box::pin(async move {
            let instances = self.index.instances_in_range(range).await?;
            for_each_in_batch(self.name(), &instances, |id| self.migrate_one(id)).await
        })
    }
}

pub struct BlobMigrationDeleteJob {
    index: Arc<dyn InstanceWatermarkStore>,
    blobs: Arc<dyn ObjectStore>,
}

impl BlobMigrationDeleteJob {
    pub fn new(index: Arc<dyn InstanceWatermarkStore>, blobs: Arc<dyn ObjectStore>) -> Self {
        BlobMigrationDeleteJob { index, blobs }
    }

    async fn delete_one(&self, id: &InstanceIdentifier) -> Result<(), ActivityError> {
        if !self.blobs.exists(&hierarchical_blob_key(id)).await? {
            return Err(ActivityError::permanent(format!(
                "watermark {} has no migrated copy",
                id.watermark
            )));
        }
        self.blobs.delete(&legacy_blob_key(id.watermark)).await?;
        Ok(())
    }
}

impl OrchestrationJob for BlobMigrationDeleteJob {
    type Filter = ();

    fn name(&self) -> &'static str {
        "blob_delete"
    }

    fn fetch_watermarks<'a>(
        &'a self,
        _filter: &'a (),
        upper_bound: Option<i64>,
        limit: usize,
    ) -> ActivityFuture<'a, Vec<i64>> {
        Box::pin(async move { Ok(self.index.watermarks_desc(upper_bound, limit).await?) })
    }

    fn process_batch<'a>(
        &'a self,
        _filter: &'a (),
        range: WatermarkRange,
    ) -> ActivityFuture<'a, OperationProgress> {
        Box::pin(async move {
            let instances = self.index.instances_in_range(range).await?;
            for_each_in_batch(self.name(), &instances, |id| self.delete_one(id)).await
        })
    }
}
