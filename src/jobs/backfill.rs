//! Backfill of derived properties (content length, CRC32) for instances
//! stored before the index carried them.

use crate::jobs::for_each_in_batch;
use crate::orchestration::{
    ActivityError, ActivityFuture, OperationProgress, OrchestrationJob, WatermarkRange,
};
use crate::storage::{
    read_instance_blob, DerivedProperties, InstanceIdentifier, InstanceWatermarkStore,
    ObjectStore,
};
use std::sync::Arc;

pub struct BackfillJob {
    index: Arc<dyn InstanceWatermarkStore>,
    blobs: Arc<dyn ObjectStore>,
}

impl BackfillJob {
    pub fn new(index: Arc<dyn InstanceWatermarkStore>, blobs: Arc<dyn ObjectStore>) -> Self {
        BackfillJob { index, blobs }
    }

    pub fn derive(data: &[u8]) -> DerivedProperties {
        DerivedProperties {
            content_length: data.len() as u64,
            crc32: crc32fast::hash(data),
        }
    }

    async fn backfill_one(&self, id: &InstanceIdentifier) -> Result<(), ActivityError> {
        let data = read_instance_blob(self.blobs.as_ref(), id).await?;
        self.index
            .upsert_derived(id.watermark, Self::derive(&data))
            .await?;
        Ok(())
    }
}

impl OrchestrationJob for BackfillJob {
    type Filter = ();

    fn name(&self) -> &'static str {
        "backfill"
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
            for_each_in_batch(self.name(), &instances, |id| self.backfill_one(id)).await
        })
    }
}
