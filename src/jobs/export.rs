//! Export of live instance blobs into a destination object store.
//!
//! Destination layout: `{prefix}/{study}/{series}/{sop}.dcm`, plus
//! `{prefix}/manifest.json` written once the export has nothing left to plan.

use crate::clock::Timestamp;
use crate::jobs::for_each_in_batch;
use crate::orchestration::{
    ActivityError, ActivityFuture, Checkpoint, OperationProgress, OrchestrationJob, WatermarkRange,
};
use crate::storage::{
    put_json_atomic, read_instance_blob, InstanceIdentifier, InstanceWatermarkStore, ObjectStore,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportFilter {
    /// Key prefix in the destination store
    pub destination_prefix: String,
}

/// Totals written next to the exported files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub exported: u64,
    pub failed: u64,
    pub completed: Option<WatermarkRange>,
    pub created_time: Option<Timestamp>,
}

pub struct ExportJob {
    index: Arc<dyn InstanceWatermarkStore>,
    source: Arc<dyn ObjectStore>,
    destination: Arc<dyn ObjectStore>,
}

impl ExportJob {
    pub fn new(
        index: Arc<dyn InstanceWatermarkStore>,
        source: Arc<dyn ObjectStore>,
        destination: Arc<dyn ObjectStore>,
    ) -> Self {
        ExportJob {
            index,
            source,
            destination,
        }
    }

    pub fn destination_key(prefix: &str, id: &InstanceIdentifier) -> String {
        format!(
            "{}/{}/{}/{}.dcm",
            prefix, id.study_uid, id.series_uid, id.sop_uid
        )
    }

    pub fn manifest_key(prefix: &str) -> String {
        format!("{}/manifest.json", prefix)
    }

    async fn export_one(&self, prefix: &str, id: &InstanceIdentifier) -> Result<(), ActivityError> {
        let data = read_instance_blob(self.source.as_ref(), id).await?;
        self.destination
            .put(&Self::destination_key(prefix, id), &data)
            .await?;
        Ok(())
    }
}

impl OrchestrationJob for ExportJob {
    type Filter = ExportFilter;

    fn name(&self) -> &'static str {
        "export"
    }

    fn fetch_watermarks<'a>(
        &'a self,
        _filter: &'a ExportFilter,
        upper_bound: Option<i64>,
        limit: usize,
    ) -> ActivityFuture<'a, Vec<i64>> {
        Box::pin(async move { Ok(self.index.watermarks_desc(upper_bound, limit).await?) })
    }

    fn process_batch<'a>(
        &'a self,
        filter: &'a ExportFilter,
        range: WatermarkRange,
    ) -> ActivityFuture<'a, OperationProgress> {
        Box::pin(async move {
            let instances = self.index.instances_in_range(range).await?;
            for_each_in_batch(self.name(), &instances, |id| {
                self.export_one(&filter.destination_prefix, id)
            })
            .await
        })
    }

    fn finalize<'a>(&'a self, checkpoint: &'a Checkpoint<ExportFilter>) -> ActivityFuture<'a, ()> {
        Box::pin(async move {
            let manifest = ExportManifest {
                exported: checkpoint.progress.succeeded,
                failed: checkpoint.progress.failed,
                completed: checkpoint.completed,
                created_time: checkpoint.created_time,
            };
            let key = Self::manifest_key(&checkpoint.filter.destination_prefix);
            put_json_atomic(self.destination.as_ref(), &key, &manifest).await?;
            info!(
                key = %key,
                exported = manifest.exported,
                failed = manifest.failed,
                "Export manifest written"
            );
            Ok(())
        })
    }
}
