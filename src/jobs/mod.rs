//! Bulk maintenance jobs over watermark ranges
//!
//! Each family is an [`OrchestrationJob`](crate::orchestration::OrchestrationJob)
//! whose per-range action is idempotent, so a replayed or retried batch
//! converges to the same store contents:
//!
//! | Job                      | Per-instance action                           |
//! |--------------------------|-----------------------------------------------|
//! | `ExportJob`              | copy blob to destination (overwrite)          |
//! | `MigrationJob`           | copy legacy blob to hierarchical key          |
//! | `BlobMigrationDeleteJob` | delete legacy blob once the copy exists       |
//! | `CleanupJob`             | delete blobs and metadata of deleted versions |
//! | `BackfillJob`            | upsert content length and CRC32               |

pub mod backfill;
pub mod cleanup;
pub mod export;
pub mod migration;

pub use backfill::BackfillJob;
pub use cleanup::CleanupJob;
pub use export::{ExportFilter, ExportJob, ExportManifest};
pub use migration::{BlobMigrationDeleteJob, MigrationJob};

use crate::changefeed::ChangeFeedEntry;
use crate::orchestration::{ActivityError, OperationProgress};
use crate::storage::InstanceIdentifier;
use std::future::Future;
use tracing::warn;

/// Anything a batch action is applied to, addressed by watermark
pub(crate) trait Watermarked {
    fn watermark(&self) -> i64;
}

impl Watermarked for InstanceIdentifier {
    fn watermark(&self) -> i64 {
        self.watermark
    }
}

impl Watermarked for ChangeFeedEntry {
    fn watermark(&self) -> i64 {
        self.original_version
    }
}

/// Apply `action` to every item of a batch, in order
///
/// A transient failure aborts the batch so the executor retries all of it;
/// the items already handled are redone, which the actions tolerate. A
/// permanent failure is counted and the batch goes on.
pub(crate) async fn for_each_in_batch<'a, T, F, Fut>(
    job: &'static str,
    items: &'a [T],
    mut action: F,
) -> Result<OperationProgress, ActivityError>
where
    T: Watermarked,
    F: FnMut(&'a T) -> Fut,
    Fut: Future<Output = Result<(), ActivityError>>,
{
    let mut progress = OperationProgress::ZERO;
    for item in items {
        match action(item).await {
            Ok(()) => progress += OperationProgress::succeeded(1),
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                warn!(job, watermark = item.watermark(), error = %e, "Instance failed");
                progress += OperationProgress::one_failed();
            }
        }
    }
    Ok(progress)
}
