//! The strategy a job family plugs into the generic engine.

use crate::orchestration::activity::ActivityError;
use crate::orchestration::checkpoint::Checkpoint;
use crate::orchestration::progress::OperationProgress;
use crate::orchestration::range::WatermarkRange;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

pub type ActivityFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ActivityError>> + Send + 'a>>;

/// Job-specific planning query, per-batch action and finalization
///
/// Every method may be re-run against the same arguments after a retry or
/// a replayed iteration, so implementations must be idempotent: upsert,
/// overwrite, delete-if-exists.
pub trait OrchestrationJob: Send + Sync + 'static {
    /// Job arguments persisted in the checkpoint (time window, destination, ...)
    type Filter: Clone + Send + Sync + Serialize + DeserializeOwned + 'static;

    /// Family name used in logs and records
    fn name(&self) -> &'static str;

    /// Watermarks eligible for this job, `<= upper_bound` when given,
    /// strictly descending, at most `limit`
    fn fetch_watermarks<'a>(
        &'a self,
        filter: &'a Self::Filter,
        upper_bound: Option<i64>,
        limit: usize,
    ) -> ActivityFuture<'a, Vec<i64>>;

    /// Process every eligible instance in `range`
    ///
    /// Instances that fail for good are counted in `failed`; a transient
    /// error fails the whole batch so the executor retries it.
    fn process_batch<'a>(
        &'a self,
        filter: &'a Self::Filter,
        range: WatermarkRange,
    ) -> ActivityFuture<'a, OperationProgress>;

    /// Runs once when planning comes back empty
    fn finalize<'a>(
        &'a self,
        _checkpoint: &'a Checkpoint<Self::Filter>,
    ) -> ActivityFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}
