//! Durable resume state of a batch job.
//!
//! A checkpoint is replaced wholesale, by the engine only, once per
//! iteration. The JSON payload is forward compatible: unknown fields are
//! ignored and fields added later carry serde defaults.

use crate::clock::Timestamp;
use crate::orchestration::progress::OperationProgress;
use crate::orchestration::range::WatermarkRange;
use serde::{Deserialize, Serialize};

/// How many watermarks per batch and how many batches per iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchingOptions {
    /// Maximum existing watermarks per batch
    pub size: usize,
    /// Maximum batches per iteration, and their concurrency bound
    pub max_parallel_count: usize,
}

impl Default for BatchingOptions {
    fn default() -> Self {
        BatchingOptions {
            size: 100,
            max_parallel_count: 4,
        }
    }
}

impl BatchingOptions {
    pub fn new(size: usize, max_parallel_count: usize) -> Self {
        BatchingOptions {
            size,
            max_parallel_count,
        }
    }

    /// Watermarks scanned per planning call
    pub fn max_count(&self) -> usize {
        self.size.saturating_mul(self.max_parallel_count)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.size == 0 {
            return Err("batching.size must be > 0".to_string());
        }
        if self.max_parallel_count == 0 {
            return Err("batching.max_parallel_count must be > 0".to_string());
        }
        Ok(())
    }
}

/// Resume state of one logical job instance
///
/// # Invariants
/// - `completed` only grows: `start` non-increasing, `end` non-decreasing
/// - `created_time` is set on the first checkpointed iteration and never changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint<F> {
    pub batching: BatchingOptions,
    /// Union of every settled batch; `None` before the first iteration
    #[serde(default)]
    pub completed: Option<WatermarkRange>,
    #[serde(default)]
    pub created_time: Option<Timestamp>,
    #[serde(default)]
    pub progress: OperationProgress,
    /// Job-specific arguments (time window, destination, ...)
    pub filter: F,
}

impl<F> Checkpoint<F> {
    /// Checkpoint of a job that has not run yet
    pub fn new(batching: BatchingOptions, filter: F) -> Self {
        Checkpoint {
            batching,
            completed: None,
            created_time: None,
            progress: OperationProgress::ZERO,
            filter,
        }
    }

    /// Scan bound for the next planning call: one below everything completed
    pub fn upper_bound(&self) -> Option<i64> {
        self.completed.map(|c| c.start().saturating_sub(1))
    }

    /// Successor checkpoint after an iteration settled `batch_range`
    pub fn advance(&self, batch_range: WatermarkRange, progress: OperationProgress, now: Timestamp) -> Self
    where
        F: Clone,
    {
        let completed = match self.completed {
            Some(prev) => prev.span(&batch_range),
            None => batch_range,
        };
        let next = Checkpoint {
            batching: self.batching,
            completed: Some(completed),
            created_time: Some(self.created_time.unwrap_or(now)),
            progress: self.progress + progress,
            filter: self.filter.clone(),
        };
        next.verify_successor_of(self);
        next
    }

    /// Verify invariants against the checkpoint this one replaces (debug builds only)
    fn verify_successor_of(&self, prev: &Checkpoint<F>) {
        if let (Some(old), Some(new)) = (prev.completed, self.completed) {
            debug_assert!(
                new.start() <= old.start() && new.end() >= old.end(),
                "Invariant violated: completed range shrank from {} to {}",
                old,
                new
            );
        }
        if prev.created_time.is_some() {
            debug_assert_eq!(
                prev.created_time, self.created_time,
                "Invariant violated: created_time changed"
            );
        }
        debug_assert_eq!(prev.batching, self.batching);
    }
}
