//! Orchestration Engine
//!
//! Runs one iteration of a batch job:
//!
//! ```text
//! Planning ──empty──▶ finalize ──▶ Completed
//!    │
//!    ▼
//! Executing (≤ max_parallel_count batches at once, each retried)
//!    │ every batch settled
//!    ▼
//! Checkpointing ──▶ Continuing (host persists, next execution)
//! ```
//!
//! An iteration is a pure function of its input checkpoint and the store,
//! so replaying it after a fault redoes the same idempotent activities.
//!
//! ## Design (TigerStyle)
//!
//! - No checkpoint is produced until every planned batch has settled
//! - A batch that fails for good counts as one failed unit; the iteration goes on
//! - Engine faults (planning, finalization) return an error and produce nothing

use crate::clock::Clock;
use crate::orchestration::activity::{ActivityExecutor, ActivityOutcome, RetryPolicy};
use crate::orchestration::checkpoint::Checkpoint;
use crate::orchestration::error::OrchestrationError;
use crate::orchestration::job::OrchestrationJob;
use crate::orchestration::observer::{ExecutionContext, ProgressObserver};
use crate::orchestration::planner::BatchPlanner;
use crate::orchestration::progress::OperationProgress;
use crate::orchestration::range::{batch_span, WatermarkRange};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one iteration
#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome<F> {
    /// Batches settled; continue with the new checkpoint
    Continue {
        checkpoint: Checkpoint<F>,
        iteration: OperationProgress,
        batch_range: WatermarkRange,
    },
    /// Nothing left to plan; finalization ran
    Completed { checkpoint: Checkpoint<F> },
    /// Cancellation observed before the iteration settled; nothing to persist
    Cancelled,
}

/// Generic engine shared by every job family
pub struct OrchestrationEngine<J: OrchestrationJob, C: Clock> {
    job: Arc<J>,
    clock: C,
    executor: ActivityExecutor<C>,
    cancel: CancellationToken,
}

impl<J: OrchestrationJob, C: Clock> OrchestrationEngine<J, C> {
    pub fn new(job: Arc<J>, clock: C, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        OrchestrationEngine {
            job,
            executor: ActivityExecutor::new(clock.clone(), retry, cancel.clone()),
            clock,
            cancel,
        }
    }

    pub fn job(&self) -> &Arc<J> {
        &self.job
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Plan, execute and checkpoint one iteration from `checkpoint`
    pub async fn run_iteration(
        &self,
        ctx: &ExecutionContext,
        checkpoint: &Checkpoint<J::Filter>,
        observer: &dyn ProgressObserver,
    ) -> Result<IterationOutcome<J::Filter>, OrchestrationError> {
        let job_name = self.job.name();
        if self.cancel.is_cancelled() {
            return Ok(IterationOutcome::Cancelled);
        }

        // Planning
        let planner = BatchPlanner::new(checkpoint.batching);
        let upper_bound = checkpoint.upper_bound();
        let job = self.job.as_ref();
        let batches = match self
            .executor
            .execute("plan", |_| planner.plan(job, &checkpoint.filter, upper_bound))
            .await
        {
            ActivityOutcome::Completed(batches) => batches,
            ActivityOutcome::Failed { error, attempts } => {
                warn!(
                    job = job_name,
                    instance = %ctx.instance_id,
                    attempts,
                    error = %error,
                    "Planning failed; iteration aborted"
                );
                return Err(OrchestrationError::Planning {
                    job: job_name,
                    source: error,
                });
            }
            ActivityOutcome::Cancelled => return Ok(IterationOutcome::Cancelled),
        };

        let Some(batch_range) = batch_span(&batches) else {
            return self.complete(ctx, checkpoint).await;
        };
        observer.on_batches_planned(ctx, &batches);
        debug!(
            job = job_name,
            instance = %ctx.instance_id,
            execution = ctx.execution_id,
            batch_range = %batch_range,
            batches = batches.len(),
            "Executing batches"
        );

        // Executing
        let filter = &checkpoint.filter;
        let executor = &self.executor;
        let outcomes: Vec<(WatermarkRange, ActivityOutcome<OperationProgress>)> =
            stream::iter(batches.iter().copied())
                .map(|range| async move {
                    let outcome = executor
                        .execute("process_batch", |_| job.process_batch(filter, range))
                        .await;
                    (range, outcome)
                })
                .buffer_unordered(checkpoint.batching.max_parallel_count.max(1))
                .collect()
                .await;

        let mut iteration = OperationProgress::ZERO;
        let mut cancelled = false;
        for (range, outcome) in outcomes {
            match outcome {
                ActivityOutcome::Completed(progress) => iteration += progress,
                ActivityOutcome::Failed { error, attempts } => {
                    warn!(
                        job = job_name,
                        instance = %ctx.instance_id,
                        range = %range,
                        attempts,
                        error = %error,
                        "Batch failed"
                    );
                    iteration += OperationProgress::one_failed();
                }
                ActivityOutcome::Cancelled => cancelled = true,
            }
        }
        if cancelled {
            info!(
                job = job_name,
                instance = %ctx.instance_id,
                "Iteration cancelled before all batches settled"
            );
            return Ok(IterationOutcome::Cancelled);
        }

        // Checkpointing
        let next = checkpoint.advance(batch_range, iteration, self.clock.now());
        Ok(IterationOutcome::Continue {
            checkpoint: next,
            iteration,
            batch_range,
        })
    }

    async fn complete(
        &self,
        ctx: &ExecutionContext,
        checkpoint: &Checkpoint<J::Filter>,
    ) -> Result<IterationOutcome<J::Filter>, OrchestrationError> {
        let job = self.job.as_ref();
        match self
            .executor
            .execute("finalize", |_| job.finalize(checkpoint))
            .await
        {
            ActivityOutcome::Completed(()) => {}
            ActivityOutcome::Failed { error, .. } => {
                return Err(OrchestrationError::Finalization {
                    job: job.name(),
                    source: error,
                })
            }
            ActivityOutcome::Cancelled => return Ok(IterationOutcome::Cancelled),
        }
        info!(
            job = job.name(),
            instance = %ctx.instance_id,
            execution = ctx.execution_id,
            progress = %checkpoint.progress,
            "Nothing left to plan"
        );
        Ok(IterationOutcome::Completed {
            checkpoint: checkpoint.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::clock::Timestamp;
    use crate::orchestration::activity::ActivityError;
    use crate::orchestration::checkpoint::BatchingOptions;
    use crate::orchestration::job::ActivityFuture;
    use crate::orchestration::observer::RecordingObserver;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Watermarks min..=max; batches containing a poisoned watermark always fail
    struct CountingJob {
        min: i64,
        max: i64,
        poisoned: HashSet<i64>,
        processed: Mutex<Vec<WatermarkRange>>,
        fail_planning: bool,
        finalized: Mutex<u32>,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl CountingJob {
        fn new(max: i64) -> Self {
            CountingJob {
                min: 1,
                max,
                poisoned: HashSet::new(),
                processed: Mutex::new(Vec::new()),
                fail_planning: false,
                finalized: Mutex::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }
        }
    }

    impl OrchestrationJob for CountingJob {
        type Filter = String;

        fn name(&self) -> &'static str {
            "counting"
        }

        fn fetch_watermarks<'a>(
            &'a self,
            _filter: &'a String,
            upper_bound: Option<i64>,
            limit: usize,
        ) -> ActivityFuture<'a, Vec<i64>> {
            Box::pin(async move {
                if self.fail_planning {
                    return Err(ActivityError::transient("store down"));
                }
                let top = upper_bound.map_or(self.max, |u| u.min(self.max));
                Ok((self.min..=top).rev().take(limit).collect())
            })
        }

        fn process_batch<'a>(
            &'a self,
            _filter: &'a String,
            range: WatermarkRange,
        ) -> ActivityFuture<'a, OperationProgress> {
            Box::pin(async move {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
                // Let sibling batches start before this one settles
                tokio::task::yield_now().await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                if self.poisoned.iter().any(|w| range.contains(*w)) {
                    return Err(ActivityError::transient("poisoned"));
                }
                self.processed.lock().push(range);
                Ok(OperationProgress::succeeded(range.len()))
            })
        }

        fn finalize<'a>(&'a self, _checkpoint: &'a Checkpoint<String>) -> ActivityFuture<'a, ()> {
            Box::pin(async move {
                *self.finalized.lock() += 1;
                Ok(())
            })
        }
    }

    fn engine(job: CountingJob) -> OrchestrationEngine<CountingJob, SimulatedClock> {
        OrchestrationEngine::new(
            Arc::new(job),
            SimulatedClock::new(1_000),
            RetryPolicy::test(),
            CancellationToken::new(),
        )
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("job-1", 1, 1)
    }

    #[tokio::test]
    async fn test_iteration_checkpoints_batch_range() {
        let engine = engine(CountingJob::new(25));
        let observer = RecordingObserver::new();
        let cp = Checkpoint::new(BatchingOptions::new(10, 3), "f".to_string());

        let outcome = engine.run_iteration(&ctx(), &cp, &observer).await.unwrap();
        match outcome {
            IterationOutcome::Continue {
                checkpoint,
                iteration,
                batch_range,
            } => {
                assert_eq!(batch_range, WatermarkRange::new(1, 25).unwrap());
                assert_eq!(checkpoint.completed, Some(batch_range));
                assert_eq!(iteration, OperationProgress::new(25, 0));
                assert_eq!(checkpoint.created_time, Some(Timestamp(1_000)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(engine.job().processed.lock().len(), 3);
        assert_eq!(observer.events().len(), 1);
    }

    #[tokio::test]
    async fn test_batches_run_concurrently_up_to_max_parallel_count() {
        let engine = engine(CountingJob::new(60));
        let batching = BatchingOptions::new(5, 3);
        let mut cp = Checkpoint::new(batching, "f".to_string());

        for _ in 0..3 {
            match engine
                .run_iteration(&ctx(), &cp, &RecordingObserver::new())
                .await
                .unwrap()
            {
                IterationOutcome::Continue { checkpoint, .. } => cp = checkpoint,
                other => panic!("unexpected {:?}", other),
            }
        }

        let peak = engine.job().peak_in_flight.load(Ordering::SeqCst);
        assert!(peak <= batching.max_parallel_count, "peak {} over bound", peak);
        assert_eq!(peak, batching.max_parallel_count);
        assert_eq!(engine.job().in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(engine.job().processed.lock().len(), 9);
        assert_eq!(cp.completed, WatermarkRange::new(16, 60));
    }

    #[tokio::test]
    async fn test_completed_range_plans_nothing_and_finalizes_once() {
        // Store holds watermarks 10..=25, all of them already completed
        let mut job = CountingJob::new(25);
        job.min = 10;
        let engine = engine(job);
        let mut cp = Checkpoint::new(BatchingOptions::new(10, 3), "f".to_string());
        cp.completed = WatermarkRange::new(10, 25);

        let outcome = engine
            .run_iteration(&ctx(), &cp, &RecordingObserver::new())
            .await
            .unwrap();
        assert_eq!(outcome, IterationOutcome::Completed { checkpoint: cp });
        assert_eq!(*engine.job().finalized.lock(), 1);
        assert!(engine.job().processed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_counts_one_unit_and_iteration_continues() {
        let mut job = CountingJob::new(25);
        job.poisoned.insert(7);
        let engine = engine(job);
        let cp = Checkpoint::new(BatchingOptions::new(10, 3), "f".to_string());

        let outcome = engine
            .run_iteration(&ctx(), &cp, &RecordingObserver::new())
            .await
            .unwrap();
        let IterationOutcome::Continue {
            checkpoint,
            iteration,
            ..
        } = outcome
        else {
            panic!("expected continuation");
        };
        // (16,25) and (1,5) succeed; (6,15) fails as one unit
        assert_eq!(iteration, OperationProgress::new(15, 1));
        assert_eq!(checkpoint.completed, WatermarkRange::new(1, 25));
    }

    #[tokio::test]
    async fn test_planning_failure_is_engine_fault() {
        let mut job = CountingJob::new(25);
        job.fail_planning = true;
        let engine = engine(job);
        let cp = Checkpoint::new(BatchingOptions::new(10, 3), "f".to_string());

        let err = engine
            .run_iteration(&ctx(), &cp, &RecordingObserver::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Planning { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancelled_engine_produces_nothing() {
        let engine = engine(CountingJob::new(25));
        engine.cancel_token().cancel();
        let cp = Checkpoint::new(BatchingOptions::new(10, 3), "f".to_string());

        let outcome = engine
            .run_iteration(&ctx(), &cp, &RecordingObserver::new())
            .await
            .unwrap();
        assert_eq!(outcome, IterationOutcome::Cancelled);
        assert!(engine.job().processed.lock().is_empty());
    }
}
