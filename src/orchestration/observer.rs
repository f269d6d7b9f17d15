//! Execution context and replay-safe progress reporting.
//!
//! An iteration may run more than once: a crash or engine fault after some
//! batches finished replays it from the same checkpoint. Counters fed from a
//! replay would double count, so every callback receives the
//! [`ExecutionContext`] and [`ReplaySafeObserver`] drops calls made while
//! `is_replaying` is set.

use crate::orchestration::progress::OperationProgress;
use crate::orchestration::range::WatermarkRange;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// Identity of one execution of a logical job instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub instance_id: String,
    /// Incremented on every continuation
    pub execution_id: u64,
    /// Times this execution has been started, from 1
    pub attempt: u32,
    /// True when this execution was started before (`attempt > 1`)
    ///
    /// Any earlier start counts, including one that faulted before planning
    /// and so emitted nothing. Events of such an execution's first full pass
    /// are then reported as replays and suppressed by `ReplaySafeObserver`;
    /// only `committed()` steps are reported.
    pub is_replaying: bool,
}

impl ExecutionContext {
    pub fn new(instance_id: impl Into<String>, execution_id: u64, attempt: u32) -> Self {
        ExecutionContext {
            instance_id: instance_id.into(),
            execution_id,
            attempt,
            is_replaying: attempt > 1,
        }
    }

    /// Context for a step made durable by a versioned record write
    ///
    /// The write admits one commit per execution, so such a step is never a
    /// replay even when the execution itself is.
    pub fn committed(&self) -> ExecutionContext {
        ExecutionContext {
            is_replaying: false,
            ..self.clone()
        }
    }
}

/// Receives orchestration progress events
pub trait ProgressObserver: Send + Sync {
    fn on_batches_planned(&self, ctx: &ExecutionContext, batches: &[WatermarkRange]);

    fn on_iteration_checkpointed(
        &self,
        ctx: &ExecutionContext,
        iteration: OperationProgress,
        completed: WatermarkRange,
    );

    fn on_job_completed(&self, ctx: &ExecutionContext, total: OperationProgress);
}

/// Forwards only first-pass events to the wrapped observer
pub struct ReplaySafeObserver<O> {
    inner: O,
}

impl<O: ProgressObserver> ReplaySafeObserver<O> {
    pub fn new(inner: O) -> Self {
        ReplaySafeObserver { inner }
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }
}

impl<O: ProgressObserver> ProgressObserver for ReplaySafeObserver<O> {
    fn on_batches_planned(&self, ctx: &ExecutionContext, batches: &[WatermarkRange]) {
        if !ctx.is_replaying {
            self.inner.on_batches_planned(ctx, batches);
        }
    }

    fn on_iteration_checkpointed(
        &self,
        ctx: &ExecutionContext,
        iteration: OperationProgress,
        completed: WatermarkRange,
    ) {
        if !ctx.is_replaying {
            self.inner.on_iteration_checkpointed(ctx, iteration, completed);
        }
    }

    fn on_job_completed(&self, ctx: &ExecutionContext, total: OperationProgress) {
        if !ctx.is_replaying {
            self.inner.on_job_completed(ctx, total);
        }
    }
}

impl<O: ProgressObserver + ?Sized> ProgressObserver for Arc<O> {
    fn on_batches_planned(&self, ctx: &ExecutionContext, batches: &[WatermarkRange]) {
        (**self).on_batches_planned(ctx, batches)
    }

    fn on_iteration_checkpointed(
        &self,
        ctx: &ExecutionContext,
        iteration: OperationProgress,
        completed: WatermarkRange,
    ) {
        (**self).on_iteration_checkpointed(ctx, iteration, completed)
    }

    fn on_job_completed(&self, ctx: &ExecutionContext, total: OperationProgress) {
        (**self).on_job_completed(ctx, total)
    }
}

/// Logs progress through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_batches_planned(&self, ctx: &ExecutionContext, batches: &[WatermarkRange]) {
        info!(
            instance = %ctx.instance_id,
            execution = ctx.execution_id,
            batches = batches.len(),
            "Batches planned"
        );
    }

    fn on_iteration_checkpointed(
        &self,
        ctx: &ExecutionContext,
        iteration: OperationProgress,
        completed: WatermarkRange,
    ) {
        info!(
            instance = %ctx.instance_id,
            execution = ctx.execution_id,
            succeeded = iteration.succeeded,
            failed = iteration.failed,
            completed = %completed,
            "Iteration checkpointed"
        );
    }

    fn on_job_completed(&self, ctx: &ExecutionContext, total: OperationProgress) {
        info!(
            instance = %ctx.instance_id,
            execution = ctx.execution_id,
            succeeded = total.succeeded,
            failed = total.failed,
            "Job completed"
        );
    }
}

/// One observed event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedEvent {
    Planned {
        execution_id: u64,
        batches: Vec<WatermarkRange>,
    },
    Checkpointed {
        execution_id: u64,
        iteration: OperationProgress,
        completed: WatermarkRange,
    },
    Completed {
        execution_id: u64,
        total: OperationProgress,
    },
}

/// Keeps every event in memory (tests and DST)
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<ObservedEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().clone()
    }

    /// Sum of every checkpointed iteration
    pub fn checkpointed_total(&self) -> OperationProgress {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ObservedEvent::Checkpointed { iteration, .. } => Some(*iteration),
                _ => None,
            })
            .sum()
    }
}

impl ProgressObserver for RecordingObserver {
    fn on_batches_planned(&self, ctx: &ExecutionContext, batches: &[WatermarkRange]) {
        self.events.lock().push(ObservedEvent::Planned {
            execution_id: ctx.execution_id,
            batches: batches.to_vec(),
        });
    }

    fn on_iteration_checkpointed(
        &self,
        ctx: &ExecutionContext,
        iteration: OperationProgress,
        completed: WatermarkRange,
    ) {
        self.events.lock().push(ObservedEvent::Checkpointed {
            execution_id: ctx.execution_id,
            iteration,
            completed,
        });
    }

    fn on_job_completed(&self, ctx: &ExecutionContext, total: OperationProgress) {
        self.events.lock().push(ObservedEvent::Completed {
            execution_id: ctx.execution_id,
            total,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_suppressed() {
        let recorder = RecordingObserver::new();
        let observer = ReplaySafeObserver::new(recorder.clone());
        let range = WatermarkRange::new(1, 10).unwrap();

        let first = ExecutionContext::new("job-1", 3, 1);
        let replay = ExecutionContext::new("job-1", 3, 2);
        assert!(!first.is_replaying);
        assert!(replay.is_replaying);

        observer.on_iteration_checkpointed(&replay, OperationProgress::new(10, 0), range);
        observer.on_iteration_checkpointed(&first, OperationProgress::new(7, 1), range);
        observer.on_job_completed(&replay, OperationProgress::new(7, 1));

        assert_eq!(recorder.events().len(), 1);
        assert_eq!(recorder.checkpointed_total(), OperationProgress::new(7, 1));
    }
}
