//! Orchestration Host
//!
//! Owns the continuation loop. Each iteration runs as one *execution* of a
//! logical instance; when it settles, the host commits the new checkpoint
//! with `execution_id + 1` and starts the next execution from that record.
//! Per-execution state is therefore bounded to a single iteration however
//! many iterations the job needs, and a crash resumes from the last commit.
//!
//! ## Exclusive ownership
//!
//! - In process: an active-instance set refuses a second concurrent execution.
//! - Across processes: every commit names the record version it replaces; a
//!   stale executor fails with `VersionConflict` and commits nothing.
//!
//! ## Replay
//!
//! Before running, the host persists `attempt + 1` for the execution. An
//! execution that starts with `attempt > 1` is a replay of one that did not
//! commit, and the execution context says so.

use crate::clock::{Clock, Timestamp};
use crate::orchestration::checkpoint::{BatchingOptions, Checkpoint};
use crate::orchestration::engine::{IterationOutcome, OrchestrationEngine};
use crate::orchestration::error::OrchestrationError;
use crate::orchestration::job::OrchestrationJob;
use crate::orchestration::observer::{ExecutionContext, ProgressObserver};
use crate::orchestration::progress::OperationProgress;
use crate::orchestration::range::WatermarkRange;
use crate::orchestration::state_store::{OrchestrationStateStore, StateStoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestrationStatus {
    Running,
    Completed,
}

/// Persisted state of one logical instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRecord<F> {
    pub instance_id: String,
    pub job: String,
    pub execution_id: u64,
    /// Starts of the current execution so far
    #[serde(default)]
    pub attempt: u32,
    pub status: OrchestrationStatus,
    pub checkpoint: Checkpoint<F>,
    pub updated_time: Timestamp,
}

/// Final report of a completed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub instance_id: String,
    pub job: String,
    pub progress: OperationProgress,
    pub completed: Option<WatermarkRange>,
    /// Executions committed, including the final one
    pub executions: u64,
    pub created_time: Option<Timestamp>,
}

/// Outcome of a single execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Checkpoint committed; the next execution is ready
    Continued { next_execution_id: u64 },
    Completed(JobReport),
    /// Cancellation observed; the record is unchanged apart from `attempt`
    Cancelled,
}

/// Snapshot for operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: OrchestrationStatus,
    pub execution_id: u64,
    pub attempt: u32,
    pub progress: OperationProgress,
    pub completed: Option<WatermarkRange>,
}

/// Removes the instance from the active set when the execution ends
struct ActiveGuard {
    active: Arc<Mutex<HashSet<String>>>,
    instance_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.instance_id);
    }
}

/// Runs logical job instances to completion through continuations
pub struct OrchestrationHost<J: OrchestrationJob, C: Clock> {
    engine: OrchestrationEngine<J, C>,
    clock: C,
    state: Arc<dyn OrchestrationStateStore>,
    observer: Arc<dyn ProgressObserver>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl<J: OrchestrationJob, C: Clock> OrchestrationHost<J, C> {
    pub fn new(
        engine: OrchestrationEngine<J, C>,
        clock: C,
        state: Arc<dyn OrchestrationStateStore>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        OrchestrationHost {
            engine,
            clock,
            state,
            observer,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn engine(&self) -> &OrchestrationEngine<J, C> {
        &self.engine
    }

    /// Create the record of a new instance
    ///
    /// Fails with `AlreadyRunning` if a running record exists. A completed
    /// record is replaced, starting the job over.
    pub async fn start(
        &self,
        instance_id: &str,
        filter: J::Filter,
        batching: BatchingOptions,
    ) -> Result<(), OrchestrationError> {
        let expected = match self.load(instance_id).await? {
            Some((_, record)) if record.status == OrchestrationStatus::Running => {
                return Err(OrchestrationError::AlreadyRunning(instance_id.to_string()))
            }
            Some((version, _)) => Some(version),
            None => None,
        };

        let record = OrchestrationRecord {
            instance_id: instance_id.to_string(),
            job: self.engine.job().name().to_string(),
            execution_id: 1,
            attempt: 0,
            status: OrchestrationStatus::Running,
            checkpoint: Checkpoint::new(batching, filter),
            updated_time: self.clock.now(),
        };
        self.commit(instance_id, expected, &record).await?;
        info!(
            job = self.engine.job().name(),
            instance = instance_id,
            size = batching.size,
            max_parallel_count = batching.max_parallel_count,
            "Orchestration started"
        );
        Ok(())
    }

    /// Run one execution (one iteration) of `instance_id`
    pub async fn run_execution(&self, instance_id: &str) -> Result<ExecutionResult, OrchestrationError> {
        let _guard = self.claim(instance_id)?;

        let (version, mut record) = self
            .load(instance_id)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound(instance_id.to_string()))?;
        if record.status == OrchestrationStatus::Completed {
            return Ok(ExecutionResult::Completed(self.report(&record)));
        }

        // Persist the start so a later start of this execution knows it is a replay,
        // even when this attempt faults before emitting anything.
        record.attempt = record.attempt.saturating_add(1);
        record.updated_time = self.clock.now();
        let version = self.commit(instance_id, Some(version), &record).await?;

        let ctx = ExecutionContext::new(instance_id, record.execution_id, record.attempt);
        debug!(
            instance = instance_id,
            execution = ctx.execution_id,
            attempt = ctx.attempt,
            replaying = ctx.is_replaying,
            "Execution started"
        );

        let outcome = self
            .engine
            .run_iteration(&ctx, &record.checkpoint, self.observer.as_ref())
            .await?;

        match outcome {
            IterationOutcome::Continue {
                checkpoint,
                iteration,
                batch_range,
            } => {
                let next = OrchestrationRecord {
                    execution_id: record.execution_id + 1,
                    attempt: 0,
                    checkpoint,
                    updated_time: self.clock.now(),
                    ..record
                };
                self.commit(instance_id, Some(version), &next).await?;
                if let Some(completed) = next.checkpoint.completed {
                    self.observer
                        .on_iteration_checkpointed(&ctx.committed(), iteration, completed);
                }
                debug!(
                    instance = instance_id,
                    batch_range = %batch_range,
                    next_execution = next.execution_id,
                    "Continuing as new execution"
                );
                Ok(ExecutionResult::Continued {
                    next_execution_id: next.execution_id,
                })
            }
            IterationOutcome::Completed { checkpoint } => {
                let done = OrchestrationRecord {
                    status: OrchestrationStatus::Completed,
                    checkpoint,
                    updated_time: self.clock.now(),
                    ..record
                };
                self.commit(instance_id, Some(version), &done).await?;
                let report = self.report(&done);
                self.observer
                    .on_job_completed(&ctx.committed(), report.progress);
                Ok(ExecutionResult::Completed(report))
            }
            IterationOutcome::Cancelled => Ok(ExecutionResult::Cancelled),
        }
    }

    /// Run executions until the job completes, is cancelled or faults
    ///
    /// Returns `Ok(None)` when cancelled. An engine fault leaves the last
    /// committed record in place; calling this again resumes from it.
    pub async fn run_to_completion(
        &self,
        instance_id: &str,
    ) -> Result<Option<JobReport>, OrchestrationError> {
        loop {
            match self.run_execution(instance_id).await? {
                ExecutionResult::Continued { .. } => continue,
                ExecutionResult::Completed(report) => return Ok(Some(report)),
                ExecutionResult::Cancelled => return Ok(None),
            }
        }
    }

    pub async fn status(&self, instance_id: &str) -> Result<Option<StatusReport>, OrchestrationError> {
        Ok(self.load(instance_id).await?.map(|(_, record)| StatusReport {
            status: record.status,
            execution_id: record.execution_id,
            attempt: record.attempt,
            progress: record.checkpoint.progress,
            completed: record.checkpoint.completed,
        }))
    }

    /// The committed record, for inspection
    pub async fn record(
        &self,
        instance_id: &str,
    ) -> Result<Option<OrchestrationRecord<J::Filter>>, OrchestrationError> {
        Ok(self.load(instance_id).await?.map(|(_, record)| record))
    }

    fn claim(&self, instance_id: &str) -> Result<ActiveGuard, OrchestrationError> {
        if !self.active.lock().insert(instance_id.to_string()) {
            return Err(OrchestrationError::AlreadyRunning(instance_id.to_string()));
        }
        Ok(ActiveGuard {
            active: self.active.clone(),
            instance_id: instance_id.to_string(),
        })
    }

    async fn load(
        &self,
        instance_id: &str,
    ) -> Result<Option<(u64, OrchestrationRecord<J::Filter>)>, OrchestrationError> {
        match self.state.load(instance_id).await? {
            Some(stored) => {
                let record = serde_json::from_value(stored.payload).map_err(StateStoreError::from)?;
                Ok(Some((stored.version, record)))
            }
            None => Ok(None),
        }
    }

    async fn commit(
        &self,
        instance_id: &str,
        expected: Option<u64>,
        record: &OrchestrationRecord<J::Filter>,
    ) -> Result<u64, OrchestrationError> {
        let payload = serde_json::to_value(record).map_err(StateStoreError::from)?;
        Ok(self.state.save(instance_id, expected, payload).await?)
    }

    fn report(&self, record: &OrchestrationRecord<J::Filter>) -> JobReport {
        JobReport {
            instance_id: record.instance_id.clone(),
            job: record.job.clone(),
            progress: record.checkpoint.progress,
            completed: record.checkpoint.completed,
            executions: record.execution_id,
            created_time: record.checkpoint.created_time,
        }
    }
}
