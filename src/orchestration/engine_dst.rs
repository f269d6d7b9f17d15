//! Deterministic Simulation Testing for durable orchestration
//!
//! Drives a backfill job through [`OrchestrationHost`] while the blob store
//! and the orchestration state store fail at seeded random points. A failed
//! commit is a crash: the execution is rerun from the last committed record,
//! replaying its idempotent batches.
//!
//! ## Invariants
//!
//! - Plans lie below the committed checkpoint and never overlap
//! - Committed `completed` ranges only grow downward from a fixed top
//! - Observed (committed) progress equals the final checkpoint progress
//! - Completion covers every watermark that existed when the job anchored
//! - With no failed batch, every covered instance was processed exactly once

use crate::clock::SimulatedClock;
use crate::io::simulation::SimulatedRng;
use crate::io::Rng;
use crate::jobs::BackfillJob;
use crate::orchestration::activity::RetryPolicy;
use crate::orchestration::checkpoint::{BatchingOptions, Checkpoint};
use crate::orchestration::engine::OrchestrationEngine;
use crate::orchestration::host::{ExecutionResult, JobReport, OrchestrationHost};
use crate::orchestration::observer::{ObservedEvent, RecordingObserver};
use crate::orchestration::progress::OperationProgress;
use crate::orchestration::state_store::ObjectStoreStateStore;
use crate::storage::{
    InMemoryDicomStore, InMemoryObjectStore, InstanceWatermarkStore, SimulatedObjectStore,
    SimulatedStoreConfig,
};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const INSTANCE_ID: &str = "backfill-dst";

/// Configuration for engine DST
#[derive(Debug, Clone)]
pub struct EngineDSTConfig {
    pub seed: u64,
    /// Instances stored before the job starts
    pub initial_instances: u64,
    /// Probability of burning watermarks between inserts
    pub gap_prob: f64,
    /// Probability that an execution is preceded by an insert
    pub insert_prob: f64,
    /// Probability that an execution is preceded by a delete
    pub delete_prob: f64,
    pub batching: BatchingOptions,
    pub retry: RetryPolicy,
    /// Faults on blob reads (per-batch activities)
    pub blob_faults: SimulatedStoreConfig,
    /// Faults on the orchestration record store (crashes around commits)
    pub state_faults: SimulatedStoreConfig,
}

impl Default for EngineDSTConfig {
    fn default() -> Self {
        EngineDSTConfig {
            seed: 0,
            initial_instances: 60,
            gap_prob: 0.2,
            insert_prob: 0.2,
            delete_prob: 0.1,
            batching: BatchingOptions::new(4, 3),
            retry: RetryPolicy::test(),
            blob_faults: SimulatedStoreConfig::default(),
            state_faults: SimulatedStoreConfig::default(),
        }
    }
}

impl EngineDSTConfig {
    pub fn new(seed: u64) -> Self {
        EngineDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// No faults
    pub fn calm(seed: u64) -> Self {
        EngineDSTConfig {
            seed,
            blob_faults: SimulatedStoreConfig::no_faults(),
            state_faults: SimulatedStoreConfig::no_faults(),
            ..Default::default()
        }
    }

    pub fn moderate(seed: u64) -> Self {
        Self::new(seed)
    }

    /// Frequent blob faults and crashes, more retries to still make progress
    pub fn chaos(seed: u64) -> Self {
        EngineDSTConfig {
            seed,
            batching: BatchingOptions::new(3, 4),
            retry: RetryPolicy {
                max_attempts: 5,
                ..RetryPolicy::test()
            },
            blob_faults: SimulatedStoreConfig::high_chaos(),
            state_faults: SimulatedStoreConfig::high_chaos(),
            ..Default::default()
        }
    }
}

/// Result of an engine DST run
#[derive(Debug, Clone)]
pub struct EngineDSTResult {
    pub seed: u64,
    pub executions: u64,
    pub crashes: u64,
    pub replays: u64,
    pub inserts: u64,
    pub deletes: u64,
    pub blob_faults: u64,
    pub state_faults: u64,
    pub report: Option<JobReport>,
    pub invariant_violations: Vec<String>,
}

impl EngineDSTResult {
    pub fn new(seed: u64) -> Self {
        EngineDSTResult {
            seed,
            executions: 0,
            crashes: 0,
            replays: 0,
            inserts: 0,
            deletes: 0,
            blob_faults: 0,
            state_faults: 0,
            report: None,
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty() && self.report.is_some()
    }

    pub fn summary(&self) -> String {
        let progress = self
            .report
            .as_ref()
            .map(|r| r.progress.to_string())
            .unwrap_or_else(|| "incomplete".to_string());
        format!(
            "Seed {}: {} executions, {} crashes, {} replays, {} blob faults, {} state faults, \
             progress {}, {} violations",
            self.seed,
            self.executions,
            self.crashes,
            self.replays,
            self.blob_faults,
            self.state_faults,
            progress,
            self.invariant_violations.len()
        )
    }
}

type BlobStore = SimulatedObjectStore<InMemoryObjectStore, SimulatedRng>;

/// DST harness for the orchestration host and engine
pub struct EngineDSTHarness {
    config: EngineDSTConfig,
    rng: SimulatedRng,
    store: Arc<InMemoryDicomStore<SimulatedClock>>,
    blob_faults: Arc<BlobStore>,
    state_faults: Arc<BlobStore>,
    observer: Arc<RecordingObserver>,
    host: OrchestrationHost<BackfillJob, SimulatedClock>,
    /// Last committed checkpoint seen by the harness
    committed: Option<Checkpoint<()>>,
    /// Top of the first committed range
    anchor: Option<i64>,
    next_sop: u64,
    result: EngineDSTResult,
}

impl EngineDSTHarness {
    pub async fn new(config: EngineDSTConfig) -> Self {
        let mut rng = SimulatedRng::new(config.seed);
        let clock = SimulatedClock::new(1_700_000_000_000);
        let blobs = InMemoryObjectStore::new();
        let store = Arc::new(InMemoryDicomStore::new(clock.clone(), Arc::new(blobs.clone())));

        let blob_faults = Arc::new(SimulatedObjectStore::new(
            blobs,
            SimulatedRng::new(rng.next_u64()),
            config.blob_faults.clone(),
        ));
        let state_faults = Arc::new(SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            SimulatedRng::new(rng.next_u64()),
            config.state_faults.clone(),
        ));

        let job = Arc::new(BackfillJob::new(store.clone(), blob_faults.clone()));
        let engine = OrchestrationEngine::new(
            job,
            clock.clone(),
            config.retry.clone(),
            CancellationToken::new(),
        );
        let observer = Arc::new(RecordingObserver::new());
        let host = OrchestrationHost::new(
            engine,
            clock,
            Arc::new(ObjectStoreStateStore::new(state_faults.clone(), "dst")),
            observer.clone(),
        );

        let mut harness = EngineDSTHarness {
            result: EngineDSTResult::new(config.seed),
            config,
            rng,
            store,
            blob_faults,
            state_faults,
            observer,
            host,
            committed: None,
            anchor: None,
            next_sop: 0,
        };
        for _ in 0..harness.config.initial_instances {
            harness.insert().await;
        }
        harness
    }

    pub async fn with_seed(seed: u64) -> Self {
        Self::new(EngineDSTConfig::new(seed)).await
    }

    /// Start the job and run up to `max_executions` executions (crashes included)
    pub async fn run(&mut self, max_executions: usize) {
        if !self.start(max_executions).await {
            return;
        }
        for _ in 0..max_executions {
            if self.rng.gen_bool(self.config.insert_prob) {
                self.insert().await;
            }
            if self.rng.gen_bool(self.config.delete_prob) {
                self.delete().await;
            }
            if self.step().await {
                break;
            }
        }
        self.result.blob_faults = self.blob_faults.stats().total_faults();
        self.result.state_faults = self.state_faults.stats().total_faults();
    }

    async fn start(&mut self, attempts: usize) -> bool {
        for _ in 0..attempts.max(1) {
            match self.host.start(INSTANCE_ID, (), self.config.batching).await {
                Ok(()) => return true,
                Err(e) if e.is_retryable() => self.result.crashes += 1,
                Err(e) => {
                    self.violation(format!("Start failed: {}", e));
                    return false;
                }
            }
        }
        self.violation("Start never committed".to_string());
        false
    }

    /// One execution; true once the job completed
    async fn step(&mut self) -> bool {
        self.result.executions += 1;
        let events_before = self.observer.events().len();
        let upper_before = self.committed.as_ref().and_then(|c| c.upper_bound());

        let outcome = self.host.run_execution(INSTANCE_ID).await;
        let events = self.observer.events();
        self.check_plans(&events[events_before..], upper_before);
        self.record_anchor(&events[events_before..]);

        match outcome {
            Ok(ExecutionResult::Continued { next_execution_id }) => {
                self.check_commit(next_execution_id).await;
                false
            }
            Ok(ExecutionResult::Completed(report)) => {
                self.result.report = Some(report);
                true
            }
            Ok(ExecutionResult::Cancelled) => {
                self.violation("Execution cancelled without a cancel request".to_string());
                true
            }
            Err(e) if e.is_retryable() => {
                // The execution may have run; its replay must redo the same work.
                self.result.crashes += 1;
                self.result.replays += 1;
                false
            }
            Err(e) => {
                self.violation(format!("Execution fault: {}", e));
                true
            }
        }
    }

    fn check_plans(&mut self, events: &[ObservedEvent], upper_bound: Option<i64>) {
        for event in events {
            let ObservedEvent::Planned { batches, .. } = event else {
                continue;
            };
            if batches.len() > self.config.batching.max_parallel_count {
                self.violation(format!("Planned {} batches", batches.len()));
            }
            for pair in batches.windows(2) {
                if pair[1].end() >= pair[0].start() {
                    self.violation(format!("Batches {} and {} overlap or are unordered", pair[0], pair[1]));
                }
            }
            if let (Some(upper), Some(top)) = (upper_bound, batches.first()) {
                if top.end() > upper {
                    self.violation(format!(
                        "Batch {} reaches above committed bound {}",
                        top, upper
                    ));
                }
            }
        }
    }

    /// The top of the first committed range; replays may plan a higher top
    /// before that, since inserts continue while the job runs
    fn record_anchor(&mut self, events: &[ObservedEvent]) {
        if self.anchor.is_some() {
            return;
        }
        self.anchor = events.iter().find_map(|event| match event {
            ObservedEvent::Checkpointed { completed, .. } => Some(completed.end()),
            _ => None,
        });
    }

    async fn check_commit(&mut self, next_execution_id: u64) {
        let record = match self.host.record(INSTANCE_ID).await {
            Ok(Some(record)) => record,
            // Reads fail under fault injection; compare on the next commit.
            Ok(None) | Err(_) => return,
        };
        if record.execution_id != next_execution_id {
            self.violation(format!(
                "Record at execution {} after continuing to {}",
                record.execution_id, next_execution_id
            ));
        }
        let next = record.checkpoint;
        if let Some(prev) = self.committed.clone() {
            if let (Some(old), Some(new)) = (prev.completed, next.completed) {
                if new.end() != old.end() || new.start() > old.start() {
                    self.violation(format!("Completed range moved from {} to {}", old, new));
                }
            }
            if prev.completed.is_some() && next.completed.is_none() {
                self.violation("Completed range was lost".to_string());
            }
            if next.progress.total() < prev.progress.total() {
                self.violation(format!(
                    "Progress went backwards: {} -> {}",
                    prev.progress, next.progress
                ));
            }
        }
        self.committed = Some(next);
    }

    /// Check the final state of a completed run
    pub async fn check_invariants(&mut self) {
        let Some(report) = self.result.report.clone() else {
            self.violation("Job did not complete".to_string());
            return;
        };

        let observed = self.observer.checkpointed_total();
        if observed != report.progress {
            self.violation(format!(
                "Observed progress {} differs from committed progress {}",
                observed, report.progress
            ));
        }

        let live = match self.store.watermarks_desc(None, usize::MAX).await {
            Ok(live) => live,
            Err(e) => {
                self.violation(format!("Index read failed: {}", e));
                return;
            }
        };
        let Some(anchor) = self.anchor else {
            if !live.is_empty() && report.completed.is_some() {
                self.violation("Completed range without any plan".to_string());
            }
            return;
        };
        let covered: Vec<i64> = live.iter().copied().filter(|w| *w <= anchor).collect();

        match report.completed {
            Some(range) => {
                if range.end() != anchor {
                    self.violation(format!("Completed {} does not end at anchor {}", range, anchor));
                }
                if let Some(lowest) = covered.last() {
                    if !range.contains(*lowest) {
                        self.violation(format!("Completed {} misses watermark {}", range, lowest));
                    }
                }
            }
            None => self.violation("Completed job has no completed range".to_string()),
        }

        for watermark in live.iter().filter(|w| **w > anchor) {
            if self.store.derived(*watermark).is_some() {
                self.violation(format!(
                    "Watermark {} above anchor {} was processed",
                    watermark, anchor
                ));
            }
        }

        let processed = covered
            .iter()
            .filter(|w| self.store.derived(**w).is_some())
            .count() as u64;
        if report.progress.succeeded > covered.len() as u64 + self.result.deletes {
            self.violation(format!(
                "Succeeded {} exceeds the {} instances in scope",
                report.progress.succeeded,
                covered.len() as u64 + self.result.deletes
            ));
        }
        if report.progress.failed == 0 && processed != covered.len() as u64 {
            self.violation(format!(
                "No failed batch, yet {} of {} covered instances were processed",
                processed,
                covered.len()
            ));
        }
    }

    async fn insert(&mut self) {
        if self.rng.gen_bool(self.config.gap_prob) {
            self.store.skip_watermarks(self.rng.gen_range(1, 4) as i64);
        }
        let sop = self.next_sop;
        self.next_sop += 1;
        let size = self.rng.gen_range(1, 64) as usize;
        let blob = vec![(sop % 251) as u8; size];
        match self
            .store
            .add_instance("1.3.6", "1.3.6.1", &format!("1.3.6.1.{}", sop), &blob, json!({"sop": sop}))
            .await
        {
            Ok(_) => self.result.inserts += 1,
            Err(e) => self.violation(format!("Insert failed: {}", e)),
        }
    }

    async fn delete(&mut self) {
        let live = self.store.live_count() as u64;
        if live == 0 || self.next_sop == 0 {
            return;
        }
        let sop = self.rng.gen_range(0, self.next_sop);
        if self
            .store
            .delete_instance("1.3.6", "1.3.6.1", &format!("1.3.6.1.{}", sop))
            .is_ok()
        {
            self.result.deletes += 1;
        }
    }

    fn violation(&mut self, message: String) {
        self.result.invariant_violations.push(message);
    }

    pub fn result(&self) -> &EngineDSTResult {
        &self.result
    }

    pub fn into_result(self) -> EngineDSTResult {
        self.result
    }
}

/// Run a batch of DST tests with different seeds
pub async fn run_engine_dst_batch(
    base_seed: u64,
    count: usize,
    max_executions: usize,
    config_fn: impl Fn(u64) -> EngineDSTConfig,
) -> Vec<EngineDSTResult> {
    let mut results = Vec::with_capacity(count);
    for i in 0..count {
        let mut harness = EngineDSTHarness::new(config_fn(base_seed + i as u64)).await;
        harness.run(max_executions).await;
        harness.check_invariants().await;
        results.push(harness.into_result());
    }
    results
}

pub fn summarize_engine_batch(results: &[EngineDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let executions: u64 = results.iter().map(|r| r.executions).sum();
    let crashes: u64 = results.iter().map(|r| r.crashes).sum();
    let progress: OperationProgress = results
        .iter()
        .filter_map(|r| r.report.as_ref().map(|report| report.progress))
        .sum();

    let mut summary = format!(
        "Engine DST Batch: {}/{} passed, {} executions, {} crashes, total progress {}",
        passed, total, executions, crashes, progress
    );
    if passed < total {
        summary.push_str("\n\nFailed seeds:");
        for r in results.iter().filter(|r| !r.is_success()) {
            summary.push_str(&format!("\n  {}", r.summary()));
            for v in &r.invariant_violations {
                summary.push_str(&format!("\n    - {}", v));
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_engine_dst_calm_processes_everything() {
        let mut harness = EngineDSTHarness::new(EngineDSTConfig::calm(42)).await;
        harness.run(500).await;
        harness.check_invariants().await;

        let result = harness.result();
        assert!(result.is_success(), "{:?}", result.invariant_violations);
        assert_eq!(result.crashes, 0);
        let report = result.report.as_ref().unwrap();
        assert_eq!(report.progress.failed, 0);
        assert!(report.progress.succeeded > 0);
    }

    #[tokio::test]
    async fn test_engine_dst_chaos_survives_crashes() {
        let mut harness = EngineDSTHarness::new(EngineDSTConfig::chaos(3)).await;
        harness.run(2_000).await;
        harness.check_invariants().await;

        let result = harness.result();
        assert!(result.is_success(), "{}", result.summary());
        assert!(result.blob_faults + result.state_faults > 0);
    }

    #[tokio::test]
    async fn test_engine_dst_deterministic() {
        let mut a = EngineDSTHarness::with_seed(77).await;
        a.run(500).await;
        let mut b = EngineDSTHarness::with_seed(77).await;
        b.run(500).await;
        assert_eq!(a.result().summary(), b.result().summary());
    }
}
