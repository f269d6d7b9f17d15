//! Deterministic Simulation Testing for the Change Feed Processor
//!
//! Shadow-state harness that interleaves store mutations with processor
//! passes while the feed query, the sync state store and the sink fail at
//! seeded random points.
//!
//! ## Invariants
//!
//! - Every pass delivers a gapless run starting right after the cursor
//! - The cursor only moves on a fully handled page, and never backwards
//! - After faults stop, draining reaches the end of the feed and every
//!   sequence was delivered at least once

use crate::changefeed::error::SinkError;
use crate::changefeed::processor::{ChangeFeedProcessor, FeedSink, PollOutcome};
use crate::changefeed::store::{ChangeFeedStore, StoreFuture};
use crate::changefeed::sync_state::{InMemorySyncStateStore, SyncFuture, SyncStateStore};
use crate::changefeed::types::{ChangeFeedEntry, ChangeFeedOrder, SyncState, TimeRange};
use crate::clock::{SimulatedClock, Timestamp};
use crate::config::ProcessorConfig;
use crate::io::simulation::SimulatedRng;
use crate::io::Rng;
use crate::orchestration::WatermarkRange;
use crate::storage::{InMemoryDicomStore, InMemoryObjectStore, StoreError};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Configuration for processor DST
#[derive(Debug, Clone)]
pub struct ProcessorDSTConfig {
    pub seed: u64,
    /// Probability that a feed page read fails
    pub feed_fail_prob: f64,
    /// Probability that a sync state read or write fails
    pub sync_state_fail_prob: f64,
    /// Probability that the sink rejects an entry
    pub sink_fail_prob: f64,
    /// Probability that an operation is a processor pass (vs a mutation)
    pub poll_prob: f64,
    pub update_prob: f64,
    pub delete_prob: f64,
    /// Size of the SOP instance UID space
    pub num_instances: u64,
    pub page_size: usize,
}

impl Default for ProcessorDSTConfig {
    fn default() -> Self {
        ProcessorDSTConfig {
            seed: 0,
            feed_fail_prob: 0.05,
            sync_state_fail_prob: 0.02,
            sink_fail_prob: 0.05,
            poll_prob: 0.3,
            update_prob: 0.2,
            delete_prob: 0.15,
            num_instances: 40,
            page_size: 5,
        }
    }
}

impl ProcessorDSTConfig {
    pub fn new(seed: u64) -> Self {
        ProcessorDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// No faults
    pub fn calm(seed: u64) -> Self {
        ProcessorDSTConfig {
            seed,
            feed_fail_prob: 0.0,
            sync_state_fail_prob: 0.0,
            sink_fail_prob: 0.0,
            ..Default::default()
        }
    }

    pub fn moderate(seed: u64) -> Self {
        Self::new(seed)
    }

    /// Frequent faults everywhere, small pages
    pub fn chaos(seed: u64) -> Self {
        ProcessorDSTConfig {
            seed,
            feed_fail_prob: 0.2,
            sync_state_fail_prob: 0.1,
            sink_fail_prob: 0.15,
            poll_prob: 0.4,
            page_size: 3,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProcessorOperation {
    Add { sop: u64 },
    Update { sop: u64 },
    Delete { sop: u64 },
    Poll,
}

/// Result of a processor DST run
#[derive(Debug, Clone)]
pub struct ProcessorDSTResult {
    pub seed: u64,
    pub total_operations: u64,
    pub mutations: u64,
    pub polls: u64,
    pub pages_delivered: u64,
    pub entries_delivered: u64,
    pub redeliveries: u64,
    pub sink_failures: u64,
    pub store_failures: u64,
    pub invariant_violations: Vec<String>,
}

impl ProcessorDSTResult {
    pub fn new(seed: u64) -> Self {
        ProcessorDSTResult {
            seed,
            total_operations: 0,
            mutations: 0,
            polls: 0,
            pages_delivered: 0,
            entries_delivered: 0,
            redeliveries: 0,
            sink_failures: 0,
            store_failures: 0,
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops ({} mutations, {} polls), {} pages, {} entries ({} redelivered), \
             {} sink failures, {} store failures, {} violations",
            self.seed,
            self.total_operations,
            self.mutations,
            self.polls,
            self.pages_delivered,
            self.entries_delivered,
            self.redeliveries,
            self.sink_failures,
            self.store_failures,
            self.invariant_violations.len()
        )
    }
}

/// Seeded fault source that can be switched off for the drain phase
struct FaultInjector {
    rng: Mutex<SimulatedRng>,
    probability: f64,
    enabled: AtomicBool,
    injected: AtomicU64,
}

impl FaultInjector {
    fn new(seed: u64, probability: f64) -> Self {
        FaultInjector {
            rng: Mutex::new(SimulatedRng::new(seed)),
            probability,
            enabled: AtomicBool::new(true),
            injected: AtomicU64::new(0),
        }
    }

    fn should_fail(&self) -> bool {
        if !self.enabled.load(Ordering::SeqCst) {
            return false;
        }
        let fail = self.rng.lock().gen_bool(self.probability);
        if fail {
            self.injected.fetch_add(1, Ordering::SeqCst);
        }
        fail
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }
}

struct FaultyFeed {
    inner: Arc<InMemoryDicomStore<SimulatedClock>>,
    faults: FaultInjector,
}

impl ChangeFeedStore for FaultyFeed {
    fn get_latest(&self, order: ChangeFeedOrder) -> StoreFuture<'_, Option<ChangeFeedEntry>> {
        self.inner.get_latest(order)
    }

    fn get_range(
        &self,
        time_range: TimeRange,
        offset: i64,
        limit: usize,
        order: ChangeFeedOrder,
    ) -> StoreFuture<'_, Vec<ChangeFeedEntry>> {
        if self.faults.should_fail() {
            return Box::pin(async { Err(StoreError::Unavailable("injected feed fault".into())) });
        }
        self.inner.get_range(time_range, offset, limit, order)
    }

    fn get_deleted_batch(
        &self,
        batch_size: usize,
        time_window: Option<TimeRange>,
        watermark_range: Option<WatermarkRange>,
    ) -> StoreFuture<'_, Vec<ChangeFeedEntry>> {
        self.inner
            .get_deleted_batch(batch_size, time_window, watermark_range)
    }

    fn get_max_deleted_watermark(&self, timestamp: Timestamp) -> StoreFuture<'_, Option<i64>> {
        self.inner.get_max_deleted_watermark(timestamp)
    }
}

struct FaultySyncState {
    inner: InMemorySyncStateStore,
    faults: FaultInjector,
}

impl SyncStateStore for FaultySyncState {
    fn get(&self) -> SyncFuture<'_, SyncState> {
        if self.faults.should_fail() {
            return Box::pin(async { Err(StoreError::Throttled("injected read fault".into())) });
        }
        self.inner.get()
    }

    fn update(&self, state: SyncState) -> SyncFuture<'_, ()> {
        if self.faults.should_fail() {
            return Box::pin(async { Err(StoreError::Unavailable("injected write fault".into())) });
        }
        self.inner.update(state)
    }
}

struct FlakySink {
    faults: FaultInjector,
    delivered: Mutex<Vec<i64>>,
}

impl FeedSink for FlakySink {
    fn handle<'a>(
        &'a self,
        entry: &'a ChangeFeedEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        Box::pin(async move {
            if self.faults.should_fail() {
                return Err(SinkError::new(entry.sequence, "injected sink fault"));
            }
            self.delivered.lock().push(entry.sequence);
            Ok(())
        })
    }
}

/// Generates the mutation/poll mix and tracks which UIDs are live
pub struct ProcessorWorkload {
    rng: SimulatedRng,
    config: ProcessorDSTConfig,
    live: BTreeSet<u64>,
}

impl ProcessorWorkload {
    pub fn new(config: ProcessorDSTConfig) -> Self {
        ProcessorWorkload {
            rng: SimulatedRng::new(config.seed),
            config,
            live: BTreeSet::new(),
        }
    }

    pub fn next_operation(&mut self) -> ProcessorOperation {
        if self.rng.gen_bool(self.config.poll_prob) {
            return ProcessorOperation::Poll;
        }
        if let Some(sop) = self.pick_live() {
            if self.rng.gen_bool(self.config.delete_prob) {
                self.live.remove(&sop);
                return ProcessorOperation::Delete { sop };
            }
            if self.rng.gen_bool(self.config.update_prob) {
                return ProcessorOperation::Update { sop };
            }
        }
        let sop = self.rng.gen_range(0, self.config.num_instances);
        if self.live.insert(sop) {
            ProcessorOperation::Add { sop }
        } else {
            ProcessorOperation::Update { sop }
        }
    }

    fn pick_live(&mut self) -> Option<u64> {
        if self.live.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0, self.live.len() as u64) as usize;
        self.live.iter().nth(index).copied()
    }

    fn tick_ms(&mut self) -> u64 {
        self.rng.gen_range(1, 50)
    }
}

/// DST harness for [`ChangeFeedProcessor`]
pub struct ProcessorDSTHarness {
    config: ProcessorDSTConfig,
    clock: SimulatedClock,
    store: Arc<InMemoryDicomStore<SimulatedClock>>,
    feed: Arc<FaultyFeed>,
    sync_state: Arc<FaultySyncState>,
    sink: Arc<FlakySink>,
    processor: ChangeFeedProcessor<SimulatedClock>,
    workload: ProcessorWorkload,
    cancel: CancellationToken,
    result: ProcessorDSTResult,
    /// Highest sequence delivered so far, for redelivery accounting
    high_water: i64,
}

impl ProcessorDSTHarness {
    pub fn new(config: ProcessorDSTConfig) -> Self {
        let clock = SimulatedClock::new(1_000_000);
        let store = Arc::new(InMemoryDicomStore::new(
            clock.clone(),
            Arc::new(InMemoryObjectStore::new()),
        ));
        let feed = Arc::new(FaultyFeed {
            inner: store.clone(),
            faults: FaultInjector::new(config.seed.wrapping_add(1), config.feed_fail_prob),
        });
        let sync_state = Arc::new(FaultySyncState {
            inner: InMemorySyncStateStore::new(),
            faults: FaultInjector::new(config.seed.wrapping_add(2), config.sync_state_fail_prob),
        });
        let sink = Arc::new(FlakySink {
            faults: FaultInjector::new(config.seed.wrapping_add(3), config.sink_fail_prob),
            delivered: Mutex::new(Vec::new()),
        });
        let processor_config = ProcessorConfig {
            page_size: config.page_size,
            steady_state_interval: Duration::from_millis(500),
            catch_up_interval: Duration::ZERO,
        };
        let processor = ChangeFeedProcessor::new(
            feed.clone(),
            sync_state.clone(),
            sink.clone(),
            clock.clone(),
            processor_config,
        );

        ProcessorDSTHarness {
            workload: ProcessorWorkload::new(config.clone()),
            result: ProcessorDSTResult::new(config.seed),
            config,
            clock,
            store,
            feed,
            sync_state,
            sink,
            processor,
            cancel: CancellationToken::new(),
            high_water: 0,
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::new(ProcessorDSTConfig::new(seed))
    }

    pub async fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            let op = self.workload.next_operation();
            self.execute_operation(op).await;
        }
    }

    async fn execute_operation(&mut self, op: ProcessorOperation) {
        self.result.total_operations += 1;
        let tick = self.workload.tick_ms();
        self.clock.advance_ms(tick);

        let outcome = match op {
            ProcessorOperation::Add { sop } => self
                .store
                .add_instance("1.2.840", "1.2.840.1", &sop_uid(sop), b"DICM", json!({"sop": sop}))
                .await
                .map(|_| ()),
            ProcessorOperation::Update { sop } => self
                .store
                .update_instance("1.2.840", "1.2.840.1", &sop_uid(sop), json!({"sop": sop, "v": tick}))
                .await
                .map(|_| ()),
            ProcessorOperation::Delete { sop } => self
                .store
                .delete_instance("1.2.840", "1.2.840.1", &sop_uid(sop))
                .map(|_| ()),
            ProcessorOperation::Poll => {
                self.poll_and_check().await;
                return;
            }
        };
        match outcome {
            Ok(()) => self.result.mutations += 1,
            Err(e) => self.violation(format!("Mutation failed without injected faults: {}", e)),
        }
    }

    /// One processor pass, checked against the cursor before and after
    async fn poll_and_check(&mut self) -> PollOutcome {
        self.result.polls += 1;
        let before = self.cursor();
        let delivered_before = self.sink.delivered.lock().len();

        let outcome = self.processor.poll_once(&self.cancel).await;

        let after = self.cursor();
        let fresh: Vec<i64> = self.sink.delivered.lock()[delivered_before..].to_vec();

        for (i, sequence) in fresh.iter().enumerate() {
            let expected = before + 1 + i as i64;
            if *sequence != expected {
                self.violation(format!(
                    "Pass from cursor {} delivered {} at position {}, expected {}",
                    before, sequence, i, expected
                ));
                break;
            }
        }
        for sequence in &fresh {
            if *sequence <= self.high_water {
                self.result.redeliveries += 1;
            }
            self.high_water = self.high_water.max(*sequence);
        }
        self.result.entries_delivered += fresh.len() as u64;

        if after < before {
            self.violation(format!("Cursor moved backwards: {} -> {}", before, after));
        }
        match &outcome {
            PollOutcome::Delivered {
                count,
                synced_sequence,
            } => {
                self.result.pages_delivered += 1;
                if after != *synced_sequence || fresh.last() != Some(synced_sequence) {
                    self.violation(format!(
                        "Delivered page ends at {:?} but cursor is {} (reported {})",
                        fresh.last(),
                        after,
                        synced_sequence
                    ));
                }
                if fresh.len() != *count || *count > self.config.page_size {
                    self.violation(format!(
                        "Page reported {} entries, sink saw {} (page size {})",
                        count,
                        fresh.len(),
                        self.config.page_size
                    ));
                }
            }
            PollOutcome::Empty | PollOutcome::Cancelled => {
                if after != before || !fresh.is_empty() {
                    self.violation(format!("{:?} pass changed state", outcome));
                }
            }
            PollOutcome::SinkFailed(_) | PollOutcome::StoreFailed(_) => {
                if matches!(outcome, PollOutcome::SinkFailed(_)) {
                    self.result.sink_failures += 1;
                } else {
                    self.result.store_failures += 1;
                }
                if after != before {
                    self.violation(format!(
                        "Cursor moved from {} to {} on a failed pass",
                        before, after
                    ));
                }
            }
        }
        outcome
    }

    /// Disable faults, drain the feed and check end-to-end delivery
    pub async fn check_invariants(&mut self) {
        self.feed.faults.disable();
        self.sync_state.faults.disable();
        self.sink.faults.disable();

        let feed_len = self.store.feed_len() as i64;
        let max_passes = feed_len / self.config.page_size as i64 + 2;
        let mut drained = false;
        for _ in 0..max_passes {
            if let PollOutcome::Empty = self.poll_and_check().await {
                drained = true;
                break;
            }
        }
        if !drained {
            self.violation(format!(
                "Feed of {} entries not drained in {} passes",
                feed_len, max_passes
            ));
        }

        let cursor = self.cursor();
        if cursor != feed_len {
            self.violation(format!(
                "Cursor {} does not reach the end of the feed ({})",
                cursor, feed_len
            ));
        }
        let seen: BTreeSet<i64> = self.sink.delivered.lock().iter().copied().collect();
        let missing: Vec<i64> = (1..=feed_len).filter(|s| !seen.contains(s)).take(10).collect();
        if !missing.is_empty() {
            self.violation(format!("Sequences never delivered (first 10): {:?}", missing));
        }
    }

    fn cursor(&self) -> i64 {
        self.sync_state
            .inner
            .stored()
            .map(|s| s.synced_sequence)
            .unwrap_or(0)
    }

    fn violation(&mut self, message: String) {
        self.result.invariant_violations.push(message);
    }

    pub fn result(&self) -> &ProcessorDSTResult {
        &self.result
    }

    pub fn into_result(self) -> ProcessorDSTResult {
        self.result
    }
}

fn sop_uid(sop: u64) -> String {
    format!("1.2.840.1.{}", sop)
}

/// Run a batch of DST tests with different seeds
pub async fn run_processor_dst_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> ProcessorDSTConfig,
) -> Vec<ProcessorDSTResult> {
    let mut results = Vec::with_capacity(count);
    for i in 0..count {
        let mut harness = ProcessorDSTHarness::new(config_fn(base_seed + i as u64));
        harness.run(ops_per_run).await;
        harness.check_invariants().await;
        results.push(harness.into_result());
    }
    results
}

pub fn summarize_processor_batch(results: &[ProcessorDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let entries: u64 = results.iter().map(|r| r.entries_delivered).sum();
    let redeliveries: u64 = results.iter().map(|r| r.redeliveries).sum();
    let faults: u64 = results
        .iter()
        .map(|r| r.sink_failures + r.store_failures)
        .sum();

    let mut summary = format!(
        "Processor DST Batch: {}/{} passed, {} entries delivered, {} redelivered, {} failed passes",
        passed, total, entries, redeliveries, faults
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
