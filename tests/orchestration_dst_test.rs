//! Orchestration Engine DST Tests
//!
//! Seed-based simulation of a durable backfill job: crashes between
//! executions, replays, object store faults on both the blobs and the
//! checkpoint records, and instances inserted or deleted while it runs.
//!
//! ## Test Categories
//!
//! - **Calm tests**: No faults, the job covers every live instance
//! - **Moderate tests**: Occasional faults, checkpoints stay monotonic
//! - **Chaos tests**: Frequent faults and crashes, progress stays exact

use dicom_ops::orchestration::{
    run_engine_dst_batch, summarize_engine_batch, EngineDSTConfig, EngineDSTHarness,
};

// =============================================================================
// Single Seed Tests
// =============================================================================

#[tokio::test]
async fn test_engine_dst_single_calm() {
    let mut harness = EngineDSTHarness::new(EngineDSTConfig::calm(12345)).await;

    harness.run(1_000).await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("{}", result.summary());

    assert!(result.is_success(), "{:?}", result.invariant_violations);
    let report = result.report.as_ref().unwrap();
    assert_eq!(report.progress.failed, 0);
}

#[tokio::test]
async fn test_engine_dst_single_moderate() {
    let mut harness = EngineDSTHarness::new(EngineDSTConfig::moderate(54321)).await;

    harness.run(1_000).await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("{}", result.summary());
    assert!(
        result.invariant_violations.is_empty(),
        "{:?}",
        result.invariant_violations
    );
}

#[tokio::test]
async fn test_engine_dst_single_chaos() {
    let mut harness = EngineDSTHarness::new(EngineDSTConfig::chaos(99999)).await;

    harness.run(2_000).await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("{}", result.summary());
    assert!(
        result.invariant_violations.is_empty(),
        "{:?}",
        result.invariant_violations
    );
}

// =============================================================================
// Multi-Seed Batch Tests (DST)
// =============================================================================

#[tokio::test]
async fn test_engine_dst_100_seeds_calm() {
    let results = run_engine_dst_batch(0, 100, 1_000, EngineDSTConfig::calm).await;
    let summary = summarize_engine_batch(&results);
    println!("{}", summary);

    assert!(results.iter().all(|r| r.is_success()), "{}", summary);
}

#[tokio::test]
async fn test_engine_dst_30_seeds_moderate() {
    let results = run_engine_dst_batch(1_000, 30, 1_000, EngineDSTConfig::moderate).await;
    let summary = summarize_engine_batch(&results);
    println!("{}", summary);

    assert!(
        results.iter().all(|r| r.invariant_violations.is_empty()),
        "{}",
        summary
    );
}

#[tokio::test]
async fn test_engine_dst_10_seeds_chaos() {
    let results = run_engine_dst_batch(5_000, 10, 2_000, EngineDSTConfig::chaos).await;
    let summary = summarize_engine_batch(&results);
    println!("{}", summary);

    assert!(
        results.iter().all(|r| r.invariant_violations.is_empty()),
        "{}",
        summary
    );
}

// =============================================================================
// Determinism
// =============================================================================

#[tokio::test]
async fn test_engine_dst_same_seed_same_run() {
    let a = run_engine_dst_batch(777, 1, 1_000, EngineDSTConfig::chaos).await;
    let b = run_engine_dst_batch(777, 1, 1_000, EngineDSTConfig::chaos).await;
    assert_eq!(a[0].summary(), b[0].summary());
}
