//! Hot path benchmarks for profiling-driven optimization.
//!
//! Run with: `cargo bench --bench hot_paths`
//! Compare baselines: `cargo bench --bench hot_paths -- --baseline main`
//!
//! Covers the per-iteration work of the orchestration engine (planning,
//! progress folding, checkpoint advance), the backfill digest and a change
//! feed page read.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use dicom_ops::changefeed::{ChangeFeedOrder, ChangeFeedStore, TimeRange};
use dicom_ops::clock::{SimulatedClock, Timestamp};
use dicom_ops::jobs::BackfillJob;
use dicom_ops::orchestration::{
    plan_batches, BatchingOptions, Checkpoint, OperationProgress, WatermarkRange,
};
use dicom_ops::storage::{InMemoryDicomStore, InMemoryObjectStore};
use serde_json::json;
use std::sync::Arc;

/// Descending watermarks with every `gap_every`-th one missing
fn sparse_watermarks(count: i64, gap_every: i64) -> Vec<i64> {
    (1..=count)
        .rev()
        .filter(|w| gap_every == 0 || w % gap_every != 0)
        .collect()
}

fn bench_plan_batches(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_batches");

    for (size, parallel) in [(10, 3), (100, 8), (1000, 16)] {
        let watermarks = sparse_watermarks((size * parallel) as i64 + 50, 7);
        group.throughput(Throughput::Elements(watermarks.len() as u64));
        group.bench_function(format!("size_{}_parallel_{}", size, parallel), |b| {
            b.iter(|| plan_batches(black_box(&watermarks), size, parallel))
        });
    }

    group.finish();
}

fn bench_progress_fold(c: &mut Criterion) {
    let mut group = c.benchmark_group("progress_fold");

    for batches in [4, 64, 1024] {
        let results: Vec<OperationProgress> = (0..batches)
            .map(|i| OperationProgress::new(i as u64 % 100, (i % 3 == 0) as u64))
            .collect();
        group.throughput(Throughput::Elements(batches as u64));
        group.bench_function(format!("batches_{}", batches), |b| {
            b.iter(|| black_box(&results).iter().sum::<OperationProgress>())
        });
    }

    group.finish();
}

fn bench_checkpoint_advance(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_advance");
    group.throughput(Throughput::Elements(1));

    let batching = BatchingOptions::new(100, 8);
    group.bench_function("one_iteration", |b| {
        let mut checkpoint = Checkpoint::new(batching, ());
        let mut top = 1_000_000i64;
        b.iter(|| {
            if top < 800 {
                checkpoint = Checkpoint::new(batching, ());
                top = 1_000_000;
            }
            let start = top - 799;
            let range = WatermarkRange::new(start, top).unwrap_or(WatermarkRange::single(top));
            checkpoint = checkpoint.advance(
                black_box(range),
                OperationProgress::succeeded(800),
                Timestamp(top as u64),
            );
            top = start - 1;
        })
    });

    group.finish();
}

fn bench_backfill_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("backfill_digest");

    for len in [4 * 1024, 512 * 1024] {
        let data = vec![0x5Au8; len];
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(format!("bytes_{}", len), |b| {
            b.iter(|| BackfillJob::derive(black_box(&data)))
        });
    }

    group.finish();
}

fn bench_feed_page(c: &mut Criterion) {
    let mut group = c.benchmark_group("feed_page");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let store = Arc::new(InMemoryDicomStore::new(
        SimulatedClock::new(0),
        Arc::new(InMemoryObjectStore::new()),
    ));
    runtime.block_on(async {
        for i in 0..10_000 {
            store
                .add_instance("1", "1.1", &format!("1.1.{}", i), b"px", json!({}))
                .await
                .expect("seed");
        }
    });

    for limit in [10, 100] {
        group.throughput(Throughput::Elements(limit as u64));
        group.bench_function(format!("ascending_limit_{}", limit), |b| {
            b.iter(|| {
                runtime.block_on(store.get_range(
                    TimeRange::ALL,
                    black_box(5_000),
                    limit,
                    ChangeFeedOrder::Ascending,
                ))
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_plan_batches,
    bench_progress_fold,
    bench_checkpoint_advance,
    bench_backfill_digest,
    bench_feed_page,
);

criterion_main!(benches);
