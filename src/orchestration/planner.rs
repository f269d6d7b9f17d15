//! Batch Planner
//!
//! Splits the watermarks a job still has to visit into at most
//! `max_parallel_count` ranges of at most `size` existing watermarks each,
//! highest first. Planning walks downward from the current maximum, so a job
//! anchored at `completed.start - 1` never revisits completed watermarks.
//!
//! ## Contiguity
//!
//! The watermark counter has gaps (failed writes burn watermarks). Each
//! batch's `end` is extended to the previous batch's `start - 1`, so the
//! union of one plan is a single contiguous range and gaps count as covered.
//!
//! ```text
//! watermarks:  25 .. 16 | 15 .. 6 | 5 .. 1      size=10, parallel=3
//! batches:     (16,25)    (6,15)    (1,5)
//! ```

use crate::orchestration::activity::ActivityError;
use crate::orchestration::checkpoint::BatchingOptions;
use crate::orchestration::job::OrchestrationJob;
use crate::orchestration::range::WatermarkRange;
use tracing::debug;

/// Group strictly descending `watermarks` into contiguous batches
///
/// Only the first `size * max_parallel_count` watermarks are used.
pub fn plan_batches(watermarks: &[i64], size: usize, max_parallel_count: usize) -> Vec<WatermarkRange> {
    debug_assert!(
        watermarks.windows(2).all(|w| w[0] > w[1]),
        "watermarks must be strictly descending"
    );
    if size == 0 || max_parallel_count == 0 {
        return Vec::new();
    }

    let mut batches = Vec::with_capacity(max_parallel_count);
    let mut end = match watermarks.first() {
        Some(max) => *max,
        None => return batches,
    };
    for chunk in watermarks.chunks(size).take(max_parallel_count) {
        // `chunk` is non-empty and descending; its last element is the lowest.
        let start = chunk[chunk.len() - 1];
        match WatermarkRange::new(start, end) {
            Some(range) => batches.push(range),
            None => break,
        }
        end = start.saturating_sub(1);
    }

    verify_plan(&batches, None);
    batches
}

/// Check plan invariants (debug builds only)
///
/// Highest first, contiguous, non-overlapping, and entirely at or below
/// `upper_bound` when one is given.
pub fn verify_plan(batches: &[WatermarkRange], upper_bound: Option<i64>) {
    for pair in batches.windows(2) {
        debug_assert!(
            pair[1].is_adjacent_to(&pair[0]),
            "Invariant violated: batches {} and {} are not contiguous",
            pair[0],
            pair[1]
        );
    }
    if let (Some(first), Some(upper)) = (batches.first(), upper_bound) {
        debug_assert!(
            first.end() <= upper,
            "Invariant violated: batch {} above upper bound {}",
            first,
            upper
        );
    }
}

/// Plans batches through a job's planning query
#[derive(Debug, Clone, Copy)]
pub struct BatchPlanner {
    batching: BatchingOptions,
}

impl BatchPlanner {
    pub fn new(batching: BatchingOptions) -> Self {
        BatchPlanner { batching }
    }

    pub fn batching(&self) -> BatchingOptions {
        self.batching
    }

    /// Next batches below `upper_bound`; empty when the job is done
    pub async fn plan<J: OrchestrationJob>(
        &self,
        job: &J,
        filter: &J::Filter,
        upper_bound: Option<i64>,
    ) -> Result<Vec<WatermarkRange>, ActivityError> {
        let limit = self.batching.max_count();
        let watermarks = job.fetch_watermarks(filter, upper_bound, limit).await?;

        if watermarks.len() > limit {
            return Err(ActivityError::permanent(format!(
                "{} planning query returned {} watermarks, limit {}",
                job.name(),
                watermarks.len(),
                limit
            )));
        }
        if !watermarks.windows(2).all(|w| w[0] > w[1]) {
            return Err(ActivityError::permanent(format!(
                "{} planning query returned unordered watermarks",
                job.name()
            )));
        }
        if let (Some(max), Some(upper)) = (watermarks.first(), upper_bound) {
            if *max > upper {
                return Err(ActivityError::permanent(format!(
                    "{} planning query returned watermark {} above bound {}",
                    job.name(),
                    max,
                    upper
                )));
            }
        }

        let batches = plan_batches(
            &watermarks,
            self.batching.size,
            self.batching.max_parallel_count,
        );
        verify_plan(&batches, upper_bound);
        debug!(
            job = job.name(),
            upper_bound = ?upper_bound,
            watermarks = watermarks.len(),
            batches = batches.len(),
            "Planned batches"
        );
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{Rng, SimulatedRng};
    use crate::orchestration::job::ActivityFuture;
    use crate::orchestration::progress::OperationProgress;

    fn desc(from: i64, to: i64) -> Vec<i64> {
        (to..=from).rev().collect()
    }

    fn ranges(pairs: &[(i64, i64)]) -> Vec<WatermarkRange> {
        pairs
            .iter()
            .map(|&(s, e)| WatermarkRange::new(s, e).unwrap())
            .collect()
    }

    #[test]
    fn test_plan_twenty_five_watermarks() {
        let batches = plan_batches(&desc(25, 1), 10, 3);
        assert_eq!(batches, ranges(&[(16, 25), (6, 15), (1, 5)]));
    }

    #[test]
    fn test_plan_caps_batch_count() {
        let batches = plan_batches(&desc(100, 1), 10, 2);
        assert_eq!(batches, ranges(&[(91, 100), (81, 90)]));
    }

    #[test]
    fn test_gaps_absorbed_into_previous_batch() {
        // 20..17 and 12..9 exist; 16..13 burned by failed writes
        let watermarks = vec![20, 19, 18, 17, 12, 11, 10, 9];
        let batches = plan_batches(&watermarks, 3, 5);
        assert_eq!(batches, ranges(&[(18, 20), (11, 17), (9, 10)]));
    }

    #[test]
    fn test_empty_input_means_done() {
        assert!(plan_batches(&[], 10, 3).is_empty());
    }

    #[test]
    fn test_coverage_no_overlap_and_anchoring_random() {
        let mut rng = SimulatedRng::new(0xC0FFEE);
        for _ in 0..200 {
            // Random sparse watermark set
            let mut all: Vec<i64> = (1..=rng.gen_range(0, 300) as i64)
                .filter(|_| rng.gen_bool(0.7))
                .collect();
            all.reverse();
            let size = rng.gen_range(1, 20) as usize;
            let parallel = rng.gen_range(1, 6) as usize;

            let mut completed: Option<WatermarkRange> = None;
            let mut visited: Vec<i64> = Vec::new();
            loop {
                let upper = completed.map(|c| c.start() - 1);
                let eligible: Vec<i64> = all
                    .iter()
                    .copied()
                    .filter(|w| upper.map_or(true, |u| *w <= u))
                    .take(size * parallel)
                    .collect();
                let batches = plan_batches(&eligible, size, parallel);
                if batches.is_empty() {
                    break;
                }
                for pair in batches.windows(2) {
                    assert!(pair[1].is_adjacent_to(&pair[0]));
                    assert!(!pair[0].overlaps(&pair[1]));
                }
                for b in &batches {
                    let inside = eligible.iter().filter(|w| b.contains(**w)).count();
                    assert!(inside >= 1 && inside <= size);
                    if let Some(c) = completed {
                        assert!(!b.overlaps(&c), "re-planned completed range {}", c);
                    }
                    visited.extend(all.iter().filter(|w| b.contains(**w)));
                }
                let span = crate::orchestration::range::batch_span(&batches).unwrap();
                completed = Some(match completed {
                    Some(c) => c.span(&span),
                    None => span,
                });
            }
            // Every watermark visited exactly once
            visited.sort_unstable_by(|a, b| b.cmp(a));
            assert_eq!(visited, all);
        }
    }

    struct FixedJob {
        watermarks: Vec<i64>,
    }

    impl OrchestrationJob for FixedJob {
        type Filter = ();

        fn name(&self) -> &'static str {
            "fixed"
        }

        fn fetch_watermarks<'a>(
            &'a self,
            _filter: &'a (),
            upper_bound: Option<i64>,
            limit: usize,
        ) -> ActivityFuture<'a, Vec<i64>> {
            Box::pin(async move {
                Ok(self
                    .watermarks
                    .iter()
                    .copied()
                    .filter(|w| upper_bound.map_or(true, |u| *w <= u))
                    .take(limit)
                    .collect())
            })
        }

        fn process_batch<'a>(
            &'a self,
            _filter: &'a (),
            _range: WatermarkRange,
        ) -> ActivityFuture<'a, OperationProgress> {
            Box::pin(async { Ok(OperationProgress::ZERO) })
        }
    }

    #[tokio::test]
    async fn test_planner_anchored_at_completed_range_is_empty() {
        let job = FixedJob {
            watermarks: desc(25, 10),
        };
        let planner = BatchPlanner::new(BatchingOptions::new(10, 3));
        let batches = planner.plan(&job, &(), Some(9)).await.unwrap();
        assert!(batches.is_empty());

        let batches = planner.plan(&job, &(), None).await.unwrap();
        assert_eq!(batches, ranges(&[(16, 25), (10, 15)]));
    }

    #[tokio::test]
    async fn test_planner_rejects_unordered_query_results() {
        let job = FixedJob {
            watermarks: vec![1, 2, 3],
        };
        let planner = BatchPlanner::new(BatchingOptions::new(10, 3));
        let err = planner.plan(&job, &(), None).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
