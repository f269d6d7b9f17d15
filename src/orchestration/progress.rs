//! Success/failure counters folded across batches and iterations.

use serde::{Deserialize, Serialize};
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// Counts of units that succeeded or failed
///
/// Combination is associative and commutative, so batch results may be
/// folded in completion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OperationProgress {
    pub succeeded: u64,
    pub failed: u64,
}

impl OperationProgress {
    pub const ZERO: OperationProgress = OperationProgress {
        succeeded: 0,
        failed: 0,
    };

    pub fn new(succeeded: u64, failed: u64) -> Self {
        OperationProgress { succeeded, failed }
    }

    pub fn succeeded(count: u64) -> Self {
        OperationProgress::new(count, 0)
    }

    /// One unit that could not be completed
    pub fn one_failed() -> Self {
        OperationProgress::new(0, 1)
    }

    pub fn total(&self) -> u64 {
        self.succeeded.saturating_add(self.failed)
    }
}

impl Add for OperationProgress {
    type Output = OperationProgress;

    fn add(self, rhs: Self) -> Self::Output {
        OperationProgress {
            succeeded: self.succeeded.saturating_add(rhs.succeeded),
            failed: self.failed.saturating_add(rhs.failed),
        }
    }
}

impl AddAssign for OperationProgress {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for OperationProgress {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(OperationProgress::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a OperationProgress> for OperationProgress {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

impl std::fmt::Display for OperationProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} succeeded, {} failed", self.succeeded, self.failed)
    }
}
