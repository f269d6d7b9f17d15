//! Inclusive watermark intervals, the unit of batching.

use serde::{Deserialize, Serialize};

/// Inclusive interval `[start, end]` of object-version watermarks
///
/// # Invariants
/// - `start <= end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRange")]
pub struct WatermarkRange {
    start: i64,
    end: i64,
}

#[derive(Deserialize)]
struct RawRange {
    start: i64,
    end: i64,
}

impl TryFrom<RawRange> for WatermarkRange {
    type Error = String;

    fn try_from(raw: RawRange) -> Result<Self, Self::Error> {
        WatermarkRange::new(raw.start, raw.end)
            .ok_or_else(|| format!("invalid watermark range ({}, {})", raw.start, raw.end))
    }
}

impl WatermarkRange {
    /// `None` when `start > end`
    pub fn new(start: i64, end: i64) -> Option<Self> {
        (start <= end).then_some(WatermarkRange { start, end })
    }

    /// A range covering a single watermark
    pub fn single(watermark: i64) -> Self {
        WatermarkRange {
            start: watermark,
            end: watermark,
        }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    /// Number of watermarks covered
    pub fn len(&self) -> u64 {
        self.end.abs_diff(self.start) + 1
    }

    /// Never true; a range covers at least one watermark.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, watermark: i64) -> bool {
        self.start <= watermark && watermark <= self.end
    }

    pub fn overlaps(&self, other: &WatermarkRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// `self` ends exactly one before `next` starts
    pub fn is_adjacent_to(&self, next: &WatermarkRange) -> bool {
        self.end.checked_add(1) == Some(next.start)
    }

    /// Smallest range covering both
    pub fn span(&self, other: &WatermarkRange) -> WatermarkRange {
        WatermarkRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl std::fmt::Display for WatermarkRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.start, self.end)
    }
}

/// Span of a batch list planned highest-first, or `None` when empty
///
/// The planner guarantees the batches are contiguous, so the span is exactly
/// their union.
pub fn batch_span(batches: &[WatermarkRange]) -> Option<WatermarkRange> {
    let first = batches.first()?;
    let last = batches.last()?;
    Some(first.span(last))
}
