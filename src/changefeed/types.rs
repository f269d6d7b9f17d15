//! Change feed records and the consumer cursor.

use crate::clock::Timestamp;
use serde::{Deserialize, Serialize};

/// Kind of mutation recorded by an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeFeedAction {
    Create,
    Update,
    Delete,
}

/// Lifecycle of the affected instance, evaluated when the entry is read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeFeedState {
    /// The entry's version is the live version
    Current,
    /// The instance no longer exists
    Deleted,
    /// A newer version superseded this one
    Replaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChangeFeedOrder {
    #[default]
    Ascending,
    Descending,
}

/// Half-open event-time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    /// The unbounded window
    pub const ALL: TimeRange = TimeRange {
        start: Timestamp::MIN,
        end: Timestamp::MAX,
    };

    /// `None` when `start > end`
    pub fn new(start: Timestamp, end: Timestamp) -> Option<Self> {
        (start <= end).then_some(TimeRange { start, end })
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && (ts < self.end || self.end == Timestamp::MAX)
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        TimeRange::ALL
    }
}

/// One recorded mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFeedEntry {
    /// Strictly increasing, assigned by the store, never reused
    pub sequence: i64,
    pub timestamp: Timestamp,
    pub action: ChangeFeedAction,
    pub study_uid: String,
    pub series_uid: String,
    pub sop_uid: String,
    pub state: ChangeFeedState,
    /// Watermark of the object version this mutation produced (or removed)
    pub original_version: i64,
    /// Live watermark at read time; absent once the instance is deleted
    pub current_version: Option<i64>,
    /// Populated on demand, only in a caller-local copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Durable cursor of a feed consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub synced_sequence: i64,
    pub synced_date: Timestamp,
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState {
            synced_sequence: 0,
            synced_date: Timestamp::MIN,
        }
    }
}
