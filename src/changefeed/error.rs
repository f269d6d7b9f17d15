//! Errors surfaced by the change feed service and processor.

use crate::storage::StoreError;

/// Error type for change feed queries
#[derive(Debug)]
pub enum ChangeFeedError {
    /// Caller supplied an out-of-range argument; never retried
    InvalidArgument(String),
    /// Feed store query failed
    Store(StoreError),
    /// Metadata enrichment failed for an entry
    Metadata { sequence: i64, source: StoreError },
}

impl ChangeFeedError {
    pub fn is_transient(&self) -> bool {
        match self {
            ChangeFeedError::InvalidArgument(_) => false,
            ChangeFeedError::Store(e) => e.is_transient(),
            ChangeFeedError::Metadata { source, .. } => source.is_transient(),
        }
    }
}

impl std::fmt::Display for ChangeFeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeFeedError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            ChangeFeedError::Store(e) => write!(f, "Change feed store error: {}", e),
            ChangeFeedError::Metadata { sequence, source } => {
                write!(f, "Metadata enrichment failed for sequence {}: {}", sequence, source)
            }
        }
    }
}

impl std::error::Error for ChangeFeedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChangeFeedError::InvalidArgument(_) => None,
            ChangeFeedError::Store(e) => Some(e),
            ChangeFeedError::Metadata { source, .. } => Some(source),
        }
    }
}

impl From<StoreError> for ChangeFeedError {
    fn from(e: StoreError) -> Self {
        ChangeFeedError::Store(e)
    }
}

/// Failure reported by a feed sink for one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkError {
    pub sequence: i64,
    pub message: String,
}

impl SinkError {
    pub fn new(sequence: i64, message: impl Into<String>) -> Self {
        SinkError {
            sequence,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sink failed at sequence {}: {}", self.sequence, self.message)
    }
}

impl std::error::Error for SinkError {}
