//! Error type shared by the store adapters.

use std::io::{Error as IoError, ErrorKind};

/// Error returned by store queries and blob operations
#[derive(Debug)]
pub enum StoreError {
    /// Store unreachable or timed out
    Unavailable(String),
    /// Store asked us to back off
    Throttled(String),
    /// Optimistic-concurrency conflict on write
    Conflict(String),
    /// Stored data could not be interpreted
    Corrupt(String),
    /// The addressed instance does not exist
    NotFound(String),
    /// The instance already exists
    AlreadyExists(String),
    /// Underlying I/O error
    Io(IoError),
}

impl StoreError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Throttled(_) | StoreError::Conflict(_) => {
                true
            }
            StoreError::Corrupt(_) | StoreError::NotFound(_) | StoreError::AlreadyExists(_) => {
                false
            }
            StoreError::Io(e) => matches!(
                e.kind(),
                ErrorKind::TimedOut
                    | ErrorKind::Interrupted
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::WouldBlock
                    | ErrorKind::Other
            ),
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
            StoreError::Throttled(msg) => write!(f, "Store throttled: {}", msg),
            StoreError::Conflict(msg) => write!(f, "Write conflict: {}", msg),
            StoreError::Corrupt(msg) => write!(f, "Corrupt data: {}", msg),
            StoreError::NotFound(msg) => write!(f, "Not found: {}", msg),
            StoreError::AlreadyExists(msg) => write!(f, "Already exists: {}", msg),
            StoreError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<IoError> for StoreError {
    fn from(e: IoError) -> Self {
        match e.kind() {
            ErrorKind::InvalidData => StoreError::Corrupt(e.to_string()),
            ErrorKind::NotFound => StoreError::NotFound(e.to_string()),
            _ => StoreError::Io(e),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}
