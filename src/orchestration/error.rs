//! Engine-level faults.
//!
//! Per-batch failures never surface here; they are counted in
//! `OperationProgress`. These errors abort an iteration before anything is
//! checkpointed, so rerunning the execution replays it safely.

use crate::orchestration::activity::ActivityError;
use crate::orchestration::state_store::StateStoreError;

#[derive(Debug)]
pub enum OrchestrationError {
    /// The planning query failed permanently or exhausted its retries
    Planning {
        job: &'static str,
        source: ActivityError,
    },
    /// The finalization activity failed permanently or exhausted its retries
    Finalization {
        job: &'static str,
        source: ActivityError,
    },
    /// Reading or writing the orchestration record failed
    StateStore(StateStoreError),
    /// Another execution of this instance is in progress
    AlreadyRunning(String),
    /// No record exists for this instance
    NotFound(String),
}

impl OrchestrationError {
    /// Replaying the execution may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestrationError::Planning { source, .. }
            | OrchestrationError::Finalization { source, .. } => source.is_transient(),
            OrchestrationError::StateStore(StateStoreError::Corrupt(_)) => false,
            OrchestrationError::StateStore(_) => true,
            OrchestrationError::AlreadyRunning(_) | OrchestrationError::NotFound(_) => false,
        }
    }
}

impl std::fmt::Display for OrchestrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestrationError::Planning { job, source } => {
                write!(f, "Planning failed for {}: {}", job, source)
            }
            OrchestrationError::Finalization { job, source } => {
                write!(f, "Finalization failed for {}: {}", job, source)
            }
            OrchestrationError::StateStore(e) => write!(f, "{}", e),
            OrchestrationError::AlreadyRunning(id) => {
                write!(f, "Orchestration {} is already running", id)
            }
            OrchestrationError::NotFound(id) => write!(f, "Orchestration {} not found", id),
        }
    }
}

impl std::error::Error for OrchestrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OrchestrationError::Planning { source, .. }
            | OrchestrationError::Finalization { source, .. } => Some(source),
            OrchestrationError::StateStore(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StateStoreError> for OrchestrationError {
    fn from(e: StateStoreError) -> Self {
        OrchestrationError::StateStore(e)
    }
}
