//! Activity Executor
//!
//! Runs one idempotent unit of work with retry. Failures carry an explicit
//! [`ErrorKind`]; only `Transient` failures are retried. Backoff sleeps go
//! through the injected [`Clock`], so simulated runs record the exact
//! schedule without waiting.
//!
//! ## Design (TigerStyle)
//!
//! - Attempts are bounded: an activity runs at most `max_attempts` times
//! - Cancellation is observed before each attempt and during backoff, never mid-attempt
//! - The outcome distinguishes exhausted, permanent and cancelled

use crate::clock::Clock;
use crate::storage::StoreError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network timeout, throttling, write conflict; worth retrying
    Transient,
    /// Malformed data or a broken invariant; retrying cannot help
    Permanent,
}

/// Failure of one activity attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ActivityError {
    pub fn transient(message: impl Into<String>) -> Self {
        ActivityError {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ActivityError {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ErrorKind::Transient => write!(f, "Transient failure: {}", self.message),
            ErrorKind::Permanent => write!(f, "Permanent failure: {}", self.message),
        }
    }
}

impl std::error::Error for ActivityError {}

impl From<StoreError> for ActivityError {
    fn from(e: StoreError) -> Self {
        if e.is_transient() {
            ActivityError::transient(e.to_string())
        } else {
            ActivityError::permanent(e.to_string())
        }
    }
}

impl From<std::io::Error> for ActivityError {
    fn from(e: std::io::Error) -> Self {
        StoreError::from(e).into()
    }
}

/// Retry schedule of one job family
///
/// Delay before attempt `n + 1` is `initial_delay * backoff_multiplier^(n-1)`,
/// capped at `max_delay` when set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    #[serde(with = "crate::config::duration_millis")]
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::config::option_duration_millis"
    )]
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Some(Duration::from_secs(60)),
        }
    }
}

impl RetryPolicy {
    /// Short delays for tests
    pub fn test() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            max_delay: None,
        }
    }

    /// A single attempt
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..Self::test()
        }
    }

    /// Delay after failed attempt `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let delay = if millis.is_finite() && millis < u64::MAX as f64 {
            Duration::from_millis(millis as u64)
        } else {
            Duration::from_millis(u64::MAX)
        };
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be >= 1".to_string());
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err("retry.backoff_multiplier must be >= 1.0".to_string());
        }
        Ok(())
    }
}

/// Settled result of an activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityOutcome<T> {
    Completed(T),
    /// Retries exhausted or a permanent failure
    Failed { error: ActivityError, attempts: u32 },
    /// Cancellation observed before the activity settled
    Cancelled,
}

/// Executes activities under one retry policy
#[derive(Clone)]
pub struct ActivityExecutor<C: Clock> {
    clock: C,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<C: Clock> ActivityExecutor<C> {
    pub fn new(clock: C, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        debug_assert!(policy.validate().is_ok(), "invalid retry policy: {:?}", policy);
        ActivityExecutor {
            clock,
            policy,
            cancel,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails permanently, exhausts its attempts
    /// or is cancelled. `op` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, activity: &str, mut op: F) -> ActivityOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ActivityError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return ActivityOutcome::Cancelled;
            }

            let error = match op(attempt).await {
                Ok(value) => return ActivityOutcome::Completed(value),
                Err(error) => error,
            };

            if !error.is_transient() {
                warn!(activity, attempt, error = %error, "Activity failed permanently");
                return ActivityOutcome::Failed {
                    error,
                    attempts: attempt,
                };
            }
            if attempt >= max_attempts {
                warn!(activity, attempts = attempt, error = %error, "Activity exhausted retries");
                return ActivityOutcome::Failed {
                    error,
                    attempts: attempt,
                };
            }

            let delay = self.policy.delay_after(attempt);
            debug!(
                activity,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying activity"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ActivityOutcome::Cancelled,
                _ = self.clock.sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
