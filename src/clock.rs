//! Clock Abstraction for Deterministic Simulation Testing
//!
//! Every timestamp the feed records and every sleep the processor or the
//! retry loop performs goes through [`Clock`], so the same code runs against
//! wall-clock time in production and virtual time under simulation.
//!
//! ## Design Principles (TigerStyle)
//!
//! 1. **Explicit time**: All time operations go through this trait
//! 2. **No hidden state**: Clock state is visible and controllable
//! 3. **Deterministic**: Same inputs produce same outputs in simulation

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timestamp in milliseconds since the Unix epoch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Earliest representable time; the `synced_date` of a fresh consumer.
    pub const MIN: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn saturating_sub(&self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl std::ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Clock trait for time operations
///
/// Implementations:
/// - `ProductionClock`: real system time, sleeps on the tokio timer
/// - `SimulatedClock`: virtual time, sleeps advance the clock instantly
pub trait Clock: Send + Sync + Clone + 'static {
    /// Get current time
    fn now(&self) -> Timestamp;

    /// Suspend for `duration`
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;

    /// Get elapsed time since a previous timestamp
    fn elapsed(&self, since: Timestamp) -> Duration {
        self.now().saturating_sub(since)
    }
}

/// Production clock using real system time
#[derive(Clone)]
pub struct ProductionClock {
    /// Epoch instant for calculating timestamps
    start: Instant,
    /// Initial timestamp in milliseconds
    start_millis: u64,
}

impl Default for ProductionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductionClock {
    pub fn new() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        // A clock set before 1970 is treated as the epoch itself.
        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        ProductionClock {
            start: Instant::now(),
            start_millis,
        }
    }
}

impl Clock for ProductionClock {
    fn now(&self) -> Timestamp {
        let elapsed = self.start.elapsed().as_millis() as u64;
        Timestamp(self.start_millis + elapsed)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Simulated clock for deterministic testing
///
/// Time only advances when explicitly told to via `advance()`/`set()`, or
/// when somebody sleeps on it. Every sleep is recorded so tests can assert
/// on backoff schedules and poll intervals.
#[derive(Clone)]
pub struct SimulatedClock {
    /// Current virtual time in milliseconds
    time_ms: Arc<AtomicU64>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulatedClock {
    /// Create a new simulated clock starting at the given time
    pub fn new(start_ms: u64) -> Self {
        SimulatedClock {
            time_ms: Arc::new(AtomicU64::new(start_ms)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Advance time by the given duration
    pub fn advance(&self, duration: Duration) {
        self.time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    /// Advance time by milliseconds
    pub fn advance_ms(&self, ms: u64) {
        self.time_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Set time to a specific value
    pub fn set(&self, time_ms: u64) {
        self.time_ms.store(time_ms, Ordering::SeqCst);
    }

    /// Get current time in milliseconds
    pub fn current_ms(&self) -> u64 {
        self.time_ms.load(Ordering::SeqCst)
    }

    /// Every sleep requested so far, in call order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    pub fn clear_sleeps(&self) {
        self.sleeps.lock().clear();
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.time_ms.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        // Yield so that concurrently polled tasks still interleave.
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_clock() {
        let clock = ProductionClock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = clock.now();

        assert!(t2.0 > t1.0, "Time should advance");
        assert!(t2.0 - t1.0 >= 10, "Should have elapsed at least 10ms");
    }

    #[test]
    fn test_simulated_clock_deterministic() {
        let clock = SimulatedClock::new(1000);

        // Time doesn't advance on its own
        let t1 = clock.now();
        let t2 = clock.now();
        assert_eq!(t1, t2, "Time should not advance without explicit call");

        clock.advance_ms(100);
        assert_eq!(clock.now().0, 1100);

        clock.set(5000);
        assert_eq!(clock.now().0, 5000);
    }

    #[test]
    fn test_simulated_clock_shared() {
        let clock = SimulatedClock::new(0);
        let clock2 = clock.clone();

        clock.advance_ms(100);
        assert_eq!(clock2.now().0, 100, "Clones should share state");
    }

    #[tokio::test]
    async fn test_simulated_sleep_advances_and_records() {
        let clock = SimulatedClock::new(0);
        clock.sleep(Duration::from_millis(250)).await;
        clock.sleep(Duration::from_millis(50)).await;

        assert_eq!(clock.current_ms(), 300);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(250), Duration::from_millis(50)]
        );
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let ts = Timestamp::from_millis(1000);
        let ts2 = ts + Duration::from_millis(500);
        assert_eq!(ts2.0, 1500);
        assert_eq!(ts2.saturating_sub(ts), Duration::from_millis(500));
        assert_eq!(ts.saturating_sub(ts2), Duration::ZERO);
    }
}
