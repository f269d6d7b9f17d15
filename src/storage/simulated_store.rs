//! Simulated Object Store with Fault Injection
//!
//! DST wrapper around any [`ObjectStore`]. Each operation consults a seeded
//! [`Rng`] before delegating, so a failing seed replays the same faults.
//! Injected failures use error kinds that [`StoreError`](crate::storage::StoreError)
//! classifies as transient, which is what a flaky blob service returns.

use crate::io::Rng;
use crate::storage::object_store::{ObjectMeta, ObjectStore};
use parking_lot::Mutex;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::pin::Pin;
use std::sync::Arc;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// Probability of PUT operation failure
    pub put_fail_prob: f64,
    /// Probability of GET operation failure
    pub get_fail_prob: f64,
    /// Probability of DELETE failure
    pub delete_fail_prob: f64,
    /// Probability of LIST failure
    pub list_fail_prob: f64,
    /// Probability of RENAME failure
    pub rename_fail_prob: f64,
    /// Probability of any operation timing out before it runs
    pub timeout_prob: f64,
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.01,
            get_fail_prob: 0.01,
            delete_fail_prob: 0.01,
            list_fail_prob: 0.01,
            rename_fail_prob: 0.01,
            timeout_prob: 0.005,
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.1,
            get_fail_prob: 0.1,
            delete_fail_prob: 0.1,
            list_fail_prob: 0.05,
            rename_fail_prob: 0.05,
            timeout_prob: 0.05,
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.0,
            get_fail_prob: 0.0,
            delete_fail_prob: 0.0,
            list_fail_prob: 0.0,
            rename_fail_prob: 0.0,
            timeout_prob: 0.0,
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedStoreStats {
    pub attempts: u64,
    pub put_failures: u64,
    pub get_failures: u64,
    pub delete_failures: u64,
    pub list_failures: u64,
    pub rename_failures: u64,
    pub timeouts: u64,
}

impl SimulatedStoreStats {
    pub fn total_faults(&self) -> u64 {
        self.put_failures
            + self.get_failures
            + self.delete_failures
            + self.list_failures
            + self.rename_failures
            + self.timeouts
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Put,
    Get,
    Delete,
    List,
    Rename,
}

struct FaultState<R: Rng> {
    rng: R,
    stats: SimulatedStoreStats,
}

/// Object store that wraps another store and injects faults
pub struct SimulatedObjectStore<S: ObjectStore, R: Rng> {
    inner: S,
    config: SimulatedStoreConfig,
    state: Arc<Mutex<FaultState<R>>>,
}

impl<S: ObjectStore, R: Rng> SimulatedObjectStore<S, R> {
    pub fn new(inner: S, rng: R, config: SimulatedStoreConfig) -> Self {
        SimulatedObjectStore {
            inner,
            config,
            state: Arc::new(Mutex::new(FaultState {
                rng,
                stats: SimulatedStoreStats::default(),
            })),
        }
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.state.lock().stats = SimulatedStoreStats::default();
    }

    /// The wrapped store, bypassing fault injection
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Decide, under one lock, whether this call fails
    fn inject(&self, op: Op, key: &str) -> IoResult<()> {
        let mut state = self.state.lock();
        state.stats.attempts += 1;

        if state.rng.gen_bool(self.config.timeout_prob) {
            state.stats.timeouts += 1;
            return Err(IoError::new(
                ErrorKind::TimedOut,
                format!("simulated timeout: {}", key),
            ));
        }

        let probability = match op {
            Op::Put => self.config.put_fail_prob,
            Op::Get => self.config.get_fail_prob,
            Op::Delete => self.config.delete_fail_prob,
            Op::List => self.config.list_fail_prob,
            Op::Rename => self.config.rename_fail_prob,
        };
        if !state.rng.gen_bool(probability) {
            return Ok(());
        }

        let counter = match op {
            Op::Put => &mut state.stats.put_failures,
            Op::Get => &mut state.stats.get_failures,
            Op::Delete => &mut state.stats.delete_failures,
            Op::List => &mut state.stats.list_failures,
            Op::Rename => &mut state.stats.rename_failures,
        };
        *counter += 1;
        Err(IoError::new(
            ErrorKind::Other,
            format!("simulated {:?} failure: {}", op, key),
        ))
    }
}

impl<S: ObjectStore, R: Rng> ObjectStore for SimulatedObjectStore<S, R> {
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.inject(Op::Put, key)?;
            self.inner.put(key, data).await
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move {
            self.inject(Op::Get, key)?;
            self.inner.get(key).await
        })
    }

    fn exists<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<bool>> + Send + 'a>> {
        Box::pin(async move {
            self.inject(Op::Get, key)?;
            self.inner.exists(key).await
        })
    }

    fn delete<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.inject(Op::Delete, key)?;
            self.inner.delete(key).await
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<ObjectMeta>>> + Send + 'a>> {
        Box::pin(async move {
            self.inject(Op::List, prefix)?;
            self.inner.list(prefix).await
        })
    }

    fn rename<'a>(
        &'a self,
        from: &'a str,
        to: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.inject(Op::Rename, from)?;
            self.inner.rename(from, to).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;
    use crate::storage::{InMemoryObjectStore, StoreError};

    #[tokio::test]
    async fn test_no_faults_passes_through() {
        let store = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            SimulatedRng::new(1),
            SimulatedStoreConfig::no_faults(),
        );
        for i in 0..50 {
            store.put(&format!("k{}", i), b"v").await.unwrap();
        }
        assert_eq!(store.inner().len(), 50);
        assert_eq!(store.stats().total_faults(), 0);
        assert_eq!(store.stats().attempts, 50);
    }

    #[tokio::test]
    async fn test_faults_are_transient_and_deterministic() {
        async fn run(seed: u64) -> (Vec<bool>, SimulatedStoreStats) {
            let store = SimulatedObjectStore::new(
                InMemoryObjectStore::new(),
                SimulatedRng::new(seed),
                SimulatedStoreConfig::high_chaos(),
            );
            let mut outcomes = Vec::new();
            for i in 0..200 {
                match store.put(&format!("k{}", i), b"v").await {
                    Ok(()) => outcomes.push(true),
                    Err(e) => {
                        assert!(StoreError::from(e).is_transient());
                        outcomes.push(false);
                    }
                }
            }
            (outcomes, store.stats())
        }

        let (a, stats_a) = run(42).await;
        let (b, stats_b) = run(42).await;
        assert_eq!(a, b);
        assert_eq!(stats_a, stats_b);
        assert!(stats_a.total_faults() > 0);
    }
}
