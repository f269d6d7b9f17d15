//! Change Feed Processor
//!
//! Single long-lived task that drains the feed into a [`FeedSink`]:
//!
//! ```text
//! loop {
//!     state = sync_state.get()
//!     page  = feed.get_range(ALL, state.synced_sequence, page_size, Ascending)
//!     empty        → sleep steady_state_interval
//!     all handled  → sync_state.update(last.sequence, now); sleep catch_up_interval
//!     sink failed  → keep the cursor; sleep steady_state_interval
//! }
//! ```
//!
//! Delivery is at-least-once: the cursor moves only after a whole page was
//! handled, so a failure redelivers the page from its first entry. Sinks
//! must be idempotent per resource and action.
//!
//! ## Design (TigerStyle)
//!
//! - Entries of a page go to the sink strictly in sequence order, one at a time
//! - The cursor never moves backwards
//! - Store and sink failures are logged and retried; the loop never exits on them

use crate::changefeed::error::{ChangeFeedError, SinkError};
use crate::changefeed::store::ChangeFeedStore;
use crate::changefeed::sync_state::SyncStateStore;
use crate::changefeed::types::{ChangeFeedEntry, ChangeFeedOrder, SyncState, TimeRange};
use crate::clock::Clock;
use crate::config::ProcessorConfig;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Downstream consumer of feed entries (FHIR sync, tag indexing, ...)
pub trait FeedSink: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        entry: &'a ChangeFeedEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;
}

/// Sink that only logs each entry
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

impl FeedSink for LoggingSink {
    fn handle<'a>(
        &'a self,
        entry: &'a ChangeFeedEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        Box::pin(async move {
            info!(
                sequence = entry.sequence,
                action = ?entry.action,
                state = ?entry.state,
                study = %entry.study_uid,
                series = %entry.series_uid,
                sop = %entry.sop_uid,
                "Change feed entry"
            );
            Ok(())
        })
    }
}

/// Result of one pass
#[derive(Debug)]
pub enum PollOutcome {
    /// A full page was handled and the cursor advanced
    Delivered { count: usize, synced_sequence: i64 },
    /// Nothing after the cursor
    Empty,
    /// The sink rejected an entry; the cursor did not move
    SinkFailed(SinkError),
    /// Feed or sync state store failed; the cursor did not move
    StoreFailed(ChangeFeedError),
    /// Cancellation observed; the cursor did not move
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub polls: u64,
    pub entries_delivered: u64,
    pub pages_committed: u64,
    pub empty_polls: u64,
    pub sink_failures: u64,
    pub store_failures: u64,
}

pub struct ChangeFeedProcessor<C: Clock> {
    feed: Arc<dyn ChangeFeedStore>,
    sync_state: Arc<dyn SyncStateStore>,
    sink: Arc<dyn FeedSink>,
    clock: C,
    config: ProcessorConfig,
    stats: Mutex<ProcessorStats>,
}

impl<C: Clock> ChangeFeedProcessor<C> {
    pub fn new(
        feed: Arc<dyn ChangeFeedStore>,
        sync_state: Arc<dyn SyncStateStore>,
        sink: Arc<dyn FeedSink>,
        clock: C,
        config: ProcessorConfig,
    ) -> Self {
        debug_assert!(config.page_size > 0, "page_size must be > 0");
        ChangeFeedProcessor {
            feed,
            sync_state,
            sink,
            clock,
            config,
            stats: Mutex::new(ProcessorStats::default()),
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats.lock().clone()
    }

    /// Run one pass: read a page after the cursor and deliver it
    pub async fn poll_once(&self, cancel: &CancellationToken) -> PollOutcome {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }
        self.stats.lock().polls += 1;

        let state = match self.sync_state.get().await {
            Ok(state) => state,
            Err(e) => return self.store_failed(e.into()),
        };
        let page = match self
            .feed
            .get_range(
                TimeRange::ALL,
                state.synced_sequence,
                self.config.page_size,
                ChangeFeedOrder::Ascending,
            )
            .await
        {
            Ok(page) => page,
            Err(e) => return self.store_failed(e.into()),
        };
        let Some(last) = page.last() else {
            self.stats.lock().empty_polls += 1;
            return PollOutcome::Empty;
        };
        let last_sequence = last.sequence;
        verify_page(&page, state.synced_sequence);

        for entry in &page {
            if cancel.is_cancelled() {
                info!(sequence = entry.sequence, "Cancelled mid-page; cursor unchanged");
                return PollOutcome::Cancelled;
            }
            if let Err(e) = self.sink.handle(entry).await {
                warn!(
                    sequence = e.sequence,
                    synced_sequence = state.synced_sequence,
                    error = %e,
                    "Sink failed; page will be redelivered"
                );
                self.stats.lock().sink_failures += 1;
                return PollOutcome::SinkFailed(e);
            }
            self.stats.lock().entries_delivered += 1;
        }

        let next = SyncState {
            synced_sequence: last_sequence,
            synced_date: self.clock.now(),
        };
        debug_assert!(next.synced_sequence > state.synced_sequence);
        if let Err(e) = self.sync_state.update(next).await {
            return self.store_failed(e.into());
        }
        self.stats.lock().pages_committed += 1;
        debug!(
            count = page.len(),
            synced_sequence = last_sequence,
            "Page delivered"
        );
        PollOutcome::Delivered {
            count: page.len(),
            synced_sequence: last_sequence,
        }
    }

    /// Poll until cancelled
    ///
    /// Full pages are drained back to back (separated only by the catch-up
    /// interval); the steady-state interval applies once the feed is
    /// exhausted or after a failure.
    pub async fn run(&self, cancel: CancellationToken) -> ProcessorStats {
        info!(
            page_size = self.config.page_size,
            steady_state_ms = self.config.steady_state_interval.as_millis() as u64,
            catch_up_ms = self.config.catch_up_interval.as_millis() as u64,
            "Change feed processor started"
        );
        loop {
            let delay = match self.poll_once(&cancel).await {
                PollOutcome::Delivered { .. } => self.config.catch_up_interval,
                PollOutcome::Empty | PollOutcome::SinkFailed(_) | PollOutcome::StoreFailed(_) => {
                    self.config.steady_state_interval
                }
                PollOutcome::Cancelled => break,
            };
            if !self.pause(delay, &cancel).await {
                break;
            }
        }
        let stats = self.stats();
        info!(
            delivered = stats.entries_delivered,
            pages = stats.pages_committed,
            "Change feed processor stopped"
        );
        stats
    }

    /// Sleep for `delay`; false if cancelled first
    async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return !cancel.is_cancelled();
        }
        if cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.clock.sleep(delay) => true,
        }
    }

    fn store_failed(&self, error: ChangeFeedError) -> PollOutcome {
        warn!(error = %error, transient = error.is_transient(), "Change feed pass failed");
        self.stats.lock().store_failures += 1;
        PollOutcome::StoreFailed(error)
    }
}

/// Check page invariants (debug builds only)
fn verify_page(page: &[ChangeFeedEntry], cursor: i64) {
    debug_assert!(
        page.iter().all(|e| e.sequence > cursor),
        "Invariant violated: page contains entries at or before cursor {}",
        cursor
    );
    debug_assert!(
        page.windows(2).all(|w| w[0].sequence < w[1].sequence),
        "Invariant violated: page not in ascending sequence order"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changefeed::store::StoreFuture;
    use crate::changefeed::sync_state::InMemorySyncStateStore;
    use crate::clock::{SimulatedClock, Timestamp};
    use crate::orchestration::WatermarkRange;
    use crate::storage::{InMemoryDicomStore, InMemoryObjectStore, StoreError};
    use serde_json::json;

    /// Records every delivery; fails once at each listed sequence
    #[derive(Default)]
    struct ScriptedSink {
        delivered: Mutex<Vec<i64>>,
        fail_once_at: Mutex<Vec<i64>>,
    }

    impl FeedSink for ScriptedSink {
        fn handle<'a>(
            &'a self,
            entry: &'a ChangeFeedEntry,
        ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
            Box::pin(async move {
                let mut fail = self.fail_once_at.lock();
                if let Some(pos) = fail.iter().position(|s| *s == entry.sequence) {
                    fail.remove(pos);
                    return Err(SinkError::new(entry.sequence, "downstream 503"));
                }
                self.delivered.lock().push(entry.sequence);
                Ok(())
            })
        }
    }

    /// Feed wrapper recording the virtual time of every page read
    struct TimedFeed {
        inner: Arc<InMemoryDicomStore<SimulatedClock>>,
        clock: SimulatedClock,
        reads: Mutex<Vec<u64>>,
        cancel_after: usize,
        cancel: CancellationToken,
        fail_next: Mutex<bool>,
    }

    impl ChangeFeedStore for TimedFeed {
        fn get_latest(&self, order: ChangeFeedOrder) -> StoreFuture<'_, Option<ChangeFeedEntry>> {
            self.inner.get_latest(order)
        }

        fn get_range(
            &self,
            time_range: TimeRange,
            offset: i64,
            limit: usize,
            order: ChangeFeedOrder,
        ) -> StoreFuture<'_, Vec<ChangeFeedEntry>> {
            let mut reads = self.reads.lock();
            reads.push(self.clock.current_ms());
            if reads.len() >= self.cancel_after {
                self.cancel.cancel();
            }
            drop(reads);
            if std::mem::take(&mut *self.fail_next.lock()) {
                return Box::pin(async { Err(StoreError::Unavailable("sql timeout".into())) });
            }
            self.inner.get_range(time_range, offset, limit, order)
        }

        fn get_deleted_batch(
            &self,
            batch_size: usize,
            time_window: Option<TimeRange>,
            watermark_range: Option<WatermarkRange>,
        ) -> StoreFuture<'_, Vec<ChangeFeedEntry>> {
            self.inner
                .get_deleted_batch(batch_size, time_window, watermark_range)
        }

        fn get_max_deleted_watermark(&self, timestamp: Timestamp) -> StoreFuture<'_, Option<i64>> {
            self.inner.get_max_deleted_watermark(timestamp)
        }
    }

    async fn seeded_store(clock: &SimulatedClock, n: usize) -> Arc<InMemoryDicomStore<SimulatedClock>> {
        let store = Arc::new(InMemoryDicomStore::new(
            clock.clone(),
            Arc::new(InMemoryObjectStore::new()),
        ));
        for i in 0..n {
            store
                .add_instance("1", "1.1", &format!("1.1.{}", i), b"x", json!({}))
                .await
                .unwrap();
        }
        store
    }

    fn processor(
        feed: Arc<dyn ChangeFeedStore>,
        state: Arc<InMemorySyncStateStore>,
        sink: Arc<ScriptedSink>,
        clock: SimulatedClock,
    ) -> ChangeFeedProcessor<SimulatedClock> {
        ChangeFeedProcessor::new(feed, state, sink, clock, ProcessorConfig::test())
    }

    #[tokio::test]
    async fn test_page_advances_cursor_then_waits_steady_state() {
        let clock = SimulatedClock::new(10_000);
        let store = seeded_store(&clock, 3).await;
        let cancel = CancellationToken::new();
        let feed = Arc::new(TimedFeed {
            inner: store,
            clock: clock.clone(),
            reads: Mutex::new(Vec::new()),
            cancel_after: 3,
            cancel: cancel.clone(),
            fail_next: Mutex::new(false),
        });
        let state = Arc::new(InMemorySyncStateStore::new());
        let sink = Arc::new(ScriptedSink::default());
        let processor = processor(feed.clone(), state.clone(), sink.clone(), clock.clone());

        let stats = processor.run(cancel).await;

        assert_eq!(*sink.delivered.lock(), vec![1, 2, 3]);
        let synced = state.stored().unwrap();
        assert_eq!(synced.synced_sequence, 3);
        assert_eq!(synced.synced_date, Timestamp(10_000));
        // Read 1 delivers, read 2 is empty at once (zero catch-up), read 3
        // only after the steady-state interval.
        assert_eq!(*feed.reads.lock(), vec![10_000, 10_000, 11_000]);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(1_000)]);
        assert_eq!(stats.pages_committed, 1);
        assert_eq!(stats.empty_polls, 1);
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_cursor_and_redelivers() {
        let clock = SimulatedClock::new(0);
        let store = seeded_store(&clock, 3).await;
        let state = Arc::new(InMemorySyncStateStore::new());
        let sink = Arc::new(ScriptedSink::default());
        sink.fail_once_at.lock().push(2);
        let processor = processor(store, state.clone(), sink.clone(), clock);
        let cancel = CancellationToken::new();

        let outcome = processor.poll_once(&cancel).await;
        assert!(matches!(outcome, PollOutcome::SinkFailed(SinkError { sequence: 2, .. })));
        assert!(state.stored().is_none(), "cursor must not move on sink failure");

        let outcome = processor.poll_once(&cancel).await;
        assert!(matches!(
            outcome,
            PollOutcome::Delivered {
                count: 3,
                synced_sequence: 3
            }
        ));
        // Entry 1 was delivered twice: at-least-once
        assert_eq!(*sink.delivered.lock(), vec![1, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_store_failure_is_logged_and_retried() {
        let clock = SimulatedClock::new(0);
        let store = seeded_store(&clock, 2).await;
        let cancel = CancellationToken::new();
        let feed = Arc::new(TimedFeed {
            inner: store,
            clock: clock.clone(),
            reads: Mutex::new(Vec::new()),
            cancel_after: 3,
            cancel: cancel.clone(),
            fail_next: Mutex::new(true),
        });
        let state = Arc::new(InMemorySyncStateStore::new());
        let sink = Arc::new(ScriptedSink::default());
        let processor = processor(feed.clone(), state.clone(), sink.clone(), clock.clone());

        let stats = processor.run(cancel).await;
        assert_eq!(stats.store_failures, 1);
        assert_eq!(*sink.delivered.lock(), vec![1, 2]);
        // Failure, steady-state wait, then a successful read
        assert_eq!(*feed.reads.lock(), vec![0, 1_000, 1_000]);
    }

    #[tokio::test]
    async fn test_catch_up_drains_full_pages_back_to_back() {
        let clock = SimulatedClock::new(0);
        let store = seeded_store(&clock, 7).await;
        let state = Arc::new(InMemorySyncStateStore::new());
        let sink = Arc::new(ScriptedSink::default());
        let processor = processor(store, state.clone(), sink.clone(), clock.clone());
        let cancel = CancellationToken::new();

        let mut pages = 0;
        while let PollOutcome::Delivered { .. } = processor.poll_once(&cancel).await {
            pages += 1;
        }
        assert_eq!(pages, 3); // 3 + 3 + 1
        assert_eq!(state.stored().unwrap().synced_sequence, 7);
        assert_eq!(*sink.delivered.lock(), (1..=7).collect::<Vec<_>>());
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_poll() {
        let clock = SimulatedClock::new(0);
        let store = seeded_store(&clock, 2).await;
        let state = Arc::new(InMemorySyncStateStore::new());
        let sink = Arc::new(ScriptedSink::default());
        let processor = processor(store, state.clone(), sink.clone(), clock);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(processor.poll_once(&cancel).await, PollOutcome::Cancelled));
        let stats = processor.run(cancel).await;
        assert_eq!(stats.polls, 0);
        assert!(sink.delivered.lock().is_empty());
    }
}
