//! Durable cursor of a change feed consumer.
//!
//! Exactly one processor writes a given sync state, so updates are plain
//! overwrites without version checks.

use crate::changefeed::types::SyncState;
use crate::storage::object_store::{get_json, put_json_atomic, ObjectStore};
use crate::storage::StoreError;
use parking_lot::RwLock;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type SyncFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

pub trait SyncStateStore: Send + Sync + 'static {
    /// Stored cursor, or the default when none was written
    fn get(&self) -> SyncFuture<'_, SyncState>;

    /// Replace the cursor
    fn update(&self, state: SyncState) -> SyncFuture<'_, ()>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySyncStateStore {
    state: Arc<RwLock<Option<SyncState>>>,
}

impl InMemorySyncStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last written value, without the default
    pub fn stored(&self) -> Option<SyncState> {
        *self.state.read()
    }
}

impl SyncStateStore for InMemorySyncStateStore {
    fn get(&self) -> SyncFuture<'_, SyncState> {
        Box::pin(async move { Ok((*self.state.read()).unwrap_or_default()) })
    }

    fn update(&self, state: SyncState) -> SyncFuture<'_, ()> {
        Box::pin(async move {
            *self.state.write() = Some(state);
            Ok(())
        })
    }
}

/// Sync state kept as one JSON object, replaced by temp-then-rename
pub struct ObjectStoreSyncStateStore<S: ObjectStore> {
    store: S,
    key: String,
}

impl<S: ObjectStore> ObjectStoreSyncStateStore<S> {
    /// `consumer` names the sink; each consumer has its own cursor
    pub fn new(store: S, prefix: &str, consumer: &str) -> Self {
        ObjectStoreSyncStateStore {
            store,
            key: format!("{}/sync-state/{}.json", prefix, consumer),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<S: ObjectStore> SyncStateStore for ObjectStoreSyncStateStore<S> {
    fn get(&self) -> SyncFuture<'_, SyncState> {
        Box::pin(async move {
            let state: Option<SyncState> = get_json(&self.store, &self.key).await?;
            Ok(state.unwrap_or_default())
        })
    }

    fn update(&self, state: SyncState) -> SyncFuture<'_, ()> {
        Box::pin(async move { Ok(put_json_atomic(&self.store, &self.key, &state).await?) })
    }
}
