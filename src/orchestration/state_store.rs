//! Durable orchestration records with optimistic concurrency.
//!
//! Records are opaque JSON payloads tagged with a version. A save names the
//! version it expects to replace (`None` for create); a mismatch fails with
//! [`StateStoreError::VersionConflict`], so two executors can never both
//! commit the same execution.

use crate::storage::object_store::{get_json, put_json_atomic, ObjectStore};
use crate::storage::StoreError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Error from an orchestration state store
#[derive(Debug)]
pub enum StateStoreError {
    /// The stored version differs from the expected one
    VersionConflict {
        instance_id: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },
    /// The payload could not be decoded
    Corrupt(String),
    /// Underlying storage failed
    Store(StoreError),
}

impl std::fmt::Display for StateStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateStoreError::VersionConflict {
                instance_id,
                expected,
                actual,
            } => write!(
                f,
                "Version conflict for {}: expected {:?}, found {:?}",
                instance_id, expected, actual
            ),
            StateStoreError::Corrupt(msg) => write!(f, "Corrupt orchestration record: {}", msg),
            StateStoreError::Store(e) => write!(f, "State store error: {}", e),
        }
    }
}

impl std::error::Error for StateStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StateStoreError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for StateStoreError {
    fn from(e: StoreError) -> Self {
        StateStoreError::Store(e)
    }
}

impl From<std::io::Error> for StateStoreError {
    fn from(e: std::io::Error) -> Self {
        StateStoreError::Store(e.into())
    }
}

impl From<serde_json::Error> for StateStoreError {
    fn from(e: serde_json::Error) -> Self {
        StateStoreError::Corrupt(e.to_string())
    }
}

/// A stored payload and its version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub version: u64,
    pub payload: serde_json::Value,
}

pub type StateFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, StateStoreError>> + Send + 'a>>;

/// Storage for orchestration records, keyed by instance id
pub trait OrchestrationStateStore: Send + Sync + 'static {
    fn load<'a>(&'a self, instance_id: &'a str) -> StateFuture<'a, Option<VersionedRecord>>;

    /// Write `payload` if the stored version equals `expected`; returns the new version
    fn save<'a>(
        &'a self,
        instance_id: &'a str,
        expected: Option<u64>,
        payload: serde_json::Value,
    ) -> StateFuture<'a, u64>;
}

fn check_version(
    instance_id: &str,
    current: Option<u64>,
    expected: Option<u64>,
) -> Result<u64, StateStoreError> {
    if current != expected {
        return Err(StateStoreError::VersionConflict {
            instance_id: instance_id.to_string(),
            expected,
            actual: current,
        });
    }
    Ok(current.map_or(1, |v| v + 1))
}

/// In-memory records for tests and single-process runs
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    records: Arc<RwLock<HashMap<String, VersionedRecord>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl OrchestrationStateStore for InMemoryStateStore {
    fn load<'a>(&'a self, instance_id: &'a str) -> StateFuture<'a, Option<VersionedRecord>> {
        Box::pin(async move { Ok(self.records.read().get(instance_id).cloned()) })
    }

    fn save<'a>(
        &'a self,
        instance_id: &'a str,
        expected: Option<u64>,
        payload: serde_json::Value,
    ) -> StateFuture<'a, u64> {
        Box::pin(async move {
            let mut records = self.records.write();
            let current = records.get(instance_id).map(|r| r.version);
            let version = check_version(instance_id, current, expected)?;
            records.insert(instance_id.to_string(), VersionedRecord { version, payload });
            Ok(version)
        })
    }
}

/// Records stored as JSON documents in an object store
///
/// The compare-and-write is serialized per process; object stores offer no
/// conditional put here, so cross-process exclusion relies on one host per
/// job identity.
pub struct ObjectStoreStateStore<S: ObjectStore> {
    store: S,
    prefix: String,
    write_lock: tokio::sync::Mutex<()>,
}

impl<S: ObjectStore> ObjectStoreStateStore<S> {
    pub fn new(store: S, prefix: impl Into<String>) -> Self {
        ObjectStoreStateStore {
            store,
            prefix: prefix.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn key(&self, instance_id: &str) -> String {
        format!("{}/orchestrations/{}.json", self.prefix, instance_id)
    }
}

impl<S: ObjectStore> OrchestrationStateStore for ObjectStoreStateStore<S> {
    fn load<'a>(&'a self, instance_id: &'a str) -> StateFuture<'a, Option<VersionedRecord>> {
        Box::pin(async move {
            let key = self.key(instance_id);
            Ok(get_json(&self.store, &key).await?)
        })
    }

    fn save<'a>(
        &'a self,
        instance_id: &'a str,
        expected: Option<u64>,
        payload: serde_json::Value,
    ) -> StateFuture<'a, u64> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let key = self.key(instance_id);
            let current: Option<VersionedRecord> = get_json(&self.store, &key).await?;
            let version = check_version(instance_id, current.map(|r| r.version), expected)?;
            put_json_atomic(&self.store, &key, &VersionedRecord { version, payload }).await?;
            Ok(version)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryObjectStore, LocalFsObjectStore};
    use serde_json::json;

    async fn exercise(store: &dyn OrchestrationStateStore) {
        assert!(store.load("job").await.unwrap().is_none());

        let v1 = store.save("job", None, json!({"n": 1})).await.unwrap();
        assert_eq!(v1, 1);

        // A second creator loses
        let err = store.save("job", None, json!({"n": 9})).await.unwrap_err();
        assert!(matches!(
            err,
            StateStoreError::VersionConflict {
                expected: None,
                actual: Some(1),
                ..
            }
        ));

        let v2 = store.save("job", Some(1), json!({"n": 2})).await.unwrap();
        assert_eq!(v2, 2);
        // Stale writer loses
        assert!(store.save("job", Some(1), json!({"n": 3})).await.is_err());

        let loaded = store.load("job").await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.payload, json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_in_memory_versioning() {
        exercise(&InMemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn test_object_store_versioning() {
        let objects = InMemoryObjectStore::new();
        exercise(&ObjectStoreStateStore::new(objects.clone(), "ops")).await;
        assert_eq!(objects.keys(), vec!["ops/orchestrations/job.json".to_string()]);
    }

    #[tokio::test]
    async fn test_local_fs_record_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ObjectStoreStateStore::new(
                LocalFsObjectStore::new(dir.path().to_path_buf()),
                "ops",
            );
            store.save("export-1", None, json!({"k": "v"})).await.unwrap();
        }
        let reopened =
            ObjectStoreStateStore::new(LocalFsObjectStore::new(dir.path().to_path_buf()), "ops");
        let record = reopened.load("export-1").await.unwrap().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.payload, json!({"k": "v"}));
    }
}
