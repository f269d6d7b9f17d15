//! In-memory instance index standing in for the SQL store.
//!
//! Every mutation allocates a fresh watermark from one counter and appends
//! one change-feed row from a second counter. Blobs and metadata documents
//! live in an [`ObjectStore`], written before the index row is committed so a
//! committed row always points at existing content.
//!
//! ## Key layout
//!
//! ```text
//! blobs/{watermark}.dcm                     legacy layout
//! v2/{study}/{series}/{sop}/{watermark}.dcm hierarchical layout (after migration)
//! metadata/{watermark}.json                 instance metadata
//! ```

use crate::changefeed::{
    ChangeFeedAction, ChangeFeedEntry, ChangeFeedOrder, ChangeFeedState, ChangeFeedStore,
    MetadataStore, StoreFuture, TimeRange,
};
use crate::clock::{Clock, Timestamp};
use crate::orchestration::WatermarkRange;
use crate::storage::object_store::{get_json, put_json_atomic, ObjectStore};
use crate::storage::StoreError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Identifiers and watermark of one live object version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceIdentifier {
    pub study_uid: String,
    pub series_uid: String,
    pub sop_uid: String,
    pub watermark: i64,
}

/// Properties computed from blob content by the backfill job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedProperties {
    pub content_length: u64,
    pub crc32: u32,
}

pub fn legacy_blob_key(watermark: i64) -> String {
    format!("blobs/{}.dcm", watermark)
}

pub fn hierarchical_blob_key(id: &InstanceIdentifier) -> String {
    format!(
        "v2/{}/{}/{}/{}.dcm",
        id.study_uid, id.series_uid, id.sop_uid, id.watermark
    )
}

pub fn metadata_key(watermark: i64) -> String {
    format!("metadata/{}.json", watermark)
}

/// Read an instance blob from whichever layout currently holds it
pub async fn read_instance_blob(
    blobs: &dyn ObjectStore,
    id: &InstanceIdentifier,
) -> Result<Vec<u8>, StoreError> {
    match blobs.get(&hierarchical_blob_key(id)).await {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(blobs.get(&legacy_blob_key(id.watermark)).await?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Watermark-range queries over live instances, used by bulk jobs
pub trait InstanceWatermarkStore: Send + Sync + 'static {
    /// Live watermarks `<= upper` (all when `None`), highest first, at most `limit`
    fn watermarks_desc(&self, upper: Option<i64>, limit: usize) -> StoreFuture<'_, Vec<i64>>;

    /// Live instances whose watermark falls in `range`, ascending
    fn instances_in_range(&self, range: WatermarkRange)
        -> StoreFuture<'_, Vec<InstanceIdentifier>>;

    /// Insert or replace derived properties for a live version
    fn upsert_derived(
        &self,
        watermark: i64,
        properties: DerivedProperties,
    ) -> StoreFuture<'_, ()>;
}

type UidKey = (String, String, String);

#[derive(Debug, Clone)]
struct FeedRow {
    sequence: i64,
    timestamp: Timestamp,
    action: ChangeFeedAction,
    uid: UidKey,
    original_version: i64,
}

#[derive(Debug)]
struct StoreInner {
    next_watermark: i64,
    next_sequence: i64,
    /// Append-only, sorted by sequence
    feed: Vec<FeedRow>,
    live: BTreeMap<i64, InstanceIdentifier>,
    by_uid: HashMap<UidKey, i64>,
    derived: HashMap<i64, DerivedProperties>,
}

impl StoreInner {
    fn new() -> Self {
        StoreInner {
            next_watermark: 1,
            next_sequence: 1,
            feed: Vec::new(),
            live: BTreeMap::new(),
            by_uid: HashMap::new(),
            derived: HashMap::new(),
        }
    }

    fn allocate_watermark(&mut self) -> i64 {
        let watermark = self.next_watermark;
        self.next_watermark += 1;
        watermark
    }

    fn append(&mut self, timestamp: Timestamp, action: ChangeFeedAction, uid: UidKey, version: i64) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.feed.push(FeedRow {
            sequence,
            timestamp,
            action,
            uid,
            original_version: version,
        });

        debug_assert!(
            self.feed.windows(2).all(|w| w[0].sequence < w[1].sequence),
            "Invariant violated: feed must be strictly ordered by sequence"
        );
    }

    /// Evaluate lifecycle state as of now
    ///
    /// A Delete row stays Deleted even after its UID is stored again: the
    /// version it names is gone for good, since watermarks are never reused.
    fn to_entry(&self, row: &FeedRow) -> ChangeFeedEntry {
        let current_version = self.by_uid.get(&row.uid).copied();
        let state = match current_version {
            _ if row.action == ChangeFeedAction::Delete => ChangeFeedState::Deleted,
            None => ChangeFeedState::Deleted,
            Some(v) if v == row.original_version => ChangeFeedState::Current,
            Some(_) => ChangeFeedState::Replaced,
        };
        ChangeFeedEntry {
            sequence: row.sequence,
            timestamp: row.timestamp,
            action: row.action,
            study_uid: row.uid.0.clone(),
            series_uid: row.uid.1.clone(),
            sop_uid: row.uid.2.clone(),
            state,
            original_version: row.original_version,
            current_version,
            metadata: None,
        }
    }

    /// Delete rows, judged per version rather than per UID
    fn deleted_rows(&self) -> impl Iterator<Item = &FeedRow> {
        self.feed.iter().filter(move |row| {
            debug_assert!(
                row.action != ChangeFeedAction::Delete || !self.live.contains_key(&row.original_version),
                "Invariant violated: deleted version {} is live",
                row.original_version
            );
            row.action == ChangeFeedAction::Delete
        })
    }
}

/// In-memory store implementing the feed, metadata and watermark contracts
#[derive(Clone)]
pub struct InMemoryDicomStore<C: Clock> {
    clock: C,
    blobs: Arc<dyn ObjectStore>,
    inner: Arc<RwLock<StoreInner>>,
}

impl<C: Clock> InMemoryDicomStore<C> {
    pub fn new(clock: C, blobs: Arc<dyn ObjectStore>) -> Self {
        InMemoryDicomStore {
            clock,
            blobs,
            inner: Arc::new(RwLock::new(StoreInner::new())),
        }
    }

    /// Blob area shared with the jobs
    pub fn blobs(&self) -> Arc<dyn ObjectStore> {
        self.blobs.clone()
    }

    /// Store a new instance
    pub async fn add_instance(
        &self,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
        blob: &[u8],
        metadata: serde_json::Value,
    ) -> Result<InstanceIdentifier, StoreError> {
        let uid = uid_key(study_uid, series_uid, sop_uid)?;
        let watermark = {
            let mut inner = self.inner.write();
            if inner.by_uid.contains_key(&uid) {
                return Err(StoreError::AlreadyExists(format!("{:?}", uid)));
            }
            inner.allocate_watermark()
        };

        self.blobs.put(&legacy_blob_key(watermark), blob).await?;
        put_json_atomic(self.blobs.as_ref(), &metadata_key(watermark), &metadata).await?;

        let mut inner = self.inner.write();
        if inner.by_uid.contains_key(&uid) {
            // Lost a race with a concurrent add; the orphaned blob is harmless.
            return Err(StoreError::AlreadyExists(format!("{:?}", uid)));
        }
        let id = InstanceIdentifier {
            study_uid: uid.0.clone(),
            series_uid: uid.1.clone(),
            sop_uid: uid.2.clone(),
            watermark,
        };
        inner.by_uid.insert(uid.clone(), watermark);
        inner.live.insert(watermark, id.clone());
        inner.append(self.clock.now(), ChangeFeedAction::Create, uid, watermark);
        Ok(id)
    }

    /// Replace an instance's metadata, producing a new version. The previous
    /// version's blob and metadata stay in place; no job reclaims them.
    pub async fn update_instance(
        &self,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
        metadata: serde_json::Value,
    ) -> Result<InstanceIdentifier, StoreError> {
        let uid = uid_key(study_uid, series_uid, sop_uid)?;
        let (old, watermark) = {
            let mut inner = self.inner.write();
            let old = *inner
                .by_uid
                .get(&uid)
                .ok_or_else(|| StoreError::NotFound(format!("{:?}", uid)))?;
            (old, inner.allocate_watermark())
        };

        let current = InstanceIdentifier {
            study_uid: uid.0.clone(),
            series_uid: uid.1.clone(),
            sop_uid: uid.2.clone(),
            watermark: old,
        };
        let blob = read_instance_blob(self.blobs.as_ref(), &current).await?;
        self.blobs.put(&legacy_blob_key(watermark), &blob).await?;
        put_json_atomic(self.blobs.as_ref(), &metadata_key(watermark), &metadata).await?;

        let mut inner = self.inner.write();
        if inner.by_uid.get(&uid) != Some(&old) {
            return Err(StoreError::Conflict(format!(
                "{:?} changed during update",
                uid
            )));
        }
        let id = InstanceIdentifier {
            study_uid: uid.0.clone(),
            series_uid: uid.1.clone(),
            sop_uid: uid.2.clone(),
            watermark,
        };
        inner.live.remove(&old);
        inner.derived.remove(&old);
        inner.live.insert(watermark, id.clone());
        inner.by_uid.insert(uid.clone(), watermark);
        inner.append(self.clock.now(), ChangeFeedAction::Update, uid, watermark);
        Ok(id)
    }

    /// Delete an instance. Its blob stays until a cleanup job removes it.
    pub fn delete_instance(
        &self,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
    ) -> Result<i64, StoreError> {
        let uid = uid_key(study_uid, series_uid, sop_uid)?;
        let mut inner = self.inner.write();
        let watermark = inner
            .by_uid
            .remove(&uid)
            .ok_or_else(|| StoreError::NotFound(format!("{:?}", uid)))?;
        inner.live.remove(&watermark);
        inner.derived.remove(&watermark);
        inner.append(self.clock.now(), ChangeFeedAction::Delete, uid, watermark);
        Ok(watermark)
    }

    /// Burn `count` watermarks, as failed writes do in the SQL store
    pub fn skip_watermarks(&self, count: i64) {
        self.inner.write().next_watermark += count;
    }

    pub fn max_watermark(&self) -> Option<i64> {
        self.inner.read().live.keys().next_back().copied()
    }

    pub fn live_count(&self) -> usize {
        self.inner.read().live.len()
    }

    pub fn feed_len(&self) -> usize {
        self.inner.read().feed.len()
    }

    pub fn derived(&self, watermark: i64) -> Option<DerivedProperties> {
        self.inner.read().derived.get(&watermark).copied()
    }
}

fn uid_key(study_uid: &str, series_uid: &str, sop_uid: &str) -> Result<UidKey, StoreError> {
    if study_uid.is_empty() || series_uid.is_empty() || sop_uid.is_empty() {
        return Err(StoreError::Corrupt(
            "instance identifiers must not be empty".to_string(),
        ));
    }
    Ok((
        study_uid.to_string(),
        series_uid.to_string(),
        sop_uid.to_string(),
    ))
}

impl<C: Clock> ChangeFeedStore for InMemoryDicomStore<C> {
    fn get_latest(&self, _order: ChangeFeedOrder) -> StoreFuture<'_, Option<ChangeFeedEntry>> {
        // Latest is the highest sequence under either direction.
        Box::pin(async move {
            let inner = self.inner.read();
            Ok(inner.feed.last().map(|row| inner.to_entry(row)))
        })
    }

    fn get_range(
        &self,
        time_range: TimeRange,
        offset: i64,
        limit: usize,
        order: ChangeFeedOrder,
    ) -> StoreFuture<'_, Vec<ChangeFeedEntry>> {
        Box::pin(async move {
            let inner = self.inner.read();
            let entries = match order {
                ChangeFeedOrder::Ascending => {
                    let from = inner.feed.partition_point(|row| row.sequence <= offset);
                    inner.feed[from..]
                        .iter()
                        .filter(|row| time_range.contains(row.timestamp))
                        .take(limit)
                        .map(|row| inner.to_entry(row))
                        .collect()
                }
                ChangeFeedOrder::Descending => inner
                    .feed
                    .iter()
                    .rev()
                    .filter(|row| time_range.contains(row.timestamp))
                    .skip(usize::try_from(offset).unwrap_or(0))
                    .take(limit)
                    .map(|row| inner.to_entry(row))
                    .collect(),
            };
            Ok(entries)
        })
    }

    fn get_deleted_batch(
        &self,
        batch_size: usize,
        time_window: Option<TimeRange>,
        watermark_range: Option<WatermarkRange>,
    ) -> StoreFuture<'_, Vec<ChangeFeedEntry>> {
        Box::pin(async move {
            let inner = self.inner.read();
            let mut rows: Vec<&FeedRow> = inner
                .deleted_rows()
                .filter(|row| time_window.map_or(true, |w| w.contains(row.timestamp)))
                .filter(|row| watermark_range.map_or(true, |r| r.contains(row.original_version)))
                .collect();
            rows.sort_by(|a, b| b.original_version.cmp(&a.original_version));
            Ok(rows
                .into_iter()
                .take(batch_size)
                .map(|row| inner.to_entry(row))
                .collect())
        })
    }

    fn get_max_deleted_watermark(&self, timestamp: Timestamp) -> StoreFuture<'_, Option<i64>> {
        Box::pin(async move {
            let inner = self.inner.read();
            Ok(inner
                .deleted_rows()
                .filter(|row| row.timestamp <= timestamp)
                .map(|row| row.original_version)
                .max())
        })
    }
}

impl<C: Clock> MetadataStore for InMemoryDicomStore<C> {
    fn get_instance_metadata(&self, version: i64) -> StoreFuture<'_, Option<serde_json::Value>> {
        Box::pin(async move {
            Ok(get_json(self.blobs.as_ref(), &metadata_key(version)).await?)
        })
    }
}

impl<C: Clock> InstanceWatermarkStore for InMemoryDicomStore<C> {
    fn watermarks_desc(&self, upper: Option<i64>, limit: usize) -> StoreFuture<'_, Vec<i64>> {
        Box::pin(async move {
            let inner = self.inner.read();
            let upper = upper.unwrap_or(i64::MAX);
            Ok(inner
                .live
                .range(..=upper)
                .rev()
                .take(limit)
                .map(|(watermark, _)| *watermark)
                .collect())
        })
    }

    fn instances_in_range(
        &self,
        range: WatermarkRange,
    ) -> StoreFuture<'_, Vec<InstanceIdentifier>> {
        Box::pin(async move {
            let inner = self.inner.read();
            Ok(inner
                .live
                .range(range.start()..=range.end())
                .map(|(_, id)| id.clone())
                .collect())
        })
    }

    fn upsert_derived(
        &self,
        watermark: i64,
        properties: DerivedProperties,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.inner.write();
            // A version deleted since planning has nothing left to annotate.
            if inner.live.contains_key(&watermark) {
                inner.derived.insert(watermark, properties);
            }
            Ok(())
        })
    }
}
