//! Change feed queries with argument validation and metadata enrichment.

use crate::changefeed::error::ChangeFeedError;
use crate::changefeed::store::{ChangeFeedStore, MetadataStore};
use crate::changefeed::types::{ChangeFeedEntry, ChangeFeedOrder, TimeRange};
use crate::config::ChangeFeedConfig;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to the metadata of a single-entry query
#[derive(Debug, Clone, PartialEq)]
pub enum Enrichment {
    NotRequested,
    Populated,
    /// The version no longer exists, or the entry has no live version
    Missing,
    /// Lookup failed; the entry is returned without metadata
    Failed(String),
}

/// Result of [`ChangeFeedService::get_latest`]
#[derive(Debug, Clone, PartialEq)]
pub struct LatestEntry {
    pub entry: ChangeFeedEntry,
    pub enrichment: Enrichment,
}

pub struct ChangeFeedService {
    store: Arc<dyn ChangeFeedStore>,
    metadata: Arc<dyn MetadataStore>,
    config: ChangeFeedConfig,
}

impl ChangeFeedService {
    pub fn new(
        store: Arc<dyn ChangeFeedStore>,
        metadata: Arc<dyn MetadataStore>,
        config: ChangeFeedConfig,
    ) -> Self {
        debug_assert!(config.max_degree_of_parallelism > 0);
        ChangeFeedService {
            store,
            metadata,
            config,
        }
    }

    pub fn config(&self) -> &ChangeFeedConfig {
        &self.config
    }

    /// Most recent entry, optionally with metadata
    pub async fn get_latest(
        &self,
        include_metadata: bool,
        order: ChangeFeedOrder,
    ) -> Result<Option<LatestEntry>, ChangeFeedError> {
        let Some(mut entry) = self.store.get_latest(order).await? else {
            return Ok(None);
        };
        if !include_metadata {
            return Ok(Some(LatestEntry {
                entry,
                enrichment: Enrichment::NotRequested,
            }));
        }

        let enrichment = match entry.current_version {
            None => Enrichment::Missing,
            Some(version) => match self.metadata.get_instance_metadata(version).await {
                Ok(Some(metadata)) => {
                    entry.metadata = Some(metadata);
                    Enrichment::Populated
                }
                Ok(None) => Enrichment::Missing,
                Err(e) => {
                    warn!(sequence = entry.sequence, error = %e, "Metadata lookup failed for latest entry");
                    Enrichment::Failed(e.to_string())
                }
            },
        };
        Ok(Some(LatestEntry { entry, enrichment }))
    }

    /// A page of the feed
    ///
    /// Fails with `InvalidArgument` unless `offset >= 0` and
    /// `1 <= limit <= max_limit`. With `include_metadata`, any failed lookup
    /// fails the whole call.
    pub async fn get_range(
        &self,
        time_range: TimeRange,
        offset: i64,
        limit: usize,
        include_metadata: bool,
        order: ChangeFeedOrder,
    ) -> Result<Vec<ChangeFeedEntry>, ChangeFeedError> {
        if offset < 0 {
            return Err(ChangeFeedError::InvalidArgument(format!(
                "offset must be >= 0, got {}",
                offset
            )));
        }
        if limit == 0 || limit > self.config.max_limit {
            return Err(ChangeFeedError::InvalidArgument(format!(
                "limit must be between 1 and {}, got {}",
                self.config.max_limit, limit
            )));
        }

        let entries = self.store.get_range(time_range, offset, limit, order).await?;
        debug!(offset, limit, returned = entries.len(), "Change feed page read");
        if !include_metadata {
            return Ok(entries);
        }
        self.enrich(entries).await
    }

    /// Attach metadata to each entry with a live version, preserving order
    async fn enrich(
        &self,
        entries: Vec<ChangeFeedEntry>,
    ) -> Result<Vec<ChangeFeedEntry>, ChangeFeedError> {
        let metadata = &self.metadata;
        stream::iter(entries)
            .map(|mut entry| async move {
                if let Some(version) = entry.current_version {
                    entry.metadata = metadata
                        .get_instance_metadata(version)
                        .await
                        .map_err(|source| ChangeFeedError::Metadata {
                            sequence: entry.sequence,
                            source,
                        })?;
                }
                Ok::<_, ChangeFeedError>(entry)
            })
            .buffered(self.config.max_degree_of_parallelism.max(1))
            .try_collect()
            .await
    }
}
