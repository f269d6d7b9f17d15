//! Change feed: ordered, paged access to DICOM instance mutations
//!
//! ```text
//! InMemoryDicomStore / SQL ──▶ ChangeFeedStore ──▶ ChangeFeedService (validate, enrich)
//!                                    │
//!                                    └──▶ ChangeFeedProcessor ──▶ FeedSink
//!                                              │
//!                                              └── SyncStateStore (cursor)
//! ```

pub mod error;
pub mod processor;
pub mod processor_dst;
pub mod service;
pub mod store;
pub mod sync_state;
pub mod types;

pub use error::{ChangeFeedError, SinkError};
pub use processor::{ChangeFeedProcessor, FeedSink, LoggingSink, PollOutcome, ProcessorStats};
pub use processor_dst::{
    run_processor_dst_batch, summarize_processor_batch, ProcessorDSTConfig, ProcessorDSTHarness,
    ProcessorDSTResult,
};
pub use service::{ChangeFeedService, Enrichment, LatestEntry};
pub use store::{ChangeFeedStore, MetadataStore, StoreFuture};
pub use sync_state::{
    InMemorySyncStateStore, ObjectStoreSyncStateStore, SyncFuture, SyncStateStore,
};
pub use types::{
    ChangeFeedAction, ChangeFeedEntry, ChangeFeedOrder, ChangeFeedState, SyncState, TimeRange,
};
