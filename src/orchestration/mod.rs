//! Durable batch orchestration over watermark ranges
//!
//! A bulk job (export, migration, cleanup, backfill, blob deletion) is one
//! [`OrchestrationJob`] driven by the generic [`OrchestrationEngine`]:
//!
//! ```text
//! OrchestrationHost ── record (checkpoint, execution id) ──▶ OrchestrationStateStore
//!        │ one execution = one iteration
//!        ▼
//! OrchestrationEngine ── BatchPlanner ──▶ job.fetch_watermarks
//!        │
//!        └── ActivityExecutor (retry) ──▶ job.process_batch × max_parallel_count
//! ```

pub mod activity;
pub mod checkpoint;
pub mod engine;
pub mod engine_dst;
pub mod error;
pub mod host;
pub mod job;
pub mod observer;
pub mod planner;
pub mod progress;
pub mod range;
pub mod state_store;

pub use activity::{ActivityError, ActivityExecutor, ActivityOutcome, ErrorKind, RetryPolicy};
pub use checkpoint::{BatchingOptions, Checkpoint};
pub use engine::{IterationOutcome, OrchestrationEngine};
pub use engine_dst::{
    run_engine_dst_batch, summarize_engine_batch, EngineDSTConfig, EngineDSTHarness,
    EngineDSTResult,
};
pub use error::OrchestrationError;
pub use host::{
    ExecutionResult, JobReport, OrchestrationHost, OrchestrationRecord, OrchestrationStatus,
    StatusReport,
};
pub use job::{ActivityFuture, OrchestrationJob};
pub use observer::{
    ExecutionContext, ObservedEvent, ProgressObserver, RecordingObserver, ReplaySafeObserver,
    TracingObserver,
};
pub use planner::{plan_batches, BatchPlanner};
pub use progress::OperationProgress;
pub use range::{batch_span, WatermarkRange};
pub use state_store::{
    InMemoryStateStore, ObjectStoreStateStore, OrchestrationStateStore, StateStoreError,
    VersionedRecord,
};
