//! DICOM Ops Demo
//!
//! Seeds an in-memory instance store, tails its change feed with a logging
//! sink, and runs every maintenance job to completion through the durable
//! orchestration host.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | DICOM_OPS_CONFIG | - | TOML config path (also the first argument) |
//! | DICOM_OPS_LOG_FORMAT | text | text or json |
//! | DICOM_OPS_PAGE_SIZE | 100 | Change feed page size |
//! | DICOM_OPS_STEADY_STATE_INTERVAL_MS | 5000 | Idle poll interval |
//! | DICOM_OPS_CATCH_UP_INTERVAL_MS | 0 | Poll interval while behind |
//! | DICOM_OPS_MAX_DEGREE_OF_PARALLELISM | 8 | Metadata fetch fan-out |
//! | DICOM_OPS_STATE_PATH | - | Keep checkpoints and sync state on local disk |
//! | RUST_LOG | info | tracing filter |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use dicom_ops::changefeed::{
    ChangeFeedOrder, ChangeFeedProcessor, ChangeFeedService, InMemorySyncStateStore,
    LoggingSink, ObjectStoreSyncStateStore, SyncStateStore, TimeRange,
};
use dicom_ops::clock::{Clock, ProductionClock};
use dicom_ops::config::{JobConfig, OpsConfig, StateStoreConfig, StateStoreType};
use dicom_ops::jobs::{
    BackfillJob, BlobMigrationDeleteJob, CleanupJob, ExportFilter, ExportJob, MigrationJob,
};
use dicom_ops::observability::{init_tracing, LogFormat};
use dicom_ops::orchestration::{
    JobReport, ObjectStoreStateStore, OrchestrationEngine, OrchestrationError,
    OrchestrationHost, OrchestrationJob, OrchestrationStateStore, InMemoryStateStore,
    ReplaySafeObserver, TracingObserver,
};
use dicom_ops::storage::{InMemoryDicomStore, InMemoryObjectStore, LocalFsObjectStore};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const CONFIG_ENV: &str = "DICOM_OPS_CONFIG";
const SEED_STUDIES: usize = 3;
const SEED_INSTANCES_PER_STUDY: usize = 8;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing(LogFormat::from_env())?;
    let config = load_config()?;
    info!(?config, "Configuration loaded");

    let clock = ProductionClock::new();
    let (state, sync_state) = open_state_stores(&config.state_store)?;

    let blobs = Arc::new(InMemoryObjectStore::new());
    let store = Arc::new(InMemoryDicomStore::new(clock.clone(), blobs.clone()));
    seed(&store).await?;

    let cancel = CancellationToken::new();
    let processor = Arc::new(ChangeFeedProcessor::new(
        store.clone(),
        sync_state.clone(),
        Arc::new(LoggingSink),
        clock.clone(),
        config.processor.clone(),
    ));
    let processor_task = {
        let processor = processor.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move { processor.run(cancel).await })
    };

    let export_destination = InMemoryObjectStore::new();
    let mut reports = Vec::new();
    reports.push(
        run_job(
            "migration-1",
            MigrationJob::new(store.clone(), store.blobs()),
            (),
            &config.jobs.migration,
            &state,
            &clock,
            &cancel,
        )
        .await?,
    );
    reports.push(
        run_job(
            "blob-delete-1",
            BlobMigrationDeleteJob::new(store.clone(), store.blobs()),
            (),
            &config.jobs.blob_delete,
            &state,
            &clock,
            &cancel,
        )
        .await?,
    );
    reports.push(
        run_job(
            "backfill-1",
            BackfillJob::new(store.clone(), store.blobs()),
            (),
            &config.jobs.backfill,
            &state,
            &clock,
            &cancel,
        )
        .await?,
    );
    reports.push(
        run_job(
            "export-1",
            ExportJob::new(
                store.clone(),
                store.blobs(),
                Arc::new(export_destination.clone()),
            ),
            ExportFilter {
                destination_prefix: "export-1".to_string(),
            },
            &config.jobs.export,
            &state,
            &clock,
            &cancel,
        )
        .await?,
    );
    reports.push(
        run_job(
            "cleanup-1",
            CleanupJob::new(store.clone(), store.blobs()),
            TimeRange::ALL,
            &config.jobs.cleanup,
            &state,
            &clock,
            &cancel,
        )
        .await?,
    );

    // Let the processor reach the end of the feed before stopping it
    let target = store.feed_len() as i64;
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        loop {
            match sync_state.get().await {
                Ok(s) if s.synced_sequence >= target => break,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to read sync state"),
            }
            clock.sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(target, "Change feed processor did not catch up before shutdown");
    }
    cancel.cancel();
    let stats = processor_task.await?;

    let service = ChangeFeedService::new(store.clone(), store.clone(), config.change_feed.clone());
    if let Some(latest) = service.get_latest(true, ChangeFeedOrder::Ascending).await? {
        info!(
            sequence = latest.entry.sequence,
            action = ?latest.entry.action,
            enrichment = ?latest.enrichment,
            "Latest change feed entry"
        );
    }

    println!("Change feed: {:?}", stats);
    for report in reports.iter().flatten() {
        println!(
            "{:<12} {:<14} progress={} executions={} completed={}",
            report.job,
            report.instance_id,
            report.progress,
            report.executions,
            report
                .completed
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    println!(
        "Exported objects: {}, live instances: {}",
        export_destination.len(),
        store.live_count()
    );
    Ok(())
}

fn load_config() -> Result<OpsConfig, BoxError> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from);
    let mut config = match path {
        Some(path) => OpsConfig::from_file(&path)?,
        None => OpsConfig::default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

fn open_state_stores(
    config: &StateStoreConfig,
) -> Result<(Arc<dyn OrchestrationStateStore>, Arc<dyn SyncStateStore>), BoxError> {
    match (config.store_type, &config.local_path) {
        (StateStoreType::LocalFs, Some(path)) => {
            let store = Arc::new(LocalFsObjectStore::new(path.clone()));
            Ok((
                Arc::new(ObjectStoreStateStore::new(store.clone(), config.prefix.clone())),
                Arc::new(ObjectStoreSyncStateStore::new(store, &config.prefix, "logging")),
            ))
        }
        (StateStoreType::LocalFs, None) => {
            Err("state_store.local_path is required for LocalFs".into())
        }
        (StateStoreType::InMemory, _) => Ok((
            Arc::new(InMemoryStateStore::new()),
            Arc::new(InMemorySyncStateStore::new()),
        )),
    }
}

/// A few studies with one update and a handful of deletions
async fn seed(store: &InMemoryDicomStore<ProductionClock>) -> Result<(), BoxError> {
    for study in 0..SEED_STUDIES {
        let study_uid = format!("1.2.840.{}", study);
        let series_uid = format!("{}.1", study_uid);
        for i in 0..SEED_INSTANCES_PER_STUDY {
            let sop_uid = format!("{}.{}", series_uid, i);
            let pixels = format!("pixel data {}", sop_uid);
            store
                .add_instance(
                    &study_uid,
                    &series_uid,
                    &sop_uid,
                    pixels.as_bytes(),
                    json!({ "00080018": { "vr": "UI", "Value": [sop_uid] } }),
                )
                .await?;
        }
    }
    store
        .update_instance(
            "1.2.840.0",
            "1.2.840.0.1",
            "1.2.840.0.1.0",
            json!({ "00100010": { "vr": "PN", "Value": ["Anonymous"] } }),
        )
        .await?;
    for study in 0..SEED_STUDIES {
        let series_uid = format!("1.2.840.{}.1", study);
        store.delete_instance(
            &format!("1.2.840.{}", study),
            &series_uid,
            &format!("{}.{}", series_uid, SEED_INSTANCES_PER_STUDY - 1),
        )?;
    }
    info!(
        live = store.live_count(),
        feed = store.feed_len(),
        "Seeded instance store"
    );
    Ok(())
}

/// Start (or resume) an instance and drive it to completion
async fn run_job<J: OrchestrationJob>(
    instance_id: &str,
    job: J,
    filter: J::Filter,
    job_config: &JobConfig,
    state: &Arc<dyn OrchestrationStateStore>,
    clock: &ProductionClock,
    cancel: &CancellationToken,
) -> Result<Option<JobReport>, BoxError> {
    let engine = OrchestrationEngine::new(
        Arc::new(job),
        clock.clone(),
        job_config.retry.clone(),
        cancel.child_token(),
    );
    let host = OrchestrationHost::new(
        engine,
        clock.clone(),
        state.clone(),
        Arc::new(ReplaySafeObserver::new(TracingObserver)),
    );
    match host.start(instance_id, filter, job_config.batching).await {
        Ok(()) => {}
        Err(OrchestrationError::AlreadyRunning(_)) => {
            info!(instance = instance_id, "Resuming orchestration");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(host.run_to_completion(instance_id).await?)
}
