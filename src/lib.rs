pub mod changefeed;
pub mod clock;
pub mod config;
pub mod io;
pub mod jobs;
pub mod observability;
pub mod orchestration;
pub mod storage;

#[cfg(test)]
mod stateright;

pub use changefeed::{
    ChangeFeedEntry, ChangeFeedProcessor, ChangeFeedService, ChangeFeedStore, SyncState,
};
pub use clock::{Clock, ProductionClock, SimulatedClock, Timestamp};
pub use config::OpsConfig;
pub use orchestration::{OrchestrationHost, OrchestrationJob, WatermarkRange};
