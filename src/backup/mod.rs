//! Backup orchestration: scheduling, execution, status and administration.

mod artifact_store;
mod error;
mod executor;
mod manager;
mod run_lock;
mod scheduler;
mod stats;
mod status_cache;

#[cfg(test)]
pub(crate) mod test_support;

pub use artifact_store::{ArtifactStore, FsArtifactStore};
pub use error::BackupError;
pub use executor::{artifact_filename, artifact_stem, BackupExecutor, BackupTarget, Trigger};
pub use manager::{
    BackupManager, ConnectionTestResult, ManagerError, PruneReport, RouterWithStatus,
    ScheduleView,
};
pub use run_lock::{RunGuard, RunLocks};
pub use scheduler::{BackupScheduler, TickReport};
pub use stats::{BackupStats, StatsAggregator};
pub use status_cache::{Reachability, RouterStatus, RouterStatusCache};
