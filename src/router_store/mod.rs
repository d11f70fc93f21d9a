//! Durable state: router registry, schedules, artifact index and run history.

mod models;
mod schema;
mod sqlite_router_store;

pub use models::*;
pub use schema::ROUTER_VERSIONED_SCHEMAS;
pub use sqlite_router_store::SqliteRouterStore;

use anyhow::Result;
use chrono::{DateTime, Utc};

pub trait RouterStore: Send + Sync {
    // Routers
    fn create_router(&self, router: &NewRouter) -> Result<Router>;
    /// Returns `None` if the router does not exist.
    fn update_router(&self, id: RouterId, update: &RouterUpdate) -> Result<Option<Router>>;
    fn get_router(&self, id: RouterId) -> Result<Option<Router>>;
    fn get_router_by_name(&self, name: &str) -> Result<Option<Router>>;
    fn list_routers(&self) -> Result<Vec<Router>>;
    fn count_routers(&self) -> Result<usize>;
    /// Deletes the router and, in the same transaction, every schedule that
    /// references it. Artifact index entries are left alone.
    fn delete_router(&self, id: RouterId) -> Result<bool>;

    // Artifact index
    fn insert_artifact(&self, artifact: &NewArtifact) -> Result<BackupArtifact>;
    fn get_artifact(&self, id: ArtifactId) -> Result<Option<BackupArtifact>>;
    fn list_artifacts(&self, router_id: Option<RouterId>) -> Result<Vec<BackupArtifact>>;
    fn list_artifacts_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<BackupArtifact>>;
    fn delete_artifact(&self, id: ArtifactId) -> Result<bool>;
    fn count_artifacts(&self) -> Result<usize>;
    fn total_artifact_bytes(&self) -> Result<u64>;

    // Run history
    fn record_run_start(&self, router_id: RouterId, kind: BackupKind, triggered_by: &str)
        -> Result<RunId>;
    fn record_run_finish(
        &self,
        run_id: RunId,
        status: RunStatus,
        error_kind: Option<&str>,
        error_message: Option<&str>,
        artifact_id: Option<ArtifactId>,
    ) -> Result<()>;
    fn list_runs(&self, router_id: RouterId, limit: usize) -> Result<Vec<BackupRun>>;
    /// Flags runs left in `running` by a previous process as interrupted.
    fn mark_stale_runs_interrupted(&self) -> Result<usize>;
}

pub trait ScheduleStore: Send + Sync {
    fn create_schedule(&self, schedule: &NewSchedule) -> Result<Schedule>;
    fn get_schedule(&self, id: ScheduleId) -> Result<Option<Schedule>>;
    fn list_schedules(&self) -> Result<Vec<Schedule>>;
    fn list_schedules_for_router(&self, router_id: RouterId) -> Result<Vec<Schedule>>;
    fn delete_schedule(&self, id: ScheduleId) -> Result<bool>;
}
