//! Administrative operations over routers, schedules, backups and status.

use super::artifact_store::ArtifactStore;
use super::error::BackupError;
use super::executor::{BackupExecutor, BackupTarget, Trigger};
use super::run_lock::RunLocks;
use super::stats::{BackupStats, StatsAggregator};
use super::status_cache::{Reachability, RouterStatus, RouterStatusCache};
use crate::cadence::{CadenceError, CadenceExpr, ScheduleTimezone};
use crate::router_client::{close_session, ClientError, RouterClient, SystemInfo};
use crate::router_store::{
    ArtifactId, BackupArtifact, BackupKind, BackupRun, NewRouter, NewSchedule, Router,
    RouterConnectParams, RouterId, RouterStore, RouterUpdate, Schedule, ScheduleId, ScheduleStore,
};
use crate::server::metrics;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("Invalid cadence expression: {0}")]
    InvalidCadence(#[from] CadenceError),
    #[error("Router {0} not found")]
    RouterNotFound(RouterId),
    #[error("Schedule {0} not found")]
    ScheduleNotFound(ScheduleId),
    #[error("Backup {0} not found")]
    ArtifactNotFound(ArtifactId),
    #[error("A router named '{0}' already exists")]
    DuplicateName(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ManagerError {
    pub fn kind(&self) -> &'static str {
        match self {
            ManagerError::InvalidInput(_) => "invalid_input",
            ManagerError::InvalidCadence(_) => "invalid_cadence",
            ManagerError::RouterNotFound(_) => "router_not_found",
            ManagerError::ScheduleNotFound(_) => "schedule_not_found",
            ManagerError::ArtifactNotFound(_) => "backup_not_found",
            ManagerError::DuplicateName(_) => "duplicate_name",
            ManagerError::Internal(_) => "internal",
        }
    }
}

type ManagerResult<T> = Result<T, ManagerError>;

#[derive(Debug, Clone, Serialize)]
pub struct RouterWithStatus {
    #[serde(flatten)]
    pub router: Router,
    pub status: RouterStatus,
    pub backup_running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleView {
    #[serde(flatten)]
    pub schedule: Schedule,
    pub router_name: Option<String>,
    /// `None` when the cadence is malformed or never fires.
    pub next_due_at: Option<DateTime<Utc>>,
    pub cadence_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionTestResult {
    pub reachability: Reachability,
    pub identity: Option<String>,
    pub system: Option<SystemInfo>,
    pub error_kind: Option<&'static str>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub deleted: usize,
    pub freed_bytes: u64,
    pub failed: usize,
}

pub struct BackupManager {
    router_store: Arc<dyn RouterStore>,
    schedule_store: Arc<dyn ScheduleStore>,
    client: Arc<dyn RouterClient>,
    artifacts: Arc<dyn ArtifactStore>,
    status: Arc<RouterStatusCache>,
    locks: RunLocks,
    executor: Arc<BackupExecutor>,
    stats: StatsAggregator,
    connect_timeout: Duration,
    timezone: ScheduleTimezone,
}

impl BackupManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router_store: Arc<dyn RouterStore>,
        schedule_store: Arc<dyn ScheduleStore>,
        client: Arc<dyn RouterClient>,
        artifacts: Arc<dyn ArtifactStore>,
        status: Arc<RouterStatusCache>,
        locks: RunLocks,
        executor: Arc<BackupExecutor>,
        connect_timeout: Duration,
        timezone: ScheduleTimezone,
    ) -> Self {
        let stats = StatsAggregator::new(Arc::clone(&router_store), Arc::clone(&status));
        Self {
            router_store,
            schedule_store,
            client,
            artifacts,
            status,
            locks,
            executor,
            stats,
            connect_timeout,
            timezone,
        }
    }

    // =========================================================================
    // Routers
    // =========================================================================

    fn with_status(&self, router: Router) -> RouterWithStatus {
        RouterWithStatus {
            status: self.status.get(router.id),
            backup_running: self.locks.is_held(router.id),
            router,
        }
    }

    fn load_router(&self, id: RouterId) -> ManagerResult<Router> {
        self.router_store
            .get_router(id)?
            .ok_or(ManagerError::RouterNotFound(id))
    }

    pub fn list_routers(&self) -> ManagerResult<Vec<RouterWithStatus>> {
        Ok(self
            .router_store
            .list_routers()?
            .into_iter()
            .map(|router| self.with_status(router))
            .collect())
    }

    pub fn get_router(&self, id: RouterId) -> ManagerResult<RouterWithStatus> {
        Ok(self.with_status(self.load_router(id)?))
    }

    pub fn create_router(&self, mut router: NewRouter) -> ManagerResult<RouterWithStatus> {
        router.name = router.name.trim().to_string();
        router.host = router.host.trim().to_string();
        if router.name.is_empty() {
            return Err(ManagerError::InvalidInput("Router name is required".to_string()));
        }
        if router.host.is_empty() {
            return Err(ManagerError::InvalidInput("Router host is required".to_string()));
        }
        if router.port == Some(0) {
            return Err(ManagerError::InvalidInput("Router port must be 1-65535".to_string()));
        }
        if self.router_store.get_router_by_name(&router.name)?.is_some() {
            return Err(ManagerError::DuplicateName(router.name));
        }

        let created = self.router_store.create_router(&router)?;
        info!(
            "Registered router {} (id {}) at {}:{}",
            created.name, created.id, created.host, created.port
        );
        Ok(self.with_status(created))
    }

    pub fn update_router(
        &self,
        id: RouterId,
        mut update: RouterUpdate,
    ) -> ManagerResult<RouterWithStatus> {
        if let Some(name) = update.name.as_mut() {
            *name = name.trim().to_string();
            if name.is_empty() {
                return Err(ManagerError::InvalidInput("Router name is required".to_string()));
            }
            if let Some(existing) = self.router_store.get_router_by_name(name)? {
                if existing.id != id {
                    return Err(ManagerError::DuplicateName(name.clone()));
                }
            }
        }
        if let Some(host) = update.host.as_mut() {
            *host = host.trim().to_string();
            if host.is_empty() {
                return Err(ManagerError::InvalidInput("Router host is required".to_string()));
            }
        }
        if update.port == Some(0) {
            return Err(ManagerError::InvalidInput("Router port must be 1-65535".to_string()));
        }

        let updated = self
            .router_store
            .update_router(id, &update)?
            .ok_or(ManagerError::RouterNotFound(id))?;
        info!("Updated router {} (id {})", updated.name, updated.id);
        Ok(self.with_status(updated))
    }

    /// Removes the router and its schedules. Backup files and their index
    /// entries are kept.
    pub fn delete_router(&self, id: RouterId) -> ManagerResult<()> {
        if !self.router_store.delete_router(id)? {
            return Err(ManagerError::RouterNotFound(id));
        }
        self.status.remove(id);
        info!("Deleted router {}", id);
        Ok(())
    }

    // =========================================================================
    // Connectivity
    // =========================================================================

    /// Connects and probes the identity, without exporting anything.
    pub async fn test_connection(&self, params: &RouterConnectParams) -> ConnectionTestResult {
        let result = probe(self.client.as_ref(), params, self.connect_timeout).await;
        metrics::record_connection_test(result.reachability.as_str());
        result
    }

    /// Same as [`test_connection`](Self::test_connection) for a registered
    /// router, recording the outcome in the status cache.
    pub async fn test_router(&self, id: RouterId) -> ManagerResult<ConnectionTestResult> {
        let router = self.load_router(id)?;
        let result = self.test_connection(&router.connect_params()).await;
        self.status.mark_checked(id, result.reachability, Utc::now());
        Ok(result)
    }

    /// Tests every enabled router concurrently.
    pub async fn check_all_routers(&self) -> ManagerResult<Vec<(RouterId, ConnectionTestResult)>> {
        let routers = self.router_store.list_routers()?;
        let mut tasks = JoinSet::new();
        for router in routers.into_iter().filter(|r| r.enabled) {
            let client = Arc::clone(&self.client);
            let timeout = self.connect_timeout;
            tasks.spawn(async move {
                let result = probe(client.as_ref(), &router.connect_params(), timeout).await;
                (router.id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, result)) => {
                    metrics::record_connection_test(result.reachability.as_str());
                    self.status.mark_checked(id, result.reachability, Utc::now());
                    results.push((id, result));
                }
                Err(e) => warn!("Connection check task failed: {}", e),
            }
        }
        results.sort_by_key(|(id, _)| *id);
        Ok(results)
    }

    // =========================================================================
    // Backups
    // =========================================================================

    /// Runs a backup right away, outside the schedule. Fails with
    /// [`BackupError::AlreadyRunning`] if the router is busy.
    pub async fn trigger_backup_now(
        &self,
        router_id: RouterId,
        kind: BackupKind,
    ) -> Result<BackupArtifact, BackupError> {
        let router = self
            .router_store
            .get_router(router_id)
            .map_err(|e| BackupError::Internal(format!("{:#}", e)))?
            .ok_or(BackupError::RouterNotFound(router_id))?;
        if !router.enabled {
            return Err(BackupError::RouterDisabled(router_id));
        }
        let guard = self
            .locks
            .try_acquire(router_id)
            .ok_or(BackupError::AlreadyRunning(router_id))?;

        // Spawned so the run completes even if the caller goes away.
        let executor = Arc::clone(&self.executor);
        let target = BackupTarget::from(&router);
        tokio::spawn(async move { executor.run(guard, target, kind, Trigger::Manual).await })
            .await
            .map_err(|e| BackupError::Internal(format!("backup task failed: {}", e)))?
    }

    pub fn list_runs(&self, router_id: RouterId, limit: usize) -> ManagerResult<Vec<BackupRun>> {
        self.load_router(router_id)?;
        Ok(self.router_store.list_runs(router_id, limit.clamp(1, 500))?)
    }

    // =========================================================================
    // Schedules
    // =========================================================================

    fn schedule_view(&self, schedule: Schedule, router_name: Option<String>) -> ScheduleView {
        let (next_due_at, cadence_error) = match CadenceExpr::parse(&schedule.cadence) {
            Ok(expr) => (self.timezone.next_due(&expr, Utc::now()), None),
            Err(e) => (None, Some(e.to_string())),
        };
        ScheduleView {
            schedule,
            router_name,
            next_due_at,
            cadence_error,
        }
    }

    pub fn create_schedule(&self, mut schedule: NewSchedule) -> ManagerResult<ScheduleView> {
        let router = self.load_router(schedule.router_id)?;
        let expr = CadenceExpr::parse(&schedule.cadence)?;
        schedule.cadence = expr.as_str().to_string();
        schedule.name = schedule
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        let created = self.schedule_store.create_schedule(&schedule)?;
        info!(
            "Created {} schedule {} for router {} with cadence '{}'",
            created.kind, created.id, router.name, created.cadence
        );
        Ok(self.schedule_view(created, Some(router.name)))
    }

    pub fn delete_schedule(&self, id: ScheduleId) -> ManagerResult<()> {
        if !self.schedule_store.delete_schedule(id)? {
            return Err(ManagerError::ScheduleNotFound(id));
        }
        info!("Deleted schedule {}", id);
        Ok(())
    }

    pub fn list_schedules(&self) -> ManagerResult<Vec<ScheduleView>> {
        let routers = self.router_store.list_routers()?;
        Ok(self
            .schedule_store
            .list_schedules()?
            .into_iter()
            .map(|schedule| {
                let name = routers
                    .iter()
                    .find(|r| r.id == schedule.router_id)
                    .map(|r| r.name.clone());
                self.schedule_view(schedule, name)
            })
            .collect())
    }

    // =========================================================================
    // Artifacts
    // =========================================================================

    pub fn list_artifacts(&self, router_id: Option<RouterId>) -> ManagerResult<Vec<BackupArtifact>> {
        Ok(self.router_store.list_artifacts(router_id)?)
    }

    pub async fn read_artifact(&self, id: ArtifactId) -> ManagerResult<(BackupArtifact, Vec<u8>)> {
        let artifact = self
            .router_store
            .get_artifact(id)?
            .ok_or(ManagerError::ArtifactNotFound(id))?;
        match self.artifacts.read(&artifact.filename).await {
            Ok(data) => Ok((artifact, data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ManagerError::ArtifactNotFound(id)),
            Err(e) => Err(ManagerError::Internal(anyhow::Error::new(e).context(format!(
                "Failed to read backup file {}",
                artifact.filename
            )))),
        }
    }

    /// Removes the file and its index entry. A file already missing from disk
    /// is not an error.
    pub async fn delete_artifact(&self, id: ArtifactId) -> ManagerResult<BackupArtifact> {
        let artifact = self
            .router_store
            .get_artifact(id)?
            .ok_or(ManagerError::ArtifactNotFound(id))?;
        self.remove_artifact(&artifact).await?;
        info!("Deleted backup {}", artifact.filename);
        Ok(artifact)
    }

    async fn remove_artifact(&self, artifact: &BackupArtifact) -> ManagerResult<()> {
        if !self
            .artifacts
            .delete(&artifact.filename)
            .await
            .map_err(|e| {
                anyhow::Error::new(e)
                    .context(format!("Failed to delete backup file {}", artifact.filename))
            })?
        {
            warn!(
                "Backup file {} was already missing; removing index entry",
                artifact.filename
            );
        }
        self.router_store.delete_artifact(artifact.id)?;
        Ok(())
    }

    /// Deletes every backup older than `retention_days`.
    pub async fn prune_artifacts(&self, retention_days: u32) -> ManagerResult<PruneReport> {
        if retention_days == 0 {
            return Err(ManagerError::InvalidInput(
                "Retention must be at least one day".to_string(),
            ));
        }
        let cutoff = Utc::now() - ChronoDuration::days(retention_days as i64);
        let expired = self.router_store.list_artifacts_created_before(cutoff)?;

        let mut report = PruneReport::default();
        for artifact in expired {
            match self.remove_artifact(&artifact).await {
                Ok(()) => {
                    report.deleted += 1;
                    report.freed_bytes += artifact.size_bytes;
                }
                Err(e) => {
                    warn!("Failed to prune {}: {}", artifact.filename, e);
                    report.failed += 1;
                }
            }
        }
        info!(
            "Pruned {} backups older than {} days ({} bytes, {} failures)",
            report.deleted, retention_days, report.freed_bytes, report.failed
        );
        Ok(report)
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub fn stats(&self) -> ManagerResult<BackupStats> {
        let stats = self.stats.stats()?;
        metrics::set_router_counts(stats.online, stats.offline, stats.unknown);
        Ok(stats)
    }
}

async fn probe(
    client: &dyn RouterClient,
    params: &RouterConnectParams,
    timeout: Duration,
) -> ConnectionTestResult {
    let offline = |error: ClientError| ConnectionTestResult {
        reachability: Reachability::Offline,
        identity: None,
        system: None,
        error_kind: Some(match error {
            ClientError::ConnectionFailed(_) => "connection_failed",
            ClientError::AuthenticationFailed(_) => "authentication_failed",
            ClientError::Timeout => "timeout",
            ClientError::ExportFailed(_) => "probe_failed",
        }),
        message: Some(error.to_string()),
    };

    let deadline = tokio::time::Instant::now() + timeout;
    let mut session = match tokio::time::timeout_at(deadline, client.connect(params)).await {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => return offline(e),
        Err(_) => return offline(ClientError::Timeout),
    };

    let info = tokio::time::timeout_at(deadline, session.system_info()).await;
    close_session(session).await;

    match info {
        Ok(Ok(info)) => ConnectionTestResult {
            reachability: Reachability::Online,
            identity: Some(info.identity.clone()),
            system: Some(info),
            error_kind: None,
            message: None,
        },
        // Logged in but the probe failed: the device is reachable.
        Ok(Err(e)) => ConnectionTestResult {
            reachability: Reachability::Online,
            identity: None,
            system: None,
            error_kind: None,
            message: Some(e.to_string()),
        },
        Err(_) => offline(ClientError::Timeout),
    }
}
