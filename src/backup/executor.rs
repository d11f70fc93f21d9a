//! One backup attempt for one router.

use super::artifact_store::ArtifactStore;
use super::error::BackupError;
use super::run_lock::RunGuard;
use super::status_cache::{Reachability, RouterStatusCache};
use crate::router_client::{close_session, RouterClient};
use crate::router_store::{
    BackupArtifact, BackupKind, NewArtifact, Router, RouterConnectParams, RouterId, RouterStore,
    RunStatus, ScheduleId,
};
use crate::server::metrics;
use chrono::{DateTime, Utc};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout_at;
use tracing::{debug, error, info, warn};

/// Upper bound on `_N` suffixes tried when a filename is taken.
const MAX_FILENAME_SUFFIX: u32 = 1000;

/// Everything a run needs from the router, copied at dispatch time.
#[derive(Debug, Clone)]
pub struct BackupTarget {
    pub router_id: RouterId,
    pub router_name: String,
    pub slug: String,
    pub params: RouterConnectParams,
}

impl From<&Router> for BackupTarget {
    fn from(router: &Router) -> Self {
        Self {
            router_id: router.id,
            router_name: router.name.clone(),
            slug: router.slug(),
            params: router.connect_params(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Schedule(ScheduleId),
    Manual,
}

impl Trigger {
    pub fn label(&self) -> &'static str {
        match self {
            Trigger::Schedule(_) => "schedule",
            Trigger::Manual => "manual",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Schedule(id) => write!(f, "schedule:{}", id),
            Trigger::Manual => f.write_str("manual"),
        }
    }
}

pub struct BackupExecutor {
    client: Arc<dyn RouterClient>,
    artifacts: Arc<dyn ArtifactStore>,
    store: Arc<dyn RouterStore>,
    status: Arc<RouterStatusCache>,
    timeout: Duration,
}

impl BackupExecutor {
    pub fn new(
        client: Arc<dyn RouterClient>,
        artifacts: Arc<dyn ArtifactStore>,
        store: Arc<dyn RouterStore>,
        status: Arc<RouterStatusCache>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            artifacts,
            store,
            status,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs one backup while holding the router's run lock.
    ///
    /// The guard is released when this returns, whatever the outcome. Every
    /// attempt is recorded in the run history.
    pub async fn run(
        &self,
        guard: RunGuard,
        target: BackupTarget,
        kind: BackupKind,
        trigger: Trigger,
    ) -> Result<BackupArtifact, BackupError> {
        debug_assert_eq!(guard.router_id(), target.router_id);
        let started = Instant::now();
        metrics::inc_runs_in_flight();

        let trigger_str = trigger.to_string();
        let run_id = match self
            .store
            .record_run_start(target.router_id, kind, &trigger_str)
        {
            Ok(id) => Some(id),
            Err(e) => {
                error!(
                    "Failed to record run start for router {}: {:#}",
                    target.router_name, e
                );
                None
            }
        };

        info!(
            "Starting {} backup of router {} ({}:{}, trigger {})",
            kind, target.router_name, target.params.host, target.params.port, trigger_str
        );

        let result = self.attempt(&target, kind).await;
        let elapsed = started.elapsed();

        let outcome = match &result {
            Ok(artifact) => {
                info!(
                    "Backup of router {} finished in {:?}: {} ({} bytes)",
                    target.router_name, elapsed, artifact.filename, artifact.size_bytes
                );
                "success"
            }
            Err(e) => {
                warn!(
                    "{} backup of router {} failed after {:?}: {}",
                    kind, target.router_name, elapsed, e
                );
                e.kind()
            }
        };
        metrics::record_backup_attempt(kind.as_str(), outcome, trigger.label(), elapsed);
        metrics::dec_runs_in_flight();

        if let Some(run_id) = run_id {
            let recorded = match &result {
                Ok(artifact) => self.store.record_run_finish(
                    run_id,
                    RunStatus::Succeeded,
                    None,
                    None,
                    Some(artifact.id),
                ),
                Err(e) => self.store.record_run_finish(
                    run_id,
                    RunStatus::Failed,
                    Some(e.kind()),
                    Some(&e.to_string()),
                    None,
                ),
            };
            if let Err(e) = recorded {
                error!(
                    "Failed to record run finish for router {}: {:#}",
                    target.router_name, e
                );
            }
        }

        drop(guard);
        result
    }

    /// Connect, export, persist, then update status. A single deadline covers
    /// connect and export together.
    async fn attempt(
        &self,
        target: &BackupTarget,
        kind: BackupKind,
    ) -> Result<BackupArtifact, BackupError> {
        let deadline = tokio::time::Instant::now() + self.timeout;

        let mut session = match timeout_at(deadline, self.client.connect(&target.params)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.mark_offline(target.router_id);
                return Err(e.into());
            }
            Err(_) => {
                debug!("Connect to router {} timed out", target.router_name);
                self.mark_offline(target.router_id);
                return Err(BackupError::ExportTimeout);
            }
        };

        // The export future is dropped on timeout; the session is closed
        // either way before anything else happens.
        let exported = timeout_at(deadline, session.export(kind)).await;
        close_session(session).await;

        let data = match exported {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(BackupError::ExportTimeout),
        };
        if data.is_empty() {
            return Err(BackupError::ExportFailed(
                "router returned an empty payload".to_string(),
            ));
        }

        let created_at = Utc::now();
        let (filename, size_bytes) = self.write_artifact(target, kind, created_at, &data).await?;

        let artifact = self
            .store
            .insert_artifact(&NewArtifact {
                router_id: target.router_id,
                router_name: target.router_name.clone(),
                filename: filename.clone(),
                size_bytes,
                kind,
                created_at,
            })
            .map_err(|e| BackupError::StorageFailed(format!("{:#}", e)));

        let artifact = match artifact {
            Ok(artifact) => artifact,
            Err(e) => {
                if let Err(remove_err) = self.artifacts.delete(&filename).await {
                    warn!("Failed to remove unindexed artifact {}: {}", filename, remove_err);
                }
                return Err(e);
            }
        };

        metrics::record_backup_bytes(size_bytes);
        self.status
            .mark_backup_succeeded(target.router_id, Utc::now());
        Ok(artifact)
    }

    async fn write_artifact(
        &self,
        target: &BackupTarget,
        kind: BackupKind,
        created_at: DateTime<Utc>,
        data: &[u8],
    ) -> Result<(String, u64), BackupError> {
        let stem = artifact_stem(&target.slug, kind, created_at);
        for suffix in 0..=MAX_FILENAME_SUFFIX {
            let filename = artifact_filename(&stem, suffix, kind);
            match self.artifacts.write_new(&filename, data).await {
                Ok(size) => return Ok((filename, size)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("Artifact name {} taken, trying next suffix", filename);
                }
                Err(e) => return Err(BackupError::StorageFailed(e.to_string())),
            }
        }
        Err(BackupError::StorageFailed(format!(
            "no free filename for {} after {} attempts",
            stem, MAX_FILENAME_SUFFIX
        )))
    }

    fn mark_offline(&self, router_id: RouterId) {
        self.status
            .mark_checked(router_id, Reachability::Offline, Utc::now());
    }
}

/// `{slug}_{kind}_{timestamp}`, timestamp in ISO 8601 basic format, UTC.
pub fn artifact_stem(slug: &str, kind: BackupKind, at: DateTime<Utc>) -> String {
    format!("{}_{}_{}", slug, kind, at.format("%Y%m%dT%H%M%SZ"))
}

/// Suffix 0 means no disambiguator.
pub fn artifact_filename(stem: &str, suffix: u32, kind: BackupKind) -> String {
    if suffix == 0 {
        format!("{}.{}", stem, kind.extension())
    } else {
        format!("{}_{}.{}", stem, suffix, kind.extension())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::artifact_store::FsArtifactStore;
    use crate::backup::run_lock::RunLocks;
    use crate::backup::test_support::FakeRouterClient;
    use crate::router_client::ClientError;
    use crate::router_store::{NewRouter, SqliteRouterStore};
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        client: FakeRouterClient,
        store: Arc<SqliteRouterStore>,
        status: Arc<RouterStatusCache>,
        locks: RunLocks,
        executor: BackupExecutor,
        router: Router,
    }

    fn fixture(client: FakeRouterClient, timeout: Duration) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteRouterStore::in_memory().unwrap());
        let artifacts = Arc::new(FsArtifactStore::new(temp_dir.path().join("backups")).unwrap());
        let status = Arc::new(RouterStatusCache::new());
        let router = store
            .create_router(&NewRouter {
                name: "R1".to_string(),
                host: "10.0.0.1".to_string(),
                port: None,
                username: "admin".to_string(),
                password: "secret".to_string(),
                use_ssl: false,
                enabled: true,
                notes: None,
            })
            .unwrap();
        let executor = BackupExecutor::new(
            Arc::new(client.clone()),
            artifacts,
            store.clone(),
            status.clone(),
            timeout,
        );
        Fixture {
            _temp_dir: temp_dir,
            client,
            store,
            status,
            locks: RunLocks::new(),
            executor,
            router,
        }
    }

    impl Fixture {
        async fn run(&self, kind: BackupKind) -> Result<BackupArtifact, BackupError> {
            let guard = self.locks.try_acquire(self.router.id).unwrap();
            self.executor
                .run(guard, BackupTarget::from(&self.router), kind, Trigger::Manual)
                .await
        }
    }

    #[test]
    fn test_filename_layout() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 2, 0, 7).unwrap();
        let stem = artifact_stem("r1", BackupKind::Full, at);
        assert_eq!(stem, "r1_full_20240115T020007Z");
        assert_eq!(
            artifact_filename(&stem, 0, BackupKind::Full),
            "r1_full_20240115T020007Z.backup"
        );
        assert_eq!(
            artifact_filename(&stem, 2, BackupKind::Config),
            "r1_full_20240115T020007Z_2.rsc"
        );
        assert_eq!(Trigger::Schedule(4).to_string(), "schedule:4");
    }

    #[tokio::test]
    async fn test_successful_run_writes_artifact_and_marks_online() {
        let f = fixture(FakeRouterClient::new(), Duration::from_secs(5));

        let artifact = f.run(BackupKind::Config).await.unwrap();

        assert!(artifact.filename.starts_with("r1_config_"));
        assert!(artifact.filename.ends_with(".rsc"));
        assert!(artifact.size_bytes > 0);
        assert_eq!(artifact.router_name, "R1");

        let status = f.status.get(f.router.id);
        assert_eq!(status.reachability, Reachability::Online);
        assert!(status.last_backup_at.is_some());
        assert!(!f.locks.is_held(f.router.id));
        assert_eq!(f.client.closes(), 1);
        assert_eq!(f.client.last_params().unwrap().host, "10.0.0.1");

        let runs = f.store.list_runs(f.router.id, 10).unwrap();
        assert_eq!(runs[0].status, RunStatus::Succeeded);
        assert_eq!(runs[0].artifact_id, Some(artifact.id));
        assert_eq!(runs[0].triggered_by, "manual");
    }

    #[tokio::test]
    async fn test_same_second_backups_get_distinct_names() {
        let f = fixture(FakeRouterClient::new(), Duration::from_secs(5));

        let first = f.run(BackupKind::Full).await.unwrap();
        let second = f.run(BackupKind::Full).await.unwrap();

        assert_ne!(first.filename, second.filename);
        assert_eq!(f.store.count_artifacts().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_connection_failure_marks_offline() {
        let client = FakeRouterClient::new();
        client.fail_connect(Some(ClientError::ConnectionFailed("refused".to_string())));
        let f = fixture(client, Duration::from_secs(5));
        f.status.mark_backup_succeeded(f.router.id, Utc::now());

        let err = f.run(BackupKind::Full).await.unwrap_err();

        assert_eq!(err, BackupError::ConnectionFailed("refused".to_string()));
        assert_eq!(f.status.get(f.router.id).reachability, Reachability::Offline);
        assert_eq!(f.store.count_artifacts().unwrap(), 0);
        assert_eq!(f.client.exports(), 0);
        let runs = f.store.list_runs(f.router.id, 1).unwrap();
        assert_eq!(runs[0].error_kind.as_deref(), Some("connection_failed"));
    }

    #[tokio::test]
    async fn test_authentication_failure_marks_offline() {
        let client = FakeRouterClient::new();
        client.fail_connect(Some(ClientError::AuthenticationFailed("bad".to_string())));
        let f = fixture(client, Duration::from_secs(5));

        let err = f.run(BackupKind::Config).await.unwrap_err();
        assert_eq!(err.kind(), "authentication_failed");
        assert_eq!(f.status.get(f.router.id).reachability, Reachability::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_marks_offline_and_releases_lock() {
        let client = FakeRouterClient::new().with_connect_delay(Duration::from_secs(60));
        let f = fixture(client, Duration::from_secs(30));

        let err = f.run(BackupKind::Full).await.unwrap_err();

        assert_eq!(err, BackupError::ExportTimeout);
        assert_eq!(f.status.get(f.router.id).reachability, Reachability::Offline);
        assert!(!f.locks.is_held(f.router.id));
        assert_eq!(f.client.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_timeout_keeps_prior_status() {
        let client = FakeRouterClient::new().with_export_delay(Duration::from_secs(60));
        let f = fixture(client, Duration::from_secs(30));
        let before = Utc::now();
        f.status.mark_backup_succeeded(f.router.id, before);

        let err = f.run(BackupKind::Full).await.unwrap_err();

        assert_eq!(err, BackupError::ExportTimeout);
        let status = f.status.get(f.router.id);
        assert_eq!(status.reachability, Reachability::Online);
        assert_eq!(status.last_backup_at, Some(before));
        assert!(!f.locks.is_held(f.router.id));
        assert_eq!(f.client.closes(), 1);
        assert_eq!(f.client.in_flight(), 0);
        assert_eq!(f.store.count_artifacts().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_close_does_not_hold_the_lock() {
        let client = FakeRouterClient::new().with_hanging_close();
        let f = fixture(client, Duration::from_secs(30));

        let run = tokio::time::timeout(Duration::from_secs(60), f.run(BackupKind::Config)).await;

        let artifact = run.expect("run should not wait on a stuck close").unwrap();
        assert!(artifact.size_bytes > 0);
        assert!(!f.locks.is_held(f.router.id));
        assert_eq!(f.client.closes(), 1);
        assert_eq!(f.client.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_router_deleted_mid_run_leaves_no_status() {
        let client = FakeRouterClient::new().with_export_delay(Duration::from_millis(200));
        let f = fixture(client, Duration::from_secs(5));

        let run = f.run(BackupKind::Config);
        let delete = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(f.store.delete_router(f.router.id).unwrap());
            f.status.remove(f.router.id);
        };
        let (result, ()) = tokio::join!(run, delete);

        let artifact = result.unwrap();
        assert_eq!(artifact.router_name, "R1");
        assert!(f.status.snapshot().is_empty());
        assert_eq!(f.status.get(f.router.id).reachability, Reachability::Unknown);
        assert!(!f.locks.is_held(f.router.id));
    }

    #[tokio::test]
    async fn test_export_failure_keeps_status_unknown() {
        let client = FakeRouterClient::new();
        client.fail_export(Some(ClientError::ExportFailed("trap".to_string())));
        let f = fixture(client, Duration::from_secs(5));

        let err = f.run(BackupKind::Config).await.unwrap_err();

        assert_eq!(err, BackupError::ExportFailed("trap".to_string()));
        assert_eq!(f.status.get(f.router.id).reachability, Reachability::Unknown);
        assert_eq!(f.client.closes(), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_is_distinct_and_leaves_status() {
        let f = fixture(FakeRouterClient::new(), Duration::from_secs(5));
        // Replace the backup directory with a plain file so writes fail.
        let backups = f._temp_dir.path().join("backups");
        std::fs::remove_dir_all(&backups).unwrap();
        std::fs::write(&backups, b"not a directory").unwrap();

        let err = f.run(BackupKind::Full).await.unwrap_err();

        assert_eq!(err.kind(), "storage_failed");
        assert_eq!(f.status.get(f.router.id).reachability, Reachability::Unknown);
        assert_eq!(f.store.count_artifacts().unwrap(), 0);
    }
}
