//! Test server lifecycle management
//!
//! Each test gets an isolated server with its own database and backup
//! directory, wired to the production RouterOS API client.

use super::constants::*;
use mikrotik_backup_server::backup::{
    ArtifactStore, BackupExecutor, BackupManager, BackupScheduler, FsArtifactStore,
    RouterStatusCache, RunLocks,
};
use mikrotik_backup_server::cadence::ScheduleTimezone;
use mikrotik_backup_server::router_client::{ApiRouterClient, RouterClient};
use mikrotik_backup_server::server::state::ServerState;
use mikrotik_backup_server::server::{make_app, RequestsLoggingLevel, ServerConfig};
use mikrotik_backup_server::SqliteRouterStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Test server instance
///
/// When dropped, the server gracefully shuts down and temp resources are cleaned up.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The port the server is listening on
    pub port: u16,

    /// Scheduler wired to the same store and executor, driven by tests via `tick`.
    pub scheduler: Arc<BackupScheduler>,

    /// Where backup files land
    pub backup_dir: PathBuf,

    // Private fields - keep resources alive until drop
    _temp_dir: TempDir,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    /// Spawns a new test server on a random port
    ///
    /// # Panics
    ///
    /// Panics if the database can't be created, binding fails or the server
    /// doesn't become ready within timeout.
    pub async fn spawn() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let backup_dir = temp_dir.path().join("backups");

        let store = Arc::new(
            SqliteRouterStore::new(temp_dir.path().join("routers.db"))
                .expect("Failed to open router store"),
        );
        let artifacts: Arc<dyn ArtifactStore> =
            Arc::new(FsArtifactStore::new(&backup_dir).expect("Failed to create backup dir"));
        let client: Arc<dyn RouterClient> = Arc::new(ApiRouterClient::new());
        let status = Arc::new(RouterStatusCache::new());
        let locks = RunLocks::new();

        let executor = Arc::new(BackupExecutor::new(
            client.clone(),
            artifacts.clone(),
            store.clone(),
            status.clone(),
            Duration::from_secs(BACKUP_TIMEOUT_SECS),
        ));
        let manager = Arc::new(BackupManager::new(
            store.clone(),
            store.clone(),
            client,
            artifacts,
            status,
            locks.clone(),
            executor.clone(),
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            ScheduleTimezone::Utc,
        ));
        let scheduler = Arc::new(BackupScheduler::new(
            store.clone(),
            store,
            executor,
            locks,
            Duration::from_secs(60),
            ScheduleTimezone::Utc,
        ));

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let config = ServerConfig {
            port,
            requests_logging_level: RequestsLoggingLevel::None,
        };
        let app = make_app(ServerState::new(config, manager));

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        let server = Self {
            base_url,
            port,
            scheduler,
            backup_dir,
            _temp_dir: temp_dir,
            _shutdown_tx: Some(shutdown_tx),
        };

        server.wait_for_ready().await;

        server
    }

    /// Names of the files in the backup directory, sorted.
    pub fn backup_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.backup_dir)
            .expect("Failed to read backup dir")
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    /// Waits for the server to become ready by polling the health endpoint
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client
                .get(format!("{}/api/health", self.base_url))
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return,
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
