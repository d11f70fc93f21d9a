use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mikrotik_backup_server::backup::{
    ArtifactStore, BackupExecutor, BackupManager, BackupScheduler, FsArtifactStore,
    RouterStatusCache, RunLocks,
};
use mikrotik_backup_server::cadence::ScheduleTimezone;
use mikrotik_backup_server::config::{self, AppConfig, CliConfig, FileConfig};
use mikrotik_backup_server::router_client::{ApiRouterClient, RouterClient};
use mikrotik_backup_server::server::{self, ServerConfig};
use mikrotik_backup_server::{RequestsLoggingLevel, SqliteRouterStore};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Its values override the CLI ones.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the SQLite database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Directory where backup files are written. Defaults to <db-dir>/backups.
    #[clap(long, value_parser = parse_path)]
    pub backup_dir: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = config::DEFAULT_PORT)]
    pub port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Seconds between scheduler evaluations.
    #[clap(long, default_value_t = config::DEFAULT_TICK_INTERVAL_SECS)]
    pub tick_interval_secs: u64,

    /// Time budget in seconds for connecting to a router and exporting a backup.
    #[clap(long, default_value_t = config::DEFAULT_BACKUP_TIMEOUT_SECS)]
    pub backup_timeout_secs: u64,

    /// Time budget in seconds for connection tests.
    #[clap(long, default_value_t = config::DEFAULT_CONNECT_TIMEOUT_SECS)]
    pub connect_timeout_secs: u64,

    /// Clock cadence expressions are evaluated against: "local" or "utc".
    #[clap(long, default_value = "local")]
    pub schedule_timezone: ScheduleTimezone,

    /// Reject router TLS certificates that do not validate.
    #[clap(long)]
    pub verify_router_certs: bool,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            db_dir: self.db_dir.clone(),
            backup_dir: self.backup_dir.clone(),
            port: self.port,
            logging_level: self.logging_level.clone(),
            tick_interval_secs: self.tick_interval_secs,
            backup_timeout_secs: self.backup_timeout_secs,
            connect_timeout_secs: self.connect_timeout_secs,
            schedule_timezone: self.schedule_timezone,
            accept_invalid_certs: !self.verify_router_certs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config file {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let app_config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    info!("Initializing metrics...");
    server::metrics::init_metrics();

    let db_path = app_config.routers_db_path();
    info!("Opening SQLite database at {:?}...", db_path);
    let store = Arc::new(SqliteRouterStore::new(&db_path)?);

    info!("Storing backups in {:?}", app_config.backup_dir);
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(&app_config.backup_dir)?);

    let client: Arc<dyn RouterClient> = Arc::new(
        ApiRouterClient::new()
            .with_certificate_validation(!app_config.router_api.accept_invalid_certs),
    );
    let status = Arc::new(RouterStatusCache::new());
    let locks = RunLocks::new();

    let executor = Arc::new(BackupExecutor::new(
        client.clone(),
        artifacts.clone(),
        store.clone(),
        status.clone(),
        app_config.router_api.backup_timeout,
    ));
    let manager = Arc::new(BackupManager::new(
        store.clone(),
        store.clone(),
        client,
        artifacts,
        status,
        locks.clone(),
        executor.clone(),
        app_config.router_api.connect_timeout,
        app_config.scheduler.timezone,
    ));
    let scheduler = Arc::new(BackupScheduler::new(
        store.clone(),
        store,
        executor,
        locks,
        app_config.scheduler.tick_interval,
        app_config.scheduler.timezone,
    ));

    let shutdown_token = CancellationToken::new();
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_token.clone()));

    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down...");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let server_config = ServerConfig {
        requests_logging_level: app_config.logging_level.clone(),
        port: app_config.port,
    };
    let result = server::run_server(manager, server_config, shutdown_token.clone()).await;

    // Stop the scheduler also when the server exits on its own.
    shutdown_token.cancel();
    if let Err(e) = scheduler_handle.await {
        error!("Scheduler task failed: {}", e);
    }
    result
}
