mod file_config;

pub use file_config::{FileConfig, RouterApiConfig, SchedulerConfig};

use crate::cadence::ScheduleTimezone;
use crate::server::RequestsLoggingLevel;
use anyhow::{bail, Result};
use clap::ValueEnum;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_BACKUP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub tick_interval_secs: u64,
    pub backup_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub schedule_timezone: ScheduleTimezone,
    pub accept_invalid_certs: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_dir: None,
            backup_dir: None,
            port: DEFAULT_PORT,
            logging_level: RequestsLoggingLevel::default(),
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            backup_timeout_secs: DEFAULT_BACKUP_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            schedule_timezone: ScheduleTimezone::default(),
            accept_invalid_certs: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub scheduler: SchedulerSettings,
    pub router_api: RouterApiSettings,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub timezone: ScheduleTimezone,
}

#[derive(Debug, Clone)]
pub struct RouterApiSettings {
    /// Budget for connect plus export of one backup run.
    pub backup_timeout: Duration,
    /// Budget for connection tests.
    pub connect_timeout: Duration,
    pub accept_invalid_certs: bool,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let backup_dir = file
            .backup_dir
            .map(PathBuf::from)
            .or_else(|| cli.backup_dir.clone())
            .unwrap_or_else(|| db_dir.join("backups"));
        if backup_dir.exists() && !backup_dir.is_dir() {
            bail!("backup_dir is not a directory: {:?}", backup_dir);
        }

        let port = file.port.unwrap_or(cli.port);

        let logging_level = match file.logging_level {
            Some(s) => parse_logging_level(&s)
                .ok_or_else(|| anyhow::anyhow!("Unknown logging_level: {:?}", s))?,
            None => cli.logging_level.clone(),
        };

        let scheduler_file = file.scheduler.unwrap_or_default();
        let tick_interval_secs = scheduler_file
            .tick_interval_secs
            .unwrap_or(cli.tick_interval_secs);
        if tick_interval_secs == 0 {
            bail!("tick_interval_secs must be greater than zero");
        }
        let timezone = match scheduler_file.timezone {
            Some(s) => s
                .parse::<ScheduleTimezone>()
                .map_err(|e| anyhow::anyhow!("Invalid scheduler timezone: {}", e))?,
            None => cli.schedule_timezone,
        };

        let api_file = file.router_api.unwrap_or_default();
        let backup_timeout_secs = api_file
            .backup_timeout_secs
            .unwrap_or(cli.backup_timeout_secs);
        let connect_timeout_secs = api_file
            .connect_timeout_secs
            .unwrap_or(cli.connect_timeout_secs);
        if backup_timeout_secs == 0 {
            bail!("backup_timeout_secs must be greater than zero");
        }
        if connect_timeout_secs == 0 {
            bail!("connect_timeout_secs must be greater than zero");
        }

        Ok(Self {
            db_dir,
            backup_dir,
            port,
            logging_level,
            scheduler: SchedulerSettings {
                tick_interval: Duration::from_secs(tick_interval_secs),
                timezone,
            },
            router_api: RouterApiSettings {
                backup_timeout: Duration::from_secs(backup_timeout_secs),
                connect_timeout: Duration::from_secs(connect_timeout_secs),
                accept_invalid_certs: api_file
                    .accept_invalid_certs
                    .unwrap_or(cli.accept_invalid_certs),
            },
        })
    }

    pub fn routers_db_path(&self) -> PathBuf {
        self.db_dir.join("routers.db")
    }
}

/// Parses a logging level string into RequestsLoggingLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}
