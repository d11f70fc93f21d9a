use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type RouterId = i64;
pub type ScheduleId = i64;
pub type ArtifactId = i64;
pub type RunId = i64;

/// Default RouterOS API ports.
pub const DEFAULT_API_PORT: u16 = 8728;
pub const DEFAULT_API_SSL_PORT: u16 = 8729;

// =============================================================================
// Routers
// =============================================================================

/// A registered MikroTik router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Router {
    pub id: RouterId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub use_ssl: bool,
    pub enabled: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Router {
    /// Copy of everything needed to reach the device.
    ///
    /// Executor runs work on this snapshot, so an edit that lands while a backup
    /// is in flight is only observed by the next run.
    pub fn connect_params(&self) -> RouterConnectParams {
        RouterConnectParams {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            use_ssl: self.use_ssl,
        }
    }

    /// Filesystem-safe form of the router name, used as artifact filename prefix.
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }
}

/// Lowercases, keeps ASCII alphanumerics, `-` and `_`, and collapses everything
/// else into single underscores.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_sep = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            slug.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep && !slug.is_empty() {
            slug.push('_');
            last_was_sep = true;
        }
    }
    let slug = slug.trim_end_matches('_').to_string();
    if slug.is_empty() {
        "router".to_string()
    } else {
        slug
    }
}

/// Connection parameters captured from a [`Router`] at dispatch time.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct RouterConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub use_ssl: bool,
}

impl std::fmt::Debug for RouterConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("use_ssl", &self.use_ssl)
            .finish_non_exhaustive()
    }
}

/// Fields for registering a new router.
#[derive(Debug, Clone, Deserialize)]
pub struct NewRouter {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewRouter {
    pub fn resolved_port(&self) -> u16 {
        self.port.unwrap_or(if self.use_ssl {
            DEFAULT_API_SSL_PORT
        } else {
            DEFAULT_API_PORT
        })
    }
}

fn default_username() -> String {
    "admin".to_string()
}

fn default_true() -> bool {
    true
}

/// Partial update of a router; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouterUpdate {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_ssl: Option<bool>,
    pub enabled: Option<bool>,
    pub notes: Option<String>,
}

// =============================================================================
// Schedules
// =============================================================================

/// What a backup run asks the device to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// Binary `.backup` of the whole device.
    Full,
    /// Plain-text `.rsc` configuration export.
    Config,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Config => "config",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(BackupKind::Full),
            "config" | "config_only" => Some(BackupKind::Config),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            BackupKind::Full => "backup",
            BackupKind::Config => "rsc",
        }
    }
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recurring backup schedule for one router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub router_id: RouterId,
    pub name: String,
    pub cadence: String,
    pub kind: BackupKind,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSchedule {
    pub router_id: RouterId,
    #[serde(default)]
    pub name: Option<String>,
    pub cadence: String,
    #[serde(default = "default_kind")]
    pub kind: BackupKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_kind() -> BackupKind {
    BackupKind::Full
}

// =============================================================================
// Artifacts and runs
// =============================================================================

/// Index entry for a backup file written by the executor.
///
/// Holds the router by id and name only; the router may be edited or deleted
/// afterwards without touching this record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupArtifact {
    pub id: ArtifactId,
    pub router_id: RouterId,
    pub router_name: String,
    pub filename: String,
    pub size_bytes: u64,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub router_id: RouterId,
    pub router_name: String,
    pub filename: String,
    pub size_bytes: u64,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    /// The process stopped while the run was in flight.
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "interrupted" => Some(RunStatus::Interrupted),
            _ => None,
        }
    }
}

/// One backup attempt, scheduled or manual.
#[derive(Debug, Clone, Serialize)]
pub struct BackupRun {
    pub id: RunId,
    pub router_id: RouterId,
    pub kind: BackupKind,
    pub triggered_by: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub artifact_id: Option<ArtifactId>,
}
