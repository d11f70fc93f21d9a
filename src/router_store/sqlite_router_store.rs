use super::models::*;
use super::schema::ROUTER_VERSIONED_SCHEMAS;
use super::{RouterStore, ScheduleStore};
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

const ROUTER_COLUMNS: &str =
    "id, name, host, port, username, password, use_ssl, enabled, notes, created_at, updated_at";
const SCHEDULE_COLUMNS: &str = "id, router_id, name, cadence, kind, enabled, created_at";
const ARTIFACT_COLUMNS: &str = "id, router_id, router_name, filename, size_bytes, kind, created_at";

pub struct SqliteRouterStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRouterStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let is_new_db = !path.exists();

        let conn = Connection::open(path).context("Failed to open router database")?;
        if is_new_db {
            info!("Creating new router database at {:?}", path);
        }
        Self::from_connection(conn, is_new_db)
    }

    /// In-memory database, used by tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, true)
    }

    fn from_connection(mut conn: Connection, is_new_db: bool) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        let latest = ROUTER_VERSIONED_SCHEMAS
            .last()
            .context("No router schema versions defined")?;

        if is_new_db {
            latest.create(&conn)?;
        } else {
            let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
            let db_version = raw_version - BASE_DB_VERSION as i64;
            if db_version < 1 {
                anyhow::bail!(
                    "Router database version {} is invalid (expected >= 1)",
                    db_version
                );
            }

            let schema = ROUTER_VERSIONED_SCHEMAS
                .iter()
                .find(|s| s.version == db_version as usize)
                .with_context(|| format!("Unknown router database version {}", db_version))?;
            schema.validate(&conn).with_context(|| {
                format!(
                    "Router database schema validation failed for version {}",
                    db_version
                )
            })?;

            if (db_version as usize) < latest.version {
                Self::migrate(&mut conn, db_version as usize)?;
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &mut Connection, from_version: usize) -> Result<()> {
        let tx = conn.transaction()?;
        let mut current = from_version;
        for schema in ROUTER_VERSIONED_SCHEMAS
            .iter()
            .filter(|s| s.version > from_version)
        {
            info!(
                "Migrating router database from version {} to {}",
                current, schema.version
            );
            if let Some(migration) = schema.migration {
                migration(&tx).with_context(|| {
                    format!("Failed to run migration to version {}", schema.version)
                })?;
            }
            current = schema.version;
        }
        tx.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + current),
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Router database lock poisoned"))
    }

    fn format_datetime(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    fn parse_datetime(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }

    fn parse_kind(s: &str) -> BackupKind {
        BackupKind::parse(s).unwrap_or(BackupKind::Full)
    }

    fn row_to_router(row: &rusqlite::Row) -> rusqlite::Result<Router> {
        let port: i64 = row.get("port")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;
        Ok(Router {
            id: row.get("id")?,
            name: row.get("name")?,
            host: row.get("host")?,
            port: port as u16,
            username: row.get("username")?,
            password: row.get("password")?,
            use_ssl: row.get::<_, i64>("use_ssl")? != 0,
            enabled: row.get::<_, i64>("enabled")? != 0,
            notes: row.get("notes")?,
            created_at: Self::parse_datetime(&created_at),
            updated_at: Self::parse_datetime(&updated_at),
        })
    }

    fn row_to_schedule(row: &rusqlite::Row) -> rusqlite::Result<Schedule> {
        let kind: String = row.get("kind")?;
        let created_at: String = row.get("created_at")?;
        Ok(Schedule {
            id: row.get("id")?,
            router_id: row.get("router_id")?,
            name: row.get("name")?,
            cadence: row.get("cadence")?,
            kind: Self::parse_kind(&kind),
            enabled: row.get::<_, i64>("enabled")? != 0,
            created_at: Self::parse_datetime(&created_at),
        })
    }

    fn row_to_artifact(row: &rusqlite::Row) -> rusqlite::Result<BackupArtifact> {
        let kind: String = row.get("kind")?;
        let size: i64 = row.get("size_bytes")?;
        let created_at: String = row.get("created_at")?;
        Ok(BackupArtifact {
            id: row.get("id")?,
            router_id: row.get("router_id")?,
            router_name: row.get("router_name")?,
            filename: row.get("filename")?,
            size_bytes: size.max(0) as u64,
            kind: Self::parse_kind(&kind),
            created_at: Self::parse_datetime(&created_at),
        })
    }

    fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<BackupRun> {
        let kind: String = row.get("kind")?;
        let status: String = row.get("status")?;
        let started_at: String = row.get("started_at")?;
        let finished_at: Option<String> = row.get("finished_at")?;
        Ok(BackupRun {
            id: row.get("id")?,
            router_id: row.get("router_id")?,
            kind: Self::parse_kind(&kind),
            triggered_by: row.get("triggered_by")?,
            started_at: Self::parse_datetime(&started_at),
            finished_at: finished_at.as_deref().map(Self::parse_datetime),
            status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
            error_kind: row.get("error_kind")?,
            error_message: row.get("error_message")?,
            artifact_id: row.get("artifact_id")?,
        })
    }

    fn query_router(conn: &Connection, id: RouterId) -> Result<Option<Router>> {
        conn.query_row(
            &format!("SELECT {} FROM routers WHERE id = ?1", ROUTER_COLUMNS),
            params![id],
            Self::row_to_router,
        )
        .optional()
        .context("Failed to load router")
    }

    fn query_schedule(conn: &Connection, id: ScheduleId) -> Result<Option<Schedule>> {
        conn.query_row(
            &format!("SELECT {} FROM schedules WHERE id = ?1", SCHEDULE_COLUMNS),
            params![id],
            Self::row_to_schedule,
        )
        .optional()
        .context("Failed to load schedule")
    }

    fn query_artifact(conn: &Connection, id: ArtifactId) -> Result<Option<BackupArtifact>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM backup_artifacts WHERE id = ?1",
                ARTIFACT_COLUMNS
            ),
            params![id],
            Self::row_to_artifact,
        )
        .optional()
        .context("Failed to load artifact")
    }
}

impl RouterStore for SqliteRouterStore {
    fn create_router(&self, router: &NewRouter) -> Result<Router> {
        let conn = self.conn()?;
        let now = Self::format_datetime(&Utc::now());
        conn.execute(
            "INSERT INTO routers (name, host, port, username, password, use_ssl, enabled, notes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                router.name,
                router.host,
                router.resolved_port() as i64,
                router.username,
                router.password,
                router.use_ssl as i64,
                router.enabled as i64,
                router.notes,
                now,
            ],
        )
        .with_context(|| format!("Failed to insert router {}", router.name))?;
        let id = conn.last_insert_rowid();
        Self::query_router(&conn, id)?.context("Inserted router not found")
    }

    fn update_router(&self, id: RouterId, update: &RouterUpdate) -> Result<Option<Router>> {
        let conn = self.conn()?;
        let Some(mut router) = Self::query_router(&conn, id)? else {
            return Ok(None);
        };

        if let Some(name) = &update.name {
            router.name = name.clone();
        }
        if let Some(host) = &update.host {
            router.host = host.clone();
        }
        if let Some(port) = update.port {
            router.port = port;
        }
        if let Some(username) = &update.username {
            router.username = username.clone();
        }
        if let Some(password) = &update.password {
            router.password = password.clone();
        }
        if let Some(use_ssl) = update.use_ssl {
            router.use_ssl = use_ssl;
        }
        if let Some(enabled) = update.enabled {
            router.enabled = enabled;
        }
        if let Some(notes) = &update.notes {
            router.notes = Some(notes.clone());
        }
        router.updated_at = Utc::now();

        conn.execute(
            "UPDATE routers SET name = ?1, host = ?2, port = ?3, username = ?4, password = ?5,
                 use_ssl = ?6, enabled = ?7, notes = ?8, updated_at = ?9
             WHERE id = ?10",
            params![
                router.name,
                router.host,
                router.port as i64,
                router.username,
                router.password,
                router.use_ssl as i64,
                router.enabled as i64,
                router.notes,
                Self::format_datetime(&router.updated_at),
                id,
            ],
        )
        .with_context(|| format!("Failed to update router {}", id))?;

        Self::query_router(&conn, id)
    }

    fn get_router(&self, id: RouterId) -> Result<Option<Router>> {
        let conn = self.conn()?;
        Self::query_router(&conn, id)
    }

    fn get_router_by_name(&self, name: &str) -> Result<Option<Router>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM routers WHERE name = ?1", ROUTER_COLUMNS),
            params![name],
            Self::row_to_router,
        )
        .optional()
        .context("Failed to load router by name")
    }

    fn list_routers(&self) -> Result<Vec<Router>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM routers ORDER BY name",
            ROUTER_COLUMNS
        ))?;
        let routers = stmt
            .query_map([], Self::row_to_router)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(routers)
    }

    fn count_routers(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM routers", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn delete_router(&self, id: RouterId) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let schedules = tx.execute("DELETE FROM schedules WHERE router_id = ?1", params![id])?;
        let deleted = tx.execute("DELETE FROM routers WHERE id = ?1", params![id])?;
        tx.commit()
            .with_context(|| format!("Failed to delete router {}", id))?;
        if deleted > 0 {
            info!("Deleted router {} and {} schedule(s)", id, schedules);
        }
        Ok(deleted > 0)
    }

    fn insert_artifact(&self, artifact: &NewArtifact) -> Result<BackupArtifact> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO backup_artifacts (router_id, router_name, filename, size_bytes, kind, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                artifact.router_id,
                artifact.router_name,
                artifact.filename,
                artifact.size_bytes as i64,
                artifact.kind.as_str(),
                Self::format_datetime(&artifact.created_at),
            ],
        )
        .with_context(|| format!("Failed to index artifact {}", artifact.filename))?;

        let id = conn.last_insert_rowid();
        Self::query_artifact(&conn, id)?.context("Inserted artifact not found")
    }

    fn get_artifact(&self, id: ArtifactId) -> Result<Option<BackupArtifact>> {
        let conn = self.conn()?;
        Self::query_artifact(&conn, id)
    }

    fn list_artifacts(&self, router_id: Option<RouterId>) -> Result<Vec<BackupArtifact>> {
        let conn = self.conn()?;
        let artifacts = match router_id {
            Some(router_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM backup_artifacts WHERE router_id = ?1 ORDER BY created_at DESC, id DESC",
                    ARTIFACT_COLUMNS
                ))?;
                let rows = stmt.query_map(params![router_id], Self::row_to_artifact)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM backup_artifacts ORDER BY created_at DESC, id DESC",
                    ARTIFACT_COLUMNS
                ))?;
                let rows = stmt.query_map([], Self::row_to_artifact)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(artifacts)
    }

    fn list_artifacts_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<BackupArtifact>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM backup_artifacts WHERE created_at < ?1 ORDER BY created_at",
            ARTIFACT_COLUMNS
        ))?;
        let artifacts = stmt
            .query_map(
                params![Self::format_datetime(&cutoff)],
                Self::row_to_artifact,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(artifacts)
    }

    fn delete_artifact(&self, id: ArtifactId) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM backup_artifacts WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn count_artifacts(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM backup_artifacts", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn total_artifact_bytes(&self) -> Result<u64> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM backup_artifacts WHERE size_bytes > 0",
            [],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u64)
    }

    fn record_run_start(
        &self,
        router_id: RouterId,
        kind: BackupKind,
        triggered_by: &str,
    ) -> Result<RunId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO backup_runs (router_id, kind, triggered_by, started_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                router_id,
                kind.as_str(),
                triggered_by,
                Self::format_datetime(&Utc::now()),
                RunStatus::Running.as_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn record_run_finish(
        &self,
        run_id: RunId,
        status: RunStatus,
        error_kind: Option<&str>,
        error_message: Option<&str>,
        artifact_id: Option<ArtifactId>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE backup_runs SET finished_at = ?1, status = ?2, error_kind = ?3,
                 error_message = ?4, artifact_id = ?5
             WHERE id = ?6",
            params![
                Self::format_datetime(&Utc::now()),
                status.as_str(),
                error_kind,
                error_message,
                artifact_id,
                run_id,
            ],
        )?;
        Ok(())
    }

    fn list_runs(&self, router_id: RouterId, limit: usize) -> Result<Vec<BackupRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, router_id, kind, triggered_by, started_at, finished_at, status,
                    error_kind, error_message, artifact_id
             FROM backup_runs WHERE router_id = ?1
             ORDER BY started_at DESC, id DESC LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(params![router_id, limit as i64], Self::row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn mark_stale_runs_interrupted(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE backup_runs SET status = ?1, finished_at = ?2, error_message = 'Process stopped during run'
             WHERE status = ?3",
            params![
                RunStatus::Interrupted.as_str(),
                Self::format_datetime(&Utc::now()),
                RunStatus::Running.as_str(),
            ],
        )?;
        Ok(count)
    }
}

impl ScheduleStore for SqliteRouterStore {
    fn create_schedule(&self, schedule: &NewSchedule) -> Result<Schedule> {
        let conn = self.conn()?;
        let name = match &schedule.name {
            Some(name) => name.clone(),
            None => {
                let router = Self::query_router(&conn, schedule.router_id)?
                    .with_context(|| format!("Router {} not found", schedule.router_id))?;
                format!("Auto-backup {}", router.name)
            }
        };
        conn.execute(
            "INSERT INTO schedules (router_id, name, cadence, kind, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                schedule.router_id,
                name,
                schedule.cadence.trim(),
                schedule.kind.as_str(),
                schedule.enabled as i64,
                Self::format_datetime(&Utc::now()),
            ],
        )
        .with_context(|| {
            format!(
                "Failed to insert schedule for router {}",
                schedule.router_id
            )
        })?;

        let id = conn.last_insert_rowid();
        Self::query_schedule(&conn, id)?.context("Inserted schedule not found")
    }

    fn get_schedule(&self, id: ScheduleId) -> Result<Option<Schedule>> {
        let conn = self.conn()?;
        Self::query_schedule(&conn, id)
    }

    fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedules ORDER BY id",
            SCHEDULE_COLUMNS
        ))?;
        let schedules = stmt
            .query_map([], Self::row_to_schedule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(schedules)
    }

    fn list_schedules_for_router(&self, router_id: RouterId) -> Result<Vec<Schedule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedules WHERE router_id = ?1 ORDER BY id",
            SCHEDULE_COLUMNS
        ))?;
        let schedules = stmt
            .query_map(params![router_id], Self::row_to_schedule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(schedules)
    }

    fn delete_schedule(&self, id: ScheduleId) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }
}
