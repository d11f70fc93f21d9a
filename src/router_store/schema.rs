//! SQLite schema for the router registry, schedules, artifact index and run history.

use crate::sqlite_column;
use crate::sqlite_persistence::{ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1
// =============================================================================

const ROUTERS_TABLE_V1: Table = Table {
    name: "routers",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true, autoincrement = true),
        sqlite_column!("name", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!("host", &SqlType::Text, non_null = true),
        sqlite_column!("port", &SqlType::Integer, non_null = true),
        sqlite_column!("username", &SqlType::Text, non_null = true),
        sqlite_column!("password", &SqlType::Text, non_null = true),
        sqlite_column!("use_ssl", &SqlType::Integer, non_null = true),
        sqlite_column!("enabled", &SqlType::Integer, non_null = true),
        sqlite_column!("notes", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
        sqlite_column!("updated_at", &SqlType::Text, non_null = true),
    ],
    indices: &[],
};

const SCHEDULE_ROUTER_FK: ForeignKey = ForeignKey {
    foreign_table: "routers",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Cascade,
};

const SCHEDULES_TABLE_V1: Table = Table {
    name: "schedules",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true, autoincrement = true),
        sqlite_column!(
            "router_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&SCHEDULE_ROUTER_FK)
        ),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("cadence", &SqlType::Text, non_null = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("enabled", &SqlType::Integer, non_null = true),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_schedules_router_id", "router_id")],
};

/// No foreign key on purpose: artifacts outlive the router they came from.
const BACKUP_ARTIFACTS_TABLE_V1: Table = Table {
    name: "backup_artifacts",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true, autoincrement = true),
        sqlite_column!("router_id", &SqlType::Integer, non_null = true),
        sqlite_column!("router_name", &SqlType::Text, non_null = true),
        sqlite_column!("filename", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!("size_bytes", &SqlType::Integer, non_null = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_backup_artifacts_router_id", "router_id"),
        ("idx_backup_artifacts_created_at", "created_at"),
    ],
};

const BACKUP_RUNS_TABLE_V1: Table = Table {
    name: "backup_runs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true, autoincrement = true),
        sqlite_column!("router_id", &SqlType::Integer, non_null = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("triggered_by", &SqlType::Text, non_null = true),
        sqlite_column!("started_at", &SqlType::Text, non_null = true),
        sqlite_column!("finished_at", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("error_kind", &SqlType::Text),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("artifact_id", &SqlType::Integer),
    ],
    indices: &[
        ("idx_backup_runs_router_started", "router_id, started_at DESC"),
        ("idx_backup_runs_status", "status"),
    ],
};

pub const ROUTER_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[
        ROUTERS_TABLE_V1,
        SCHEDULES_TABLE_V1,
        BACKUP_ARTIFACTS_TABLE_V1,
        BACKUP_RUNS_TABLE_V1,
    ],
    migration: None,
}];
