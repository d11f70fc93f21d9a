//! MikroTik Backup Server Library
//!
//! Schedules and executes backups of MikroTik routers over the RouterOS API.
//! This library exposes the internal modules for the server binary and tests.

pub mod backup;
pub mod cadence;
pub mod config;
pub mod router_client;
pub mod router_store;
pub mod server;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use backup::{BackupManager, BackupScheduler};
pub use router_store::{RouterStore, ScheduleStore, SqliteRouterStore};
pub use server::{make_app, run_server, RequestsLoggingLevel};
