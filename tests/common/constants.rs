//! Shared test constants

#![allow(dead_code)]

pub const ROUTER_USER: &str = "backup";
pub const ROUTER_PASS: &str = "s3cret";
pub const ROUTER_IDENTITY: &str = "core-rtr-01";

pub const REQUEST_TIMEOUT_SECS: u64 = 10;
pub const SERVER_READY_TIMEOUT_MS: u64 = 5000;
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 20;

/// Backup budget used by the test server; kept short so timeout tests finish fast.
pub const BACKUP_TIMEOUT_SECS: u64 = 2;
pub const CONNECT_TIMEOUT_SECS: u64 = 2;
