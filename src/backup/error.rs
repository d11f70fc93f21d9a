use crate::router_client::ClientError;
use crate::router_store::RouterId;
use thiserror::Error;

/// Why a backup run did not produce an artifact.
///
/// None of these are fatal to the process; scheduled runs simply try again at
/// the next due occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackupError {
    #[error("Could not connect to router: {0}")]
    ConnectionFailed(String),
    #[error("Router rejected the credentials: {0}")]
    AuthenticationFailed(String),
    #[error("Router did not complete the backup within the configured timeout")]
    ExportTimeout,
    #[error("Router export failed: {0}")]
    ExportFailed(String),
    #[error("Could not store backup: {0}")]
    StorageFailed(String),
    #[error("A backup for router {0} is already running")]
    AlreadyRunning(RouterId),
    #[error("Router {0} not found")]
    RouterNotFound(RouterId),
    #[error("Router {0} is disabled")]
    RouterDisabled(RouterId),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackupError {
    /// Stable identifier used in run history, metrics and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::ConnectionFailed(_) => "connection_failed",
            BackupError::AuthenticationFailed(_) => "authentication_failed",
            BackupError::ExportTimeout => "export_timeout",
            BackupError::ExportFailed(_) => "export_failed",
            BackupError::StorageFailed(_) => "storage_failed",
            BackupError::AlreadyRunning(_) => "already_running",
            BackupError::RouterNotFound(_) => "router_not_found",
            BackupError::RouterDisabled(_) => "router_disabled",
            BackupError::Internal(_) => "internal",
        }
    }

    /// Failures that say something about the router being reachable.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            BackupError::ConnectionFailed(_) | BackupError::AuthenticationFailed(_)
        )
    }
}

impl From<ClientError> for BackupError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::ConnectionFailed(msg) => BackupError::ConnectionFailed(msg),
            ClientError::AuthenticationFailed(msg) => BackupError::AuthenticationFailed(msg),
            ClientError::Timeout => BackupError::ExportTimeout,
            ClientError::ExportFailed(msg) => BackupError::ExportFailed(msg),
        }
    }
}
