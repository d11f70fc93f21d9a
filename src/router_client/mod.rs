//! Router client adapter: connect, probe, export and close.
//!
//! The backup engine only sees the [`RouterClient`] and [`RouterSession`]
//! traits. [`ApiRouterClient`] speaks the RouterOS API protocol; tests use
//! in-process fakes.

mod api_client;
mod protocol;

pub use api_client::ApiRouterClient;
pub use protocol::{decode_length, encode_length, read_sentence, write_sentence, Reply, ReplyKind};

use crate::router_store::{BackupKind, RouterConnectParams};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Grace period for `/quit` before a session is dropped outright.
pub const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Router did not answer in time")]
    Timeout,
    #[error("Export failed: {0}")]
    ExportFailed(String),
}

/// What a router reports about itself. Only the identity is mandatory; the
/// rest is missing on devices that trap on the command (no routerboard on CHR).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub identity: String,
    pub version: Option<String>,
    pub uptime: Option<String>,
    pub cpu_load: Option<String>,
    pub free_memory: Option<String>,
    pub total_memory: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
}

/// Opens sessions to routers.
#[async_trait]
pub trait RouterClient: Send + Sync {
    /// Connects and authenticates. No export is requested.
    async fn connect(
        &self,
        params: &RouterConnectParams,
    ) -> Result<Box<dyn RouterSession>, ClientError>;
}

/// An authenticated connection to one router.
///
/// Callers must call [`close`](RouterSession::close) on every exit path, also
/// after an `export` future was dropped on timeout.
#[async_trait]
pub trait RouterSession: Send {
    /// Router identity, as a cheap liveness probe.
    async fn identity(&mut self) -> Result<String, ClientError>;

    /// Identity plus resource and routerboard details.
    async fn system_info(&mut self) -> Result<SystemInfo, ClientError>;

    /// Asks the router for a backup of the given kind and returns its bytes.
    async fn export(&mut self, kind: BackupKind) -> Result<Vec<u8>, ClientError>;

    async fn close(&mut self);
}

/// Closes a session, giving it [`SESSION_CLOSE_TIMEOUT`] to finish. The
/// session is dropped afterwards in any case, which closes the socket.
pub async fn close_session(mut session: Box<dyn RouterSession>) {
    if tokio::time::timeout(SESSION_CLOSE_TIMEOUT, session.close())
        .await
        .is_err()
    {
        warn!(
            "Router session did not close within {:?}, dropping it",
            SESSION_CLOSE_TIMEOUT
        );
    }
}
