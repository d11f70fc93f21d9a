use axum::extract::FromRef;

use crate::backup::BackupManager;
use std::sync::Arc;
use std::time::Instant;

use super::ServerConfig;

pub type GuardedBackupManager = Arc<BackupManager>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub manager: GuardedBackupManager,
}

impl ServerState {
    pub fn new(config: ServerConfig, manager: GuardedBackupManager) -> ServerState {
        ServerState {
            config,
            start_time: Instant::now(),
            manager,
        }
    }
}

impl FromRef<ServerState> for GuardedBackupManager {
    fn from_ref(input: &ServerState) -> Self {
        input.manager.clone()
    }
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}
