use super::status_cache::{Reachability, RouterStatusCache};
use crate::router_store::RouterStore;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupStats {
    pub total_routers: usize,
    pub online: usize,
    pub offline: usize,
    pub unknown: usize,
    pub total_backups: usize,
    pub total_bytes: u64,
}

/// Read-side summary over the status cache and the artifact index.
///
/// Holds no state; every call reads the current values.
pub struct StatsAggregator {
    router_store: Arc<dyn RouterStore>,
    status: Arc<RouterStatusCache>,
}

impl StatsAggregator {
    pub fn new(router_store: Arc<dyn RouterStore>, status: Arc<RouterStatusCache>) -> Self {
        Self {
            router_store,
            status,
        }
    }

    pub fn stats(&self) -> Result<BackupStats> {
        let routers = self.router_store.list_routers()?;

        // Only registered routers count; a status entry written by a run that
        // outlived its router is ignored.
        let mut online = 0;
        let mut offline = 0;
        for router in &routers {
            match self.status.get(router.id).reachability {
                Reachability::Online => online += 1,
                Reachability::Offline => offline += 1,
                Reachability::Unknown => {}
            }
        }

        Ok(BackupStats {
            total_routers: routers.len(),
            online,
            offline,
            unknown: routers.len() - online - offline,
            total_backups: self.router_store.count_artifacts()?,
            total_bytes: self.router_store.total_artifact_bytes()?,
        })
    }
}
