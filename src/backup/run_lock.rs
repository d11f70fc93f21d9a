//! Per-router run locks.
//!
//! A [`RunGuard`] is the only way to hold a lock and it releases on drop, so a
//! run that fails, times out or panics never leaves its router locked.

use crate::router_store::RouterId;
use dashmap::DashSet;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct RunLocks {
    held: Arc<DashSet<RouterId>>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for `router_id`, or returns `None` if a run is in flight.
    pub fn try_acquire(&self, router_id: RouterId) -> Option<RunGuard> {
        if self.held.insert(router_id) {
            Some(RunGuard {
                router_id,
                held: Arc::clone(&self.held),
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, router_id: RouterId) -> bool {
        self.held.contains(&router_id)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

#[must_use = "the run lock is released as soon as the guard is dropped"]
pub struct RunGuard {
    router_id: RouterId,
    held: Arc<DashSet<RouterId>>,
}

impl RunGuard {
    pub fn router_id(&self) -> RouterId {
        self.router_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.held.remove(&self.router_id);
    }
}

impl std::fmt::Debug for RunGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunGuard")
            .field("router_id", &self.router_id)
            .finish()
    }
}
