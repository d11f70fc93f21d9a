//! Process-wide, in-memory router status.
//!
//! Starts empty and is filled by backup runs and connection tests. Entries are
//! keyed by router id and written one key at a time, so routers never contend
//! with each other. Nothing here is persisted: after a restart every router
//! reads as [`Reachability::Unknown`] until it is checked again.
//!
//! Router ids are never reused, so a removed id stays removed: late writes from
//! a run that outlived its router are dropped.

use crate::router_store::RouterId;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl Reachability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reachability::Online => "online",
            Reachability::Offline => "offline",
            Reachability::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStatus {
    pub reachability: Reachability,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct RouterStatusCache {
    entries: DashMap<RouterId, RouterStatus>,
    removed: DashSet<RouterId>,
}

impl RouterStatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status for one router; routers never checked read as unknown.
    pub fn get(&self, router_id: RouterId) -> RouterStatus {
        self.entries
            .get(&router_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<RouterId, RouterStatus> {
        self.entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Records a reachability check outcome, keeping the last backup time.
    pub fn mark_checked(&self, router_id: RouterId, reachability: Reachability, at: DateTime<Utc>) {
        self.update(router_id, |status| {
            status.reachability = reachability;
            status.last_checked_at = Some(at);
        });
    }

    /// Records a backup that has been durably written.
    pub fn mark_backup_succeeded(&self, router_id: RouterId, at: DateTime<Utc>) {
        self.update(router_id, |status| {
            status.reachability = Reachability::Online;
            status.last_checked_at = Some(at);
            status.last_backup_at = Some(at);
        });
    }

    fn update(&self, router_id: RouterId, apply: impl FnOnce(&mut RouterStatus)) {
        // The shard lock is held while checking `removed`, so a concurrent
        // `remove` either sees this write and deletes it or is seen here.
        let entry = self.entries.entry(router_id);
        if self.removed.contains(&router_id) {
            return;
        }
        let mut status = entry.or_default();
        apply(&mut status);
    }

    /// Drops the entry and ignores any later write for this router.
    pub fn remove(&self, router_id: RouterId) {
        self.removed.insert(router_id);
        self.entries.remove(&router_id);
    }


    pub fn count_by_reachability(&self, reachability: Reachability) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().reachability == reachability)
            .count()
    }
}
