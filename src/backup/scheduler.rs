use super::executor::{BackupExecutor, BackupTarget, Trigger};
use super::run_lock::RunLocks;
use crate::cadence::{CadenceExpr, ScheduleTimezone};
use crate::router_store::{Router, RouterId, RouterStore, Schedule, ScheduleId, ScheduleStore};
use crate::server::metrics;
use chrono::{DateTime, TimeZone, Timelike, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of evaluating all schedules at one tick.
#[derive(Debug, Default)]
pub struct TickReport {
    /// The minute had already been evaluated; nothing was done.
    pub already_evaluated: bool,
    pub due: usize,
    pub dispatched: Vec<(ScheduleId, RouterId)>,
    pub skipped_running: usize,
    pub skipped_disabled: usize,
    pub invalid: usize,
    /// Handles of the spawned runs. The tick loop detaches them.
    pub handles: Vec<JoinHandle<()>>,
}

/// Evaluates schedules once per tick and hands due ones to the executor.
pub struct BackupScheduler {
    router_store: Arc<dyn RouterStore>,
    schedule_store: Arc<dyn ScheduleStore>,
    executor: Arc<BackupExecutor>,
    locks: RunLocks,
    tick_interval: Duration,
    timezone: ScheduleTimezone,

    /// Minute of the most recent evaluation, so a minute is never evaluated twice.
    last_evaluated: Mutex<Option<DateTime<Utc>>>,

    /// Malformed (schedule, expression) pairs already reported.
    reported_invalid: Mutex<HashSet<(ScheduleId, String)>>,
}

impl BackupScheduler {
    pub fn new(
        router_store: Arc<dyn RouterStore>,
        schedule_store: Arc<dyn ScheduleStore>,
        executor: Arc<BackupExecutor>,
        locks: RunLocks,
        tick_interval: Duration,
        timezone: ScheduleTimezone,
    ) -> Self {
        Self {
            router_store,
            schedule_store,
            executor,
            locks,
            tick_interval,
            timezone,
            last_evaluated: Mutex::new(None),
            reported_invalid: Mutex::new(HashSet::new()),
        }
    }

    /// Main scheduler loop. Runs until `shutdown_token` is cancelled; in-flight
    /// backups are not waited for.
    pub async fn run(self: Arc<Self>, shutdown_token: CancellationToken) {
        info!(
            "Starting backup scheduler (tick every {:?}, {} time)",
            self.tick_interval,
            self.timezone.as_str()
        );

        match self.router_store.mark_stale_runs_interrupted() {
            Ok(count) if count > 0 => {
                info!("Marked {} backup runs from a previous process as interrupted", count);
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to mark stale backup runs: {:#}", e);
            }
        }

        loop {
            let (boundary, wait) = next_tick(Utc::now(), self.tick_interval);
            debug!("Scheduler sleeping {:?} until {}", wait, boundary);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    // Sleeping never ends early, but the wall clock may lag the
                    // monotonic one slightly.
                    let now = Utc::now().max(boundary);
                    let report = self.tick(now);
                    if report.due > 0 {
                        info!(
                            "Tick {}: {} due, {} dispatched, {} skipped (running), {} skipped (disabled)",
                            now.format("%Y-%m-%dT%H:%M"),
                            report.due,
                            report.dispatched.len(),
                            report.skipped_running,
                            report.skipped_disabled
                        );
                    }
                }
                _ = shutdown_token.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
            }
        }

        info!("Backup scheduler stopped");
    }

    /// Evaluates every schedule against `now` truncated to the minute and
    /// dispatches the due ones. Never blocks on network I/O.
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let minute = truncate_to_minute(now);

        {
            let mut last = self
                .last_evaluated
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if matches!(*last, Some(previous) if previous >= minute) {
                report.already_evaluated = true;
                return report;
            }
            *last = Some(minute);
        }
        metrics::record_scheduler_tick();

        let schedules = match self.schedule_store.list_schedules() {
            Ok(schedules) => schedules,
            Err(e) => {
                error!("Failed to load schedules: {:#}", e);
                return report;
            }
        };
        if schedules.is_empty() {
            return report;
        }

        let routers: HashMap<RouterId, Router> = match self.router_store.list_routers() {
            Ok(routers) => routers.into_iter().map(|r| (r.id, r)).collect(),
            Err(e) => {
                error!("Failed to load routers: {:#}", e);
                return report;
            }
        };

        for schedule in &schedules {
            if !schedule.enabled {
                continue;
            }

            let expr = match CadenceExpr::parse(&schedule.cadence) {
                Ok(expr) => expr,
                Err(e) => {
                    self.report_invalid(schedule, &e.to_string());
                    report.invalid += 1;
                    continue;
                }
            };
            if !self.timezone.is_due(&expr, minute) {
                continue;
            }
            report.due += 1;

            let Some(router) = routers.get(&schedule.router_id) else {
                warn!(
                    "Schedule {} references missing router {}",
                    schedule.id, schedule.router_id
                );
                continue;
            };
            if !router.enabled {
                debug!(
                    "Skipping schedule {}: router {} is disabled",
                    schedule.id, router.name
                );
                metrics::record_skipped_occurrence("router_disabled");
                report.skipped_disabled += 1;
                continue;
            }

            let Some(guard) = self.locks.try_acquire(router.id) else {
                debug!(
                    "Skipping schedule {}: a backup of router {} is still running",
                    schedule.id, router.name
                );
                metrics::record_skipped_occurrence("already_running");
                report.skipped_running += 1;
                continue;
            };

            let executor = Arc::clone(&self.executor);
            let target = BackupTarget::from(router);
            let kind = schedule.kind;
            let trigger = Trigger::Schedule(schedule.id);
            let handle = tokio::spawn(async move {
                // Failures are logged and recorded by the executor.
                let _ = executor.run(guard, target, kind, trigger).await;
            });

            report.dispatched.push((schedule.id, router.id));
            report.handles.push(handle);
        }

        report
    }

    fn report_invalid(&self, schedule: &Schedule, reason: &str) {
        let key = (schedule.id, schedule.cadence.clone());
        let first_time = self
            .reported_invalid
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key);
        if first_time {
            warn!(
                "Schedule {} ({}) has a malformed cadence '{}': {}. It will not run until fixed.",
                schedule.id, schedule.name, schedule.cadence, reason
            );
            metrics::record_invalid_cadence();
        }
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// Next multiple of `interval` since the epoch, and how long until then.
fn next_tick(now: DateTime<Utc>, interval: Duration) -> (DateTime<Utc>, Duration) {
    let step = interval.as_secs().max(1) as i64;
    let next = (now.timestamp().div_euclid(step) + 1) * step;
    let boundary = Utc.timestamp_opt(next, 0).single().unwrap_or(now);
    let wait = (boundary - now).to_std().unwrap_or(Duration::ZERO);
    (boundary, wait)
}
