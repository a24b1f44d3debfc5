//! Periodic control loop that turns due site schedules into queued jobs.
//!
//! Each tick reads committed state from the store, so a site marked running or
//! rescheduled by one tick is never picked up twice.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::core::dispatcher;
use crate::core::schedule::{Schedule, ScheduleError, calculate_next_run, parse_timezone};
use crate::db::models::{Node, Reschedule, Site};

/// Outcome of one scheduler tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Sites that got a first `next_run_at`
    pub scheduled: usize,
    /// Sites whose jobs were queued this tick
    pub dispatched: Vec<i64>,
    /// Due sites left for a later tick (node at capacity or site already running)
    pub deferred: usize,
    /// Due sites with an unusable schedule or missing node
    pub invalid: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.scheduled == 0 && self.dispatched.is_empty() && self.deferred == 0 && self.invalid == 0
    }
}

/// Next UTC run of `site`, evaluated in the node's timezone.
pub fn next_run_for(
    site: &Site,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let schedule = Schedule::parse(
        &site.schedule_frequency,
        &site.schedule_time,
        site.schedule_days.as_deref(),
    )?;
    if schedule.is_fallback() {
        warn!(
            site_id = site.id,
            frequency = %site.schedule_frequency,
            days = site.schedule_days.as_deref().unwrap_or(""),
            "Schedule days are invalid, using the default selection"
        );
    }
    let tz = parse_timezone(timezone)?;
    Ok(calculate_next_run(&schedule, now.with_timezone(&tz)))
}

pub struct Scheduler {
    ctx: AppContext,
}

impl Scheduler {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Tick until `shutdown` fires. A failed tick is logged and the next one runs as usual.
    pub async fn run(&self, shutdown: CancellationToken) {
        let period = self.ctx.config.scheduler.tick_interval();
        info!(interval_secs = period.as_secs(), "Scheduler started");

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if !report.is_idle() => info!(
                            scheduled = report.scheduled,
                            dispatched = report.dispatched.len(),
                            deferred = report.deferred,
                            invalid = report.invalid,
                            active_jobs = self.ctx.progress.active_count(),
                            "Scheduler tick"
                        ),
                        Ok(_) => debug!(active_jobs = self.ctx.progress.active_count(), "Scheduler tick idle"),
                        Err(e) => error!(error = %format!("{:#}", e), "Scheduler tick failed"),
                    }
                }
            }
        }
    }

    /// One pass over due sites.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let store = &self.ctx.store;
        let mut report = TickReport {
            scheduled: self.schedule_new_sites(now).await?,
            ..Default::default()
        };

        let due = store.due_sites(now).await.context("Failed to load due sites")?;
        if due.is_empty() {
            return Ok(report);
        }

        let mut running = store
            .running_counts_by_node()
            .await
            .context("Failed to count running backups")?;
        let mut nodes: HashMap<i64, Node> = HashMap::new();

        for site in due {
            if site.is_running() {
                debug!(site_id = site.id, "Site already running, deferring");
                report.deferred += 1;
                continue;
            }

            if !nodes.contains_key(&site.node_id) {
                match store.get_node(site.node_id).await? {
                    Some(node) => {
                        nodes.insert(node.id, node);
                    }
                    None => {
                        warn!(site_id = site.id, node_id = site.node_id, "Site belongs to an unknown node");
                        report.invalid += 1;
                        continue;
                    }
                }
            }
            let Some(node) = nodes.get(&site.node_id) else {
                continue;
            };

            let active = running.get(&node.id).copied().unwrap_or(0);
            if active >= node.max_concurrent_backups {
                debug!(
                    site_id = site.id,
                    node_id = node.id,
                    active,
                    limit = node.max_concurrent_backups,
                    "Node at capacity, deferring"
                );
                report.deferred += 1;
                continue;
            }

            let next = match next_run_for(&site, &node.timezone, now) {
                Ok(next) => next,
                Err(e) => {
                    warn!(site_id = site.id, error = %e, "Invalid schedule, skipping site");
                    report.invalid += 1;
                    continue;
                }
            };

            // The next run is persisted together with the running claim
            let priority = self.ctx.config.scheduler.scheduled_priority;
            let queued = dispatcher::enqueue_site(
                &self.ctx,
                &site,
                priority,
                "Scheduled backup queued",
                Reschedule::To(next),
            )
            .await?;
            match queued {
                Some(job) => {
                    *running.entry(node.id).or_insert(0) += 1;
                    info!(
                        site_id = site.id,
                        node_id = node.id,
                        job_id = %job.id,
                        next_run_at = ?next,
                        "Scheduled backup dispatched"
                    );
                    report.dispatched.push(site.id);
                }
                None => report.deferred += 1,
            }
        }

        Ok(report)
    }

    /// Compute a first `next_run_at` for sites that have none yet.
    async fn schedule_new_sites(&self, now: DateTime<Utc>) -> Result<usize> {
        let store = &self.ctx.store;
        let sites = store
            .unscheduled_sites()
            .await
            .context("Failed to load unscheduled sites")?;

        let mut timezones: HashMap<i64, String> = HashMap::new();
        let mut scheduled = 0;
        for site in sites {
            if !timezones.contains_key(&site.node_id) {
                let tz = match store.get_node(site.node_id).await? {
                    Some(node) => node.timezone,
                    None => continue,
                };
                timezones.insert(site.node_id, tz);
            }
            let tz = timezones.get(&site.node_id).map(String::as_str).unwrap_or("UTC");

            match next_run_for(&site, tz, now) {
                Ok(Some(next)) => {
                    store.set_next_run_at(site.id, Some(next)).await?;
                    debug!(site_id = site.id, next_run_at = %next, "Site scheduled");
                    scheduled += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(site_id = site.id, error = %e, "Invalid schedule, not scheduling site"),
            }
        }
        Ok(scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::models::{BackupRecord, NewBackupRecord, SiteBackupStatus, StorageProvider};
    use crate::db::{BackupStore, SqliteStore};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn setup(max_concurrent: u32) -> (AppContext, SqliteStore, i64) {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let node_id = store.insert_node(Node::new("edge", max_concurrent)).await.unwrap();
        let ctx = AppContext::new(AppConfig::default(), Arc::new(store.clone()));
        (ctx, store, node_id)
    }

    fn daily_site(node_id: i64, name: &str, next: DateTime<Utc>) -> Site {
        let mut site = Site::new(node_id, name);
        site.schedule_frequency = "daily".to_string();
        site.schedule_time = "23:00".to_string();
        site.next_run_at = Some(next);
        site
    }

    #[test]
    fn test_next_run_uses_node_timezone() {
        let site = {
            let mut s = Site::new(1, "s");
            s.schedule_frequency = "daily".to_string();
            s.schedule_time = "02:00".to_string();
            s
        };
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let next = next_run_for(&site, "Australia/Sydney", now).unwrap().unwrap();
        // 02:00 AEST on June 2nd
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 16, 0, 0).unwrap());
        assert!(matches!(
            next_run_for(&site, "Mars/Olympus", now),
            Err(ScheduleError::UnknownTimezone(_))
        ));
    }

    #[tokio::test]
    async fn test_tick_respects_node_ceiling() {
        let (ctx, store, node_id) = setup(1).await;
        let now = Utc::now();
        let first = store
            .insert_site(daily_site(node_id, "one", now - Duration::minutes(5)))
            .await
            .unwrap();
        let second = store
            .insert_site(daily_site(node_id, "two", now - Duration::minutes(1)))
            .await
            .unwrap();

        let scheduler = Scheduler::new(ctx.clone());
        let report = scheduler.tick(now).await.unwrap();

        assert_eq!(report.dispatched.len(), 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(ctx.queue.pending_count(), 1);

        let counts = store.running_counts_by_node().await.unwrap();
        assert_eq!(counts.get(&node_id).copied(), Some(1));

        // The deferred site keeps its due instant; the dispatched one moves forward
        let dispatched = report.dispatched[0];
        let deferred = if dispatched == first { second } else { first };
        let dispatched = store.get_site(dispatched).await.unwrap().unwrap();
        let deferred = store.get_site(deferred).await.unwrap().unwrap();
        assert!(dispatched.next_run_at.unwrap() > now);
        assert!(deferred.next_run_at.unwrap() <= now);
    }

    #[tokio::test]
    async fn test_no_double_dispatch_on_next_tick() {
        let (ctx, store, node_id) = setup(4).await;
        let now = Utc::now();
        store
            .insert_site(daily_site(node_id, "one", now - Duration::minutes(1)))
            .await
            .unwrap();

        let scheduler = Scheduler::new(ctx.clone());
        assert_eq!(scheduler.tick(now).await.unwrap().dispatched.len(), 1);
        let again = scheduler.tick(now + Duration::seconds(60)).await.unwrap();
        assert!(again.dispatched.is_empty());
        assert_eq!(ctx.queue.list_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_schedule_is_skipped_without_rescheduling() {
        let (ctx, store, node_id) = setup(4).await;
        let now = Utc::now();
        let mut site = daily_site(node_id, "broken", now - Duration::minutes(1));
        site.schedule_time = "25:99".to_string();
        let site_id = store.insert_site(site).await.unwrap();

        let report = Scheduler::new(ctx.clone()).tick(now).await.unwrap();
        assert_eq!(report.invalid, 1);
        assert!(report.dispatched.is_empty());

        let site = store.get_site(site_id).await.unwrap().unwrap();
        assert!(!site.is_running());
        assert!(site.next_run_at.unwrap() <= now);
    }

    /// SQLite store whose first `due_sites` call fails.
    struct FlakyStore {
        inner: SqliteStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl BackupStore for FlakyStore {
        async fn due_sites(&self, now: DateTime<Utc>) -> Result<Vec<Site>> {
            if self.failures.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("database is locked");
            }
            self.inner.due_sites(now).await
        }
        async fn unscheduled_sites(&self) -> Result<Vec<Site>> {
            self.inner.unscheduled_sites().await
        }
        async fn get_site(&self, site_id: i64) -> Result<Option<Site>> {
            self.inner.get_site(site_id).await
        }
        async fn list_sites(&self) -> Result<Vec<Site>> {
            self.inner.list_sites().await
        }
        async fn sites_for_node(&self, node_id: i64) -> Result<Vec<Site>> {
            self.inner.sites_for_node(node_id).await
        }
        async fn get_node(&self, node_id: i64) -> Result<Option<Node>> {
            self.inner.get_node(node_id).await
        }
        async fn list_nodes(&self) -> Result<Vec<Node>> {
            self.inner.list_nodes().await
        }
        async fn get_provider(&self, provider_id: i64) -> Result<Option<StorageProvider>> {
            self.inner.get_provider(provider_id).await
        }
        async fn running_counts_by_node(&self) -> Result<HashMap<i64, u32>> {
            self.inner.running_counts_by_node().await
        }
        async fn try_mark_site_running(
            &self,
            site_id: i64,
            job_id: &str,
            message: &str,
            reschedule: Reschedule,
        ) -> Result<bool> {
            self.inner
                .try_mark_site_running(site_id, job_id, message, reschedule)
                .await
        }
        async fn set_next_run_at(&self, site_id: i64, next: Option<DateTime<Utc>>) -> Result<()> {
            self.inner.set_next_run_at(site_id, next).await
        }
        async fn update_site_progress(
            &self,
            site_id: i64,
            job_id: &str,
            progress: u8,
            message: &str,
        ) -> Result<()> {
            self.inner
                .update_site_progress(site_id, job_id, progress, message)
                .await
        }
        async fn finish_site_backup(
            &self,
            site_id: i64,
            job_id: &str,
            status: SiteBackupStatus,
            message: &str,
            error: Option<&str>,
            finished_at: DateTime<Utc>,
        ) -> Result<bool> {
            self.inner
                .finish_site_backup(site_id, job_id, status, message, error, finished_at)
                .await
        }
        async fn insert_backup(&self, record: NewBackupRecord) -> Result<i64> {
            self.inner.insert_backup(record).await
        }
        async fn successful_backups(&self, site_id: i64) -> Result<Vec<BackupRecord>> {
            self.inner.successful_backups(site_id).await
        }
        async fn backups_due_for_deletion(&self, now: DateTime<Utc>) -> Result<Vec<BackupRecord>> {
            self.inner.backups_due_for_deletion(now).await
        }
        async fn schedule_backup_deletion(&self, backup_id: i64, at: DateTime<Utc>) -> Result<()> {
            self.inner.schedule_backup_deletion(backup_id, at).await
        }
        async fn delete_backup(&self, backup_id: i64) -> Result<()> {
            self.inner.delete_backup(backup_id).await
        }
        async fn adjust_usage(
            &self,
            site_id: i64,
            node_id: i64,
            provider_id: Option<i64>,
            delta: i64,
        ) -> Result<()> {
            self.inner.adjust_usage(site_id, node_id, provider_id, delta).await
        }
        async fn set_site_usage(&self, site_id: i64, bytes: u64) -> Result<()> {
            self.inner.set_site_usage(site_id, bytes).await
        }
        async fn set_node_usage(&self, node_id: i64, bytes: u64) -> Result<()> {
            self.inner.set_node_usage(node_id, bytes).await
        }
        async fn set_over_quota(&self, site_id: i64, since: Option<DateTime<Utc>>) -> Result<()> {
            self.inner.set_over_quota(site_id, since).await
        }
        async fn release_running_sites(&self, error: &str) -> Result<usize> {
            self.inner.release_running_sites(error).await
        }
    }

    #[tokio::test]
    async fn test_loop_survives_failed_tick() {
        let inner = SqliteStore::open_in_memory().await.unwrap();
        let node_id = inner.insert_node(Node::new("edge", 2)).await.unwrap();
        let site_id = inner
            .insert_site(daily_site(node_id, "one", Utc::now() - Duration::minutes(1)))
            .await
            .unwrap();
        let store = Arc::new(FlakyStore {
            inner: inner.clone(),
            failures: AtomicUsize::new(0),
        });

        let mut config = AppConfig::default();
        config.scheduler.tick_interval_secs = 1;
        let ctx = AppContext::new(config, store.clone());

        let scheduler = Arc::new(Scheduler::new(ctx.clone()));
        let shutdown = CancellationToken::new();
        let handle = {
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        let dispatched = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            while ctx.queue.pending_count() == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        })
        .await;

        shutdown.cancel();
        handle.await.unwrap();

        assert!(dispatched.is_ok(), "no tick dispatched after the failure");
        assert!(store.failures.load(Ordering::SeqCst) >= 2);
        let site = inner.get_site(site_id).await.unwrap().unwrap();
        assert!(site.is_running());
    }

    #[tokio::test]
    async fn test_unscheduled_sites_get_first_run() {
        let (ctx, store, node_id) = setup(1).await;
        let mut site = Site::new(node_id, "fresh");
        site.schedule_frequency = "weekly".to_string();
        site.schedule_days = Some("0,3".to_string());
        let site_id = store.insert_site(site).await.unwrap();
        let manual_id = store.insert_site(Site::new(node_id, "manual")).await.unwrap();

        let now = Utc::now();
        let report = Scheduler::new(ctx).tick(now).await.unwrap();
        assert_eq!(report.scheduled, 1);
        assert!(report.dispatched.is_empty());

        let site = store.get_site(site_id).await.unwrap().unwrap();
        assert!(site.next_run_at.unwrap() > now);
        let manual = store.get_site(manual_id).await.unwrap().unwrap();
        assert!(manual.next_run_at.is_none());
    }
}
