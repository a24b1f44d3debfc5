use chrono::Utc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::core::{reconcile, retention};

/// Background upkeep: scheduled deletions and quota checks on one interval,
/// storage reconciliation on a slower one.
pub struct MaintenanceLoop {
    ctx: AppContext,
}

impl MaintenanceLoop {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let cfg = &self.ctx.config.retention;
        let sweep_every = Duration::from_secs(cfg.sweep_interval_secs.max(1));
        let reconcile_every = Duration::from_secs(cfg.reconcile_interval_secs.max(1));
        info!(
            sweep_secs = sweep_every.as_secs(),
            reconcile_secs = reconcile_every.as_secs(),
            "Maintenance loop started"
        );

        let mut sweep = interval(sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconcile = interval(reconcile_every);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Maintenance loop stopped");
                    break;
                }
                _ = sweep.tick() => self.sweep().await,
                _ = reconcile.tick() => {
                    if let Err(e) = reconcile::reconcile_all(&self.ctx, cfg.dry_run).await {
                        error!(error = %format!("{:#}", e), "Reconciliation pass failed");
                    }
                }
            }
        }
    }

    /// Delete backups past their scheduled deletion, then re-check every site quota.
    pub async fn sweep(&self) {
        let now = Utc::now();
        match retention::sweep_scheduled_deletions(&self.ctx, now).await {
            Ok(report) if !report.deleted.is_empty() => info!(
                deleted = report.deleted.len(),
                freed_bytes = report.freed_bytes,
                "Scheduled deletions applied"
            ),
            Ok(_) => debug!("No scheduled deletions due"),
            Err(e) => error!(error = %format!("{:#}", e), "Scheduled deletion sweep failed"),
        }

        let sites = match self.ctx.store.list_sites().await {
            Ok(sites) => sites,
            Err(e) => {
                error!(error = %e, "Failed to load sites for quota check");
                return;
            }
        };
        for site in sites.iter().filter(|s| s.storage_quota_bytes.is_some()) {
            // Owners are notified when a backup lands, not on every sweep
            if let Err(e) = retention::check_quota(&self.ctx, site.id, now, false).await {
                warn!(site_id = site.id, error = %format!("{:#}", e), "Quota check failed");
            }
        }
    }
}
