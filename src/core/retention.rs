//! Retention caps, quota checks and the scheduled-deletion sweep.
//!
//! Every deletion follows the same path: best-effort remote delete, usage counters
//! decremented (floored at zero), over-quota marker cleared once the site is back
//! under its quota, then the record removed.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::core::notifications::deliver;
use crate::core::storage::ObjectStore;
use crate::db::models::{BackupRecord, Site};

/// Backups removed by one enforcement pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeletionReport {
    pub deleted: Vec<i64>,
    pub freed_bytes: u64,
}

impl DeletionReport {
    fn merge(&mut self, other: DeletionReport) {
        self.deleted.extend(other.deleted);
        self.freed_bytes += other.freed_bytes;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaStatus {
    Unlimited,
    WithinQuota,
    /// Usage at or above the warning threshold but not over the quota
    Warning,
    /// Over quota; the oldest backups are scheduled for deletion
    Exceeded,
}

/// Effective number of successful backups kept for a site.
///
/// The smallest of the site setting, the node maximum and `default_copies`, never below 1.
/// Unset values count as `default_copies`.
pub fn effective_cap(site_copies: Option<u32>, node_max: Option<u32>, default_copies: u32) -> u32 {
    site_copies
        .unwrap_or(default_copies)
        .min(node_max.unwrap_or(default_copies))
        .min(default_copies)
        .max(1)
}

/// Delete the oldest successful backups of a site beyond its retention cap.
pub async fn enforce_retention(ctx: &AppContext, site_id: i64) -> Result<DeletionReport> {
    let site = load_site(ctx, site_id).await?;
    let node = ctx
        .store
        .get_node(site.node_id)
        .await?
        .ok_or_else(|| anyhow!("Node {} not found", site.node_id))?;

    let cap = effective_cap(
        site.retention_copies,
        node.max_retention_copies,
        ctx.config.retention.default_copies,
    ) as usize;

    let backups = ctx.store.successful_backups(site_id).await?;
    if backups.len() <= cap {
        debug!(site_id, backups = backups.len(), cap, "Retention within cap");
        return Ok(DeletionReport::default());
    }

    let excess = backups.len() - cap;
    info!(site_id, backups = backups.len(), cap, excess, "Enforcing retention");

    remove_backups(ctx, site, &backups[..excess]).await
}

/// Delete every backup whose scheduled deletion time has passed.
pub async fn sweep_scheduled_deletions(ctx: &AppContext, now: DateTime<Utc>) -> Result<DeletionReport> {
    let due = ctx
        .store
        .backups_due_for_deletion(now)
        .await
        .context("Failed to load backups due for deletion")?;

    let mut by_site: HashMap<i64, Vec<BackupRecord>> = HashMap::new();
    for backup in due {
        by_site.entry(backup.site_id).or_default().push(backup);
    }

    let mut report = DeletionReport::default();
    for (site_id, backups) in by_site {
        let site = match load_site(ctx, site_id).await {
            Ok(site) => site,
            Err(e) => {
                warn!(site_id, error = %e, "Skipping scheduled deletions");
                continue;
            }
        };
        info!(site_id, count = backups.len(), "Deleting backups past their scheduled deletion");
        report.merge(remove_backups(ctx, site, &backups).await?);
    }
    Ok(report)
}

/// Compare a site's usage against its quota.
///
/// Past the warning threshold the owner is told (when `notify` is set). Over quota
/// the site is marked and the oldest backups that bring it back under are scheduled
/// for deletion after the grace period. The newest backup is never scheduled.
pub async fn check_quota(
    ctx: &AppContext,
    site_id: i64,
    now: DateTime<Utc>,
    notify: bool,
) -> Result<QuotaStatus> {
    let site = load_site(ctx, site_id).await?;
    let Some(quota) = site.storage_quota_bytes.filter(|q| *q > 0) else {
        return Ok(QuotaStatus::Unlimited);
    };

    let used = site.storage_used_bytes;
    let percent = used.saturating_mul(100) / quota;
    let recipient = site.owner_email.clone().unwrap_or_default();

    if used <= quota {
        if site.over_quota_since.is_some() {
            ctx.store.set_over_quota(site.id, None).await?;
            info!(site_id, used, quota, "Site back under quota");
        }
        if percent < u64::from(ctx.config.retention.quota_warning_percent) {
            return Ok(QuotaStatus::WithinQuota);
        }
        if notify {
            deliver(
                ctx.notifier.as_ref(),
                &recipient,
                &format!("Storage quota warning: {}", site.name),
                &format!(
                    "{} is using {}% of its storage quota ({} of {} bytes)",
                    site.name, percent, used, quota
                ),
            )
            .await;
        }
        return Ok(QuotaStatus::Warning);
    }

    if site.over_quota_since.is_none() {
        ctx.store.set_over_quota(site.id, Some(now)).await?;
    }

    let grace = Duration::days(ctx.config.retention.deletion_grace_days.max(0));
    let deletion_at = now + grace;

    let backups = ctx.store.successful_backups(site.id).await?;
    let mut remaining = used;
    let mut scheduled = 0;
    // Oldest first; keep the newest
    for backup in backups.iter().take(backups.len().saturating_sub(1)) {
        if remaining <= quota {
            break;
        }
        remaining = remaining.saturating_sub(backup.size_bytes);
        if backup.scheduled_deletion.is_none() {
            ctx.store.schedule_backup_deletion(backup.id, deletion_at).await?;
            scheduled += 1;
        }
    }

    warn!(site_id, used, quota, scheduled, deletion_at = %deletion_at, "Site over storage quota");

    if notify && scheduled > 0 {
        deliver(
            ctx.notifier.as_ref(),
            &recipient,
            &format!("Storage quota exceeded: {}", site.name),
            &format!(
                "{} uses {} of {} bytes. {} old backup(s) will be deleted on {} unless usage drops.",
                site.name,
                used,
                quota,
                scheduled,
                deletion_at.format("%Y-%m-%d %H:%M UTC")
            ),
        )
        .await;
    }

    Ok(QuotaStatus::Exceeded)
}

async fn load_site(ctx: &AppContext, site_id: i64) -> Result<Site> {
    ctx.store
        .get_site(site_id)
        .await?
        .ok_or_else(|| anyhow!("Site {} not found", site_id))
}

async fn remove_backups(ctx: &AppContext, mut site: Site, backups: &[BackupRecord]) -> Result<DeletionReport> {
    let mut stores: HashMap<i64, Option<Arc<dyn ObjectStore>>> = HashMap::new();
    let mut report = DeletionReport::default();

    for backup in backups {
        if let Some(provider_id) = backup.provider_id {
            if !stores.contains_key(&provider_id) {
                let store = resolve_store(ctx, provider_id).await;
                stores.insert(provider_id, store);
            }
            match stores.get(&provider_id).and_then(Option::as_ref) {
                Some(store) => {
                    if let Err(e) = store.delete(&backup.remote_path).await {
                        warn!(
                            backup_id = backup.id,
                            key = %backup.remote_path,
                            error = %e,
                            "Failed to delete remote backup, removing record anyway"
                        );
                    }
                }
                None => warn!(
                    backup_id = backup.id,
                    provider_id,
                    "Storage provider unavailable, remote object left in place"
                ),
            }
        }

        let delta = -(i64::try_from(backup.size_bytes).unwrap_or(i64::MAX));
        ctx.store
            .adjust_usage(site.id, site.node_id, backup.provider_id, delta)
            .await?;
        site.storage_used_bytes = site.storage_used_bytes.saturating_sub(backup.size_bytes);

        if let (Some(_), Some(quota)) = (site.over_quota_since, site.storage_quota_bytes) {
            if site.storage_used_bytes <= quota {
                ctx.store.set_over_quota(site.id, None).await?;
                site.over_quota_since = None;
                info!(site_id = site.id, used = site.storage_used_bytes, quota, "Site back under quota");
            }
        }

        ctx.store.delete_backup(backup.id).await?;
        info!(
            site_id = site.id,
            backup_id = backup.id,
            filename = %backup.filename,
            bytes = backup.size_bytes,
            "Backup deleted"
        );

        report.deleted.push(backup.id);
        report.freed_bytes += backup.size_bytes;
    }

    Ok(report)
}

async fn resolve_store(ctx: &AppContext, provider_id: i64) -> Option<Arc<dyn ObjectStore>> {
    let provider = match ctx.store.get_provider(provider_id).await {
        Ok(Some(provider)) => provider,
        Ok(None) => return None,
        Err(e) => {
            warn!(provider_id, error = %e, "Failed to load storage provider");
            return None;
        }
    };
    match ctx.resolver.resolve(&provider) {
        Ok(store) => Some(store),
        Err(e) => {
            warn!(provider_id, error = %e, "Failed to connect to storage provider");
            None
        }
    }
}
