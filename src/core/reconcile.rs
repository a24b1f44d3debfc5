//! Storage usage reconciliation against the remote store.

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::core::storage::site_prefix;
use crate::db::models::{Node, Site};

/// Tracked vs. measured usage of one site or node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    pub id: i64,
    pub name: String,
    pub tracked_bytes: u64,
    pub measured_bytes: u64,
    /// `measured - tracked`
    pub drift: i64,
    /// Objects counted under the site prefix; zero for nodes
    pub objects: usize,
    pub applied: bool,
}

impl DriftReport {
    fn new(id: i64, name: &str, tracked: u64, measured: u64, objects: usize) -> Self {
        Self {
            id,
            name: name.to_string(),
            tracked_bytes: tracked,
            measured_bytes: measured,
            drift: signed(measured) - signed(tracked),
            objects,
            applied: false,
        }
    }
}

fn signed(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

/// Measure a site's remote usage and overwrite its counter unless `dry_run`.
pub async fn reconcile_site(ctx: &AppContext, site: &Site, dry_run: bool) -> Result<DriftReport> {
    let provider_id = site
        .storage_provider_id
        .ok_or_else(|| anyhow!("Site {} has no storage provider", site.id))?;
    let provider = ctx
        .store
        .get_provider(provider_id)
        .await?
        .ok_or_else(|| anyhow!("Storage provider {} not found", provider_id))?;
    let node = ctx
        .store
        .get_node(site.node_id)
        .await?
        .ok_or_else(|| anyhow!("Node {} not found", site.node_id))?;

    let prefix = site_prefix(
        &ctx.config.storage.remote_prefix,
        node.uuid.as_deref(),
        site.uuid.as_deref(),
        &node.name,
        &site.name,
    );

    let remote = ctx.resolver.resolve(&provider)?;
    let objects = remote
        .list(&prefix)
        .await
        .with_context(|| format!("Failed to list {}", prefix))?;
    let measured: u64 = objects.iter().map(|o| o.size).sum();

    let mut report = DriftReport::new(
        site.id,
        &site.name,
        site.storage_used_bytes,
        measured,
        objects.len(),
    );

    if report.drift != 0 {
        info!(
            site_id = site.id,
            prefix = %prefix,
            tracked = report.tracked_bytes,
            measured,
            drift = report.drift,
            dry_run,
            "Storage drift detected"
        );
        if !dry_run {
            ctx.store.set_site_usage(site.id, measured).await?;
            report.applied = true;
        }
    }

    Ok(report)
}

/// Recompute a node's usage as the sum of its sites' tracked usage.
pub async fn reconcile_node(ctx: &AppContext, node: &Node, dry_run: bool) -> Result<DriftReport> {
    let sites = ctx.store.sites_for_node(node.id).await?;
    let measured: u64 = sites.iter().map(|s| s.storage_used_bytes).sum();

    let mut report = DriftReport::new(node.id, &node.name, node.storage_used_bytes, measured, 0);
    if report.drift != 0 {
        info!(
            node_id = node.id,
            tracked = report.tracked_bytes,
            measured,
            drift = report.drift,
            dry_run,
            "Node usage drift detected"
        );
        if !dry_run {
            ctx.store.set_node_usage(node.id, measured).await?;
            report.applied = true;
        }
    }
    Ok(report)
}

/// Site and node drift from one full pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconcileSummary {
    pub sites: Vec<DriftReport>,
    pub nodes: Vec<DriftReport>,
    pub failures: usize,
}

/// Reconcile every site with a storage provider, then every node.
///
/// One failing site is logged and counted; it does not stop the pass.
pub async fn reconcile_all(ctx: &AppContext, dry_run: bool) -> Result<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();

    for site in ctx.store.list_sites().await? {
        if site.storage_provider_id.is_none() {
            continue;
        }
        match reconcile_site(ctx, &site, dry_run).await {
            Ok(report) => summary.sites.push(report),
            Err(e) => {
                warn!(site_id = site.id, error = %format!("{:#}", e), "Site reconciliation failed");
                summary.failures += 1;
            }
        }
    }

    // Re-read nodes so the sums see the corrected site counters
    for node in ctx.store.list_nodes().await? {
        summary.nodes.push(reconcile_node(ctx, &node, dry_run).await?);
    }

    info!(
        sites = summary.sites.len(),
        nodes = summary.nodes.len(),
        failures = summary.failures,
        dry_run,
        "Reconciliation finished"
    );
    Ok(summary)
}
