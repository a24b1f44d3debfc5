//! Hands queued jobs to the pipeline and records their outcome.
//!
//! The dispatcher owns the only consumer of the job queue. Each dequeued job runs
//! on its own task; the site row mirrors the job while it runs and ends in
//! completed, failed or cancelled.

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::AppContext;
use crate::core::models::{BackupJob, JobStatus};
use crate::core::notifications::{JobEvent, notify_job};
use crate::core::pipeline::{
    BackupContext, Destination, PipelineExecutor, SiteBackupModule, data, keys,
};
use crate::core::queue::{JobObserver, JobQueue};
use crate::core::retention;
use crate::db::BackupStore;
use crate::db::models::{BackupStatus, NewBackupRecord, Node, Reschedule, Site, SiteBackupStatus};

/// Mark a site running for a new job and queue that job.
///
/// The site row records the job id, and `reschedule` is applied in the same write.
/// Returns `None` when the site was already running.
pub async fn enqueue_site(
    ctx: &AppContext,
    site: &Site,
    priority: i32,
    message: &str,
    reschedule: Reschedule,
) -> Result<Option<BackupJob>> {
    let module = ctx
        .modules
        .get(SiteBackupModule::NAME)
        .ok_or_else(|| anyhow!("Module '{}' is not registered", SiteBackupModule::NAME))?;

    let job = BackupJob::new(
        JobQueue::new_job_id(),
        module.name(),
        site.id,
        &site.name,
        module.stages(),
        priority,
    );
    if !ctx
        .store
        .try_mark_site_running(site.id, &job.id, message, reschedule)
        .await?
    {
        return Ok(None);
    }

    Ok(Some(ctx.queue.submit(job)))
}

/// Queue a manual backup, honouring the node's concurrency ceiling.
pub async fn trigger_site(ctx: &AppContext, site_id: i64) -> Result<BackupJob> {
    let site = ctx
        .store
        .get_site(site_id)
        .await?
        .ok_or_else(|| anyhow!("Site {} not found", site_id))?;
    if !site.is_active {
        bail!("Site {} is not active", site_id);
    }
    if site.is_running() {
        bail!("Site {} already has a backup running", site_id);
    }

    let node = ctx
        .store
        .get_node(site.node_id)
        .await?
        .ok_or_else(|| anyhow!("Node {} not found", site.node_id))?;
    let running = ctx.store.running_counts_by_node().await?;
    let active = running.get(&node.id).copied().unwrap_or(0);
    if active >= node.max_concurrent_backups {
        bail!(
            "Node {} is at its limit of {} concurrent backups",
            node.name,
            node.max_concurrent_backups
        );
    }

    let priority = ctx.config.scheduler.manual_priority;
    let job = enqueue_site(ctx, &site, priority, "Manual backup queued", Reschedule::Keep)
        .await?
        .ok_or_else(|| anyhow!("Site {} already has a backup running", site_id))?;
    info!(site_id, job_id = %job.id, "Manual backup triggered");
    Ok(job)
}

/// Cancel the active job of a site.
///
/// A queued job is cancelled outright and the site released here; a running job
/// stops at its next stage boundary and is finalized by its task.
pub async fn cancel_site(ctx: &AppContext, site_id: i64) -> Result<BackupJob> {
    let job = ctx
        .queue
        .active_job_for_target(site_id)
        .ok_or_else(|| anyhow!("Site {} has no active backup", site_id))?;
    let job = ctx.queue.cancel_job(&job.id)?;

    // Never started, so no task will finalize it
    if job.started_at.is_none() {
        ctx.store
            .finish_site_backup(
                site_id,
                &job.id,
                SiteBackupStatus::Cancelled,
                "Backup cancelled",
                None,
                Utc::now(),
            )
            .await?;
    }
    Ok(job)
}

/// Mirrors live job progress onto the site row.
///
/// Observers run synchronously, so updates go through a channel to one writer task
/// that applies them in order. Each update carries its job id; the store drops
/// updates from a job that no longer owns the site.
pub struct SiteStatusMirror {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

struct ProgressUpdate {
    site_id: i64,
    job_id: String,
    progress: u8,
    message: String,
}

impl SiteStatusMirror {
    /// Start the writer task. Must be called from within a Tokio runtime.
    pub fn spawn(store: Arc<dyn BackupStore>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let Err(e) = store
                    .update_site_progress(update.site_id, &update.job_id, update.progress, &update.message)
                    .await
                {
                    debug!(site_id = update.site_id, error = %e, "Failed to mirror job progress");
                }
            }
        });
        Arc::new(Self { tx })
    }
}

impl JobObserver for SiteStatusMirror {
    fn on_job_update(&self, job: &BackupJob) -> Result<()> {
        if job.status.is_terminal() {
            return Ok(());
        }
        let message = match (&job.status, &job.current_stage) {
            (JobStatus::Running, Some(stage)) => format!("Running {}", stage),
            (JobStatus::Running, None) => "Running".to_string(),
            _ => "Queued".to_string(),
        };
        self.tx
            .send(ProgressUpdate {
                site_id: job.target_id,
                job_id: job.id.clone(),
                progress: job.progress_percent,
                message,
            })
            .map_err(|_| anyhow!("site status writer has stopped"))
    }
}

/// Consumes the job queue and runs each job on its own task.
pub struct Dispatcher {
    ctx: AppContext,
    executor: Arc<PipelineExecutor>,
    tasks: TaskTracker,
}

impl Dispatcher {
    /// Build the dispatcher and subscribe the site status mirror to the queue.
    pub fn new(ctx: AppContext) -> Self {
        ctx.queue.subscribe(SiteStatusMirror::spawn(ctx.store.clone()));
        let executor = Arc::new(PipelineExecutor::new(ctx.queue.clone()));
        Self {
            ctx,
            executor,
            tasks: TaskTracker::new(),
        }
    }

    /// Dequeue until `shutdown` fires, then wait for in-flight jobs.
    pub async fn run(&self, shutdown: CancellationToken) {
        let poll = self.ctx.config.scheduler.queue_poll();
        info!(poll_ms = poll.as_millis() as u64, "Dispatcher started");

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                job = self.ctx.queue.get_next_job(poll) => job,
            };
            if let Some(job) = next {
                self.spawn_job(job);
            }
        }

        info!(in_flight = self.tasks.len(), "Dispatcher stopping, waiting for running jobs");
        self.tasks.close();
        self.tasks.wait().await;
        info!("Dispatcher stopped");
    }

    /// Start a dequeued job on its own task.
    pub fn spawn_job(&self, job: BackupJob) {
        let (job, cancel) = match self.ctx.queue.start_job(&job.id) {
            Ok(started) => started,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to start job");
                return;
            }
        };

        let ctx = self.ctx.clone();
        let executor = self.executor.clone();
        let span = info_span!("job", job_id = %job.id, site_id = job.target_id);
        self.tasks.spawn(
            async move {
                execute_job(&ctx, &executor, job, cancel).await;
            }
            .instrument(span),
        );
    }

    /// Dequeue and run exactly one job to completion.
    pub async fn run_next(&self) -> Option<(BackupJob, JobStatus)> {
        let poll = self.ctx.config.scheduler.queue_poll();
        let job = self.ctx.queue.get_next_job(poll).await?;
        let (job, cancel) = match self.ctx.queue.start_job(&job.id) {
            Ok(started) => started,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to start job");
                return None;
            }
        };
        let status = execute_job(&self.ctx, &self.executor, job.clone(), cancel).await;
        let job = self.ctx.queue.get_job(&job.id).unwrap_or(job);
        Some((job, status))
    }

    /// Cancel every queued or running job. Running ones stop at their next stage boundary.
    pub async fn cancel_all(&self) {
        for job in self.ctx.queue.list_jobs() {
            if job.status.is_terminal() {
                continue;
            }
            if let Err(e) = cancel_site(&self.ctx, job.target_id).await {
                debug!(job_id = %job.id, error = %e, "Job finished before it could be cancelled");
            }
        }
    }
}

/// Stage parameters for a site, keyed by [`keys`]. Empty values are left out.
pub fn site_config(site: &Site, node: &Node) -> HashMap<String, String> {
    let mut config = HashMap::new();
    let mut put = |key: &str, value: &str| {
        if !value.trim().is_empty() {
            config.insert(key.to_string(), value.to_string());
        }
    };

    put(keys::CONTENT_PATH, &site.content_path);
    put(keys::DB_NAME, &site.db_name);
    put(keys::DB_USER, &site.db_user);
    put(keys::DB_PASSWORD, &site.db_password);

    // `host:port` is split so the dump tool gets them as separate flags
    match site.db_host.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => {
            put(keys::DB_HOST, host);
            put(keys::DB_PORT, port);
        }
        _ => put(keys::DB_HOST, &site.db_host),
    }

    put(keys::NODE_UUID, node.uuid.as_deref().unwrap_or(""));
    put(keys::SITE_UUID, site.uuid.as_deref().unwrap_or(""));
    put(keys::NODE_NAME, &node.name);
    put(keys::SITE_NAME, &site.name);
    config
}

/// Run one started job end to end and write its outcome back to the store.
pub async fn execute_job(
    ctx: &AppContext,
    executor: &PipelineExecutor,
    job: BackupJob,
    cancel: CancellationToken,
) -> JobStatus {
    let started = Instant::now();

    let (site, node, destination) = match prepare(ctx, &job).await {
        Ok(prepared) => prepared,
        Err(e) => {
            let message = format!("{:#}", e);
            error!(job_id = %job.id, error = %message, "Backup could not start");
            if let Err(e) = ctx.queue.complete_job(&job.id, false, Some(message.clone())) {
                warn!(job_id = %job.id, error = %e, "Failed to fail job");
            }
            finish_site(ctx, job.target_id, &job.id, SiteBackupStatus::Failed, "Backup failed", Some(&message)).await;
            return JobStatus::Failed;
        }
    };

    let Some(module) = ctx.modules.get(&job.module) else {
        let message = format!("Unknown backup module '{}'", job.module);
        if let Err(e) = ctx.queue.complete_job(&job.id, false, Some(message.clone())) {
            warn!(job_id = %job.id, error = %e, "Failed to fail job");
        }
        finish_site(ctx, site.id, &job.id, SiteBackupStatus::Failed, "Backup failed", Some(&message)).await;
        return JobStatus::Failed;
    };

    let recipient = site.owner_email.clone().unwrap_or_default();
    notify_job(
        ctx.notifier.as_ref(),
        &recipient,
        &JobEvent::Started {
            job_id: job.id.clone(),
            site_name: site.name.clone(),
        },
    )
    .await;

    let mut bctx = BackupContext::new(
        &job.id,
        site.id,
        &site.name,
        site_config(&site, &node),
        cancel,
    )
    .with_destination(destination);

    let status = executor.execute(&job, module.as_ref(), &mut bctx).await;

    finalize(ctx, &job, &site, &bctx, status, started).await;
    status
}

async fn prepare(ctx: &AppContext, job: &BackupJob) -> Result<(Site, Node, Option<Destination>)> {
    let site = ctx
        .store
        .get_site(job.target_id)
        .await?
        .ok_or_else(|| anyhow!("Site {} not found", job.target_id))?;
    let node = ctx
        .store
        .get_node(site.node_id)
        .await?
        .ok_or_else(|| anyhow!("Node {} not found", site.node_id))?;

    let destination = match site.storage_provider_id {
        None => None,
        Some(provider_id) => {
            let provider = ctx
                .store
                .get_provider(provider_id)
                .await?
                .ok_or_else(|| anyhow!("Storage provider {} not found", provider_id))?;
            let store = ctx
                .resolver
                .resolve(&provider)
                .with_context(|| format!("Storage provider '{}' is misconfigured", provider.name))?;
            Some(Destination { provider_id, store })
        }
    };

    Ok((site, node, destination))
}

async fn finalize(
    ctx: &AppContext,
    job: &BackupJob,
    site: &Site,
    bctx: &BackupContext,
    status: JobStatus,
    started: Instant,
) {
    let recipient = site.owner_email.clone().unwrap_or_default();
    let now = Utc::now();

    match status {
        JobStatus::Completed => {
            let mut message = "Backup completed without upload".to_string();
            let mut total_bytes = bctx.data_u64(data::ARCHIVE_BYTES).unwrap_or(0);

            if let (Some(remote_path), Some(destination)) = (&bctx.remote_path, &bctx.destination) {
                let size = bctx
                    .data_u64(data::UPLOADED_BYTES)
                    .or_else(|| bctx.data_u64(data::ARCHIVE_BYTES))
                    .unwrap_or(0);
                total_bytes = size;
                let filename = bctx
                    .data_str(data::ARCHIVE_NAME)
                    .map(str::to_string)
                    .or_else(|| remote_path.rsplit('/').next().map(str::to_string))
                    .unwrap_or_default();

                let record = NewBackupRecord {
                    site_id: site.id,
                    provider_id: Some(destination.provider_id),
                    filename: filename.clone(),
                    remote_path: remote_path.clone(),
                    size_bytes: size,
                    checksum: bctx.data_str(data::CHECKSUM).map(str::to_string),
                    status: BackupStatus::Completed,
                    created_at: job.created_at,
                    completed_at: Some(now),
                };

                match record_backup(ctx, site, record).await {
                    Ok(backup_id) => {
                        info!(site_id = site.id, backup_id, bytes = size, "Backup recorded");
                        message = format!("Backup completed: {} ({} bytes)", filename, size);
                        after_upload(ctx, site.id).await;
                    }
                    Err(e) => {
                        error!(site_id = site.id, error = %format!("{:#}", e), "Failed to record backup");
                        message = format!("Backup uploaded to {} but could not be recorded", remote_path);
                    }
                }
            }

            finish_site(ctx, site.id, &job.id, SiteBackupStatus::Completed, &message, None).await;
            notify_job(
                ctx.notifier.as_ref(),
                &recipient,
                &JobEvent::Completed {
                    job_id: job.id.clone(),
                    site_name: site.name.clone(),
                    total_bytes,
                    duration_secs: started.elapsed().as_secs(),
                },
            )
            .await;
        }
        JobStatus::Cancelled => {
            finish_site(ctx, site.id, &job.id, SiteBackupStatus::Cancelled, "Backup cancelled", None).await;
        }
        other => {
            let error = ctx
                .queue
                .get_job(&job.id)
                .and_then(|j| j.error_message)
                .unwrap_or_else(|| format!("Backup ended in state {}", other));
            finish_site(ctx, site.id, &job.id, SiteBackupStatus::Failed, "Backup failed", Some(&error)).await;
            notify_job(
                ctx.notifier.as_ref(),
                &recipient,
                &JobEvent::Failed {
                    job_id: job.id.clone(),
                    site_name: site.name.clone(),
                    error,
                },
            )
            .await;
        }
    }
}

async fn record_backup(ctx: &AppContext, site: &Site, record: NewBackupRecord) -> Result<i64> {
    let provider_id = record.provider_id;
    let size = i64::try_from(record.size_bytes).unwrap_or(i64::MAX);
    let backup_id = ctx.store.insert_backup(record).await?;
    ctx.store
        .adjust_usage(site.id, site.node_id, provider_id, size)
        .await?;
    Ok(backup_id)
}

async fn after_upload(ctx: &AppContext, site_id: i64) {
    if let Err(e) = retention::enforce_retention(ctx, site_id).await {
        warn!(site_id, error = %format!("{:#}", e), "Retention enforcement failed");
    }
    if let Err(e) = retention::check_quota(ctx, site_id, Utc::now(), true).await {
        warn!(site_id, error = %format!("{:#}", e), "Quota check failed");
    }
}

async fn finish_site(
    ctx: &AppContext,
    site_id: i64,
    job_id: &str,
    status: SiteBackupStatus,
    message: &str,
    error: Option<&str>,
) {
    match ctx
        .store
        .finish_site_backup(site_id, job_id, status, message, error, Utc::now())
        .await
    {
        Ok(true) => {}
        Ok(false) => debug!(site_id, job_id, status = %status, "Site no longer owned by this job"),
        Err(e) => error!(site_id, status = %status, error = %e, "Failed to record site backup outcome"),
    }
}
