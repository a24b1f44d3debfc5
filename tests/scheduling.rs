use async_trait::async_trait;
use chrono::{Duration, Utc};
use sbkd::config::AppConfig;
use sbkd::context::AppContext;
use sbkd::core::pipeline::{BackupContext, BackupModule, PipelineExecutor};
use sbkd::core::{Dispatcher, JobStatus, Scheduler, StageResult, dispatcher};
use sbkd::db::models::{Node, Site, SiteBackupStatus};
use sbkd::db::{BackupStore, SqliteStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::timeout;

/// Two instant stages.
struct Quick;

#[async_trait]
impl BackupModule for Quick {
    fn name(&self) -> &str {
        "backup"
    }

    fn stages(&self) -> Vec<String> {
        vec!["first".to_string(), "second".to_string()]
    }

    async fn run_stage(&self, stage: &str, _ctx: &mut BackupContext) -> StageResult {
        StageResult::completed(format!("{} done", stage))
    }
}

/// First stage blocks until cancelled; records whether the second ever ran.
struct Blocking {
    second_ran: Arc<AtomicBool>,
}

#[async_trait]
impl BackupModule for Blocking {
    fn name(&self) -> &str {
        "backup"
    }

    fn stages(&self) -> Vec<String> {
        vec!["wait".to_string(), "after".to_string()]
    }

    async fn run_stage(&self, stage: &str, ctx: &mut BackupContext) -> StageResult {
        match stage {
            "wait" => {
                ctx.cancel.cancelled().await;
                StageResult::failed("interrupted")
            }
            _ => {
                self.second_ran.store(true, Ordering::SeqCst);
                StageResult::completed("ran")
            }
        }
    }
}

async fn setup(max_concurrent: u32, module: Arc<dyn BackupModule>) -> (AppContext, SqliteStore, i64) {
    let mut config = AppConfig::default();
    config.scheduler.queue_poll_ms = 50;

    let store = SqliteStore::open_in_memory().await.unwrap();
    let node_id = store.insert_node(Node::new("edge", max_concurrent)).await.unwrap();
    let ctx = AppContext::new(config, Arc::new(store.clone())).with_module("backup", module);
    (ctx, store, node_id)
}

fn due_site(node_id: i64, name: &str) -> Site {
    let mut site = Site::new(node_id, name);
    site.schedule_frequency = "daily".to_string();
    site.schedule_time = "03:30".to_string();
    site.next_run_at = Some(Utc::now() - Duration::minutes(10));
    site
}

#[tokio::test]
async fn test_node_ceiling_across_ticks() {
    let (ctx, store, node_id) = setup(1, Arc::new(Quick)).await;
    let a = store.insert_site(due_site(node_id, "a")).await.unwrap();
    let b = store.insert_site(due_site(node_id, "b")).await.unwrap();

    let scheduler = Scheduler::new(ctx.clone());
    let dispatcher = Dispatcher::new(ctx.clone());

    let first = scheduler.tick(Utc::now()).await.unwrap();
    assert_eq!(first.dispatched.len(), 1);

    // Still running: nothing new may start on this node
    let blocked = scheduler.tick(Utc::now()).await.unwrap();
    assert!(blocked.dispatched.is_empty());
    assert_eq!(blocked.deferred, 1);

    let (job, status) = dispatcher.run_next().await.unwrap();
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(job.progress_percent, 100);

    let second = scheduler.tick(Utc::now()).await.unwrap();
    assert_eq!(second.dispatched.len(), 1);
    assert_ne!(first.dispatched[0], second.dispatched[0]);

    let mut ran = vec![first.dispatched[0], second.dispatched[0]];
    ran.sort();
    assert_eq!(ran, vec![a, b]);

    let done = store.get_site(first.dispatched[0]).await.unwrap().unwrap();
    assert_eq!(done.backup_status, SiteBackupStatus::Completed);
    assert!(done.next_run_at.unwrap() > Utc::now());
}

#[tokio::test]
async fn test_cancel_pending_job_never_runs() {
    let (ctx, store, node_id) = setup(2, Arc::new(Quick)).await;
    let site_id = store.insert_site(Site::new(node_id, "manual")).await.unwrap();
    let dispatcher = Dispatcher::new(ctx.clone());

    let job = dispatcher::trigger_site(&ctx, site_id).await.unwrap();
    let cancelled = dispatcher::cancel_site(&ctx, site_id).await.unwrap();

    assert_eq!(cancelled.id, job.id);
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.started_at.is_none());
    assert!(dispatcher.run_next().await.is_none());

    let site = store.get_site(site_id).await.unwrap().unwrap();
    assert_eq!(site.backup_status, SiteBackupStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_running_job_stops_pipeline() {
    let second_ran = Arc::new(AtomicBool::new(false));
    let module = Arc::new(Blocking {
        second_ran: second_ran.clone(),
    });
    let (ctx, store, node_id) = setup(2, module).await;
    let site_id = store.insert_site(Site::new(node_id, "slow")).await.unwrap();
    let dispatcher = Arc::new(Dispatcher::new(ctx.clone()));

    let job = dispatcher::trigger_site(&ctx, site_id).await.unwrap();
    let runner = dispatcher.clone();
    let handle = tokio::spawn(async move { runner.run_next().await });

    // Wait for the job to reach Running
    timeout(std::time::Duration::from_secs(5), async {
        loop {
            if ctx.queue.get_job(&job.id).map(|j| j.status) == Some(JobStatus::Running) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job never started");

    dispatcher::cancel_site(&ctx, site_id).await.unwrap();

    let (job, status) = timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("pipeline did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(status, JobStatus::Cancelled);
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(!second_ran.load(Ordering::SeqCst));

    let site = store.get_site(site_id).await.unwrap().unwrap();
    assert_eq!(site.backup_status, SiteBackupStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_after_start_leaves_site_to_its_task() {
    let (ctx, store, node_id) = setup(2, Arc::new(Quick)).await;
    let site_id = store.insert_site(Site::new(node_id, "racy")).await.unwrap();

    dispatcher::trigger_site(&ctx, site_id).await.unwrap();
    let queued = ctx
        .queue
        .get_next_job(std::time::Duration::from_millis(100))
        .await
        .unwrap();
    let (started, cancel) = ctx.queue.start_job(&queued.id).unwrap();

    let cancelled = dispatcher::cancel_site(&ctx, site_id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.started_at.is_some());
    assert!(cancel.is_cancelled());

    // The started task still owns the site
    let site = store.get_site(site_id).await.unwrap().unwrap();
    assert_eq!(site.backup_status, SiteBackupStatus::Running);
    assert!(dispatcher::trigger_site(&ctx, site_id).await.is_err());

    let executor = PipelineExecutor::new(ctx.queue.clone());
    let status = dispatcher::execute_job(&ctx, &executor, started, cancel).await;
    assert_eq!(status, JobStatus::Cancelled);

    let site = store.get_site(site_id).await.unwrap().unwrap();
    assert_eq!(site.backup_status, SiteBackupStatus::Cancelled);
}
