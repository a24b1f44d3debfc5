use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, error, info, info_span, warn};

use super::{BackupContext, BackupModule};
use crate::core::models::{BackupJob, JobStatus, StageResult, StageStatus};
use crate::core::queue::JobQueue;

/// Runs a module's stages in order for one job.
pub struct PipelineExecutor {
    queue: Arc<JobQueue>,
}

impl PipelineExecutor {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }

    /// Execute every stage of `job`, stopping at the first failure or a cancellation.
    ///
    /// The job must already be Running. The context's scratch directory is removed
    /// before returning, whatever the outcome.
    pub async fn execute(
        &self,
        job: &BackupJob,
        module: &dyn BackupModule,
        ctx: &mut BackupContext,
    ) -> JobStatus {
        let span = info_span!("pipeline", job_id = %job.id, module = %job.module);
        let status = self.run_stages(job, module, ctx).instrument(span).await;
        ctx.remove_temp_dir().await;
        status
    }

    async fn run_stages(
        &self,
        job: &BackupJob,
        module: &dyn BackupModule,
        ctx: &mut BackupContext,
    ) -> JobStatus {
        info!(stages = job.stages.len(), target = %job.target_name, "Pipeline started");

        for stage in &job.stages {
            if ctx.cancel.is_cancelled() {
                info!(stage = %stage, "Cancellation observed, stopping before stage");
                return self.current_status(&job.id, JobStatus::Cancelled);
            }

            if let Err(e) = self
                .queue
                .update_job_stage(&job.id, stage, StageStatus::Running)
            {
                warn!(stage = %stage, error = %e, "Failed to mark stage running");
            }

            let started = Instant::now();
            let result = match AssertUnwindSafe(module.run_stage(stage, ctx))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload);
                    error!(stage = %stage, error = %message, "Stage panicked");
                    StageResult::failed(format!("Stage {} panicked: {}", stage, message))
                }
            };
            let result = result.with_duration(started.elapsed());

            info!(
                stage = %stage,
                status = ?result.status,
                duration_ms = result.duration.as_millis() as u64,
                message = %result.message,
                "Stage finished"
            );

            let failed = result.is_failed();
            let message = result.message.clone();
            if let Err(e) = self.queue.record_stage_result(&job.id, stage, result) {
                warn!(stage = %stage, error = %e, "Failed to record stage result");
            }

            if failed {
                // A tool killed by cancellation reports failure; the job is already Cancelled
                if ctx.cancel.is_cancelled() {
                    return self.current_status(&job.id, JobStatus::Cancelled);
                }
                return self.finish(&job.id, false, Some(message));
            }
        }

        if ctx.cancel.is_cancelled() {
            return self.current_status(&job.id, JobStatus::Cancelled);
        }

        self.finish(&job.id, true, None)
    }

    fn finish(&self, job_id: &str, success: bool, error: Option<String>) -> JobStatus {
        match self.queue.complete_job(job_id, success, error) {
            Ok(job) => job.status,
            Err(e) => {
                // Lost a race with cancel_job
                warn!(job_id = %job_id, error = %e, "Could not complete job");
                self.current_status(job_id, JobStatus::Failed)
            }
        }
    }

    fn current_status(&self, job_id: &str, fallback: JobStatus) -> JobStatus {
        self.queue
            .get_job(job_id)
            .map(|j| j.status)
            .unwrap_or(fallback)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Test module whose stage outcomes are scripted by name.
    struct Scripted {
        outcomes: HashMap<&'static str, &'static str>,
        executed: Mutex<Vec<String>>,
        cancel_after: Option<&'static str>,
        queue: Option<Arc<JobQueue>>,
    }

    impl Scripted {
        fn new(outcomes: &[(&'static str, &'static str)]) -> Self {
            Self {
                outcomes: outcomes.iter().copied().collect(),
                executed: Mutex::new(Vec::new()),
                cancel_after: None,
                queue: None,
            }
        }
    }

    #[async_trait]
    impl BackupModule for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn stages(&self) -> Vec<String> {
            vec!["a".into(), "b".into(), "c".into()]
        }

        async fn run_stage(&self, stage: &str, ctx: &mut BackupContext) -> StageResult {
            self.executed.lock().unwrap().push(stage.to_string());

            if self.cancel_after == Some(stage) {
                if let Some(queue) = &self.queue {
                    queue.cancel_job(&ctx.job_id).unwrap();
                }
            }

            match self.outcomes.get(stage).copied().unwrap_or("ok") {
                "fail" => StageResult::failed(format!("{} broke", stage)),
                "skip" => StageResult::skipped("nothing to do"),
                "panic" => panic!("stage {} exploded", stage),
                _ => StageResult::completed("ok"),
            }
        }
    }

    fn setup(module: &Scripted) -> (Arc<JobQueue>, BackupJob, BackupContext) {
        let queue = Arc::new(JobQueue::new());
        let job = queue.create_job("scripted", 1, "example.com", module.stages(), 0);
        let (job, token) = queue.start_job(&job.id).unwrap();
        let ctx = BackupContext::new(&job.id, 1, "example.com", HashMap::new(), token);
        (queue, job, ctx)
    }

    #[tokio::test]
    async fn test_failed_stage_short_circuits() {
        let module = Scripted::new(&[("b", "fail")]);
        let (queue, job, mut ctx) = setup(&module);

        let status = PipelineExecutor::new(queue.clone())
            .execute(&job, &module, &mut ctx)
            .await;

        assert_eq!(status, JobStatus::Failed);
        let job = queue.get_job(&job.id).unwrap();
        assert_eq!(job.stage_status("a"), Some(StageStatus::Completed));
        assert_eq!(job.stage_status("b"), Some(StageStatus::Failed));
        assert_eq!(job.stage_status("c"), Some(StageStatus::Pending));
        assert_eq!(job.error_message.as_deref(), Some("b broke"));
        assert_eq!(*module.executed.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_panicking_stage_becomes_failure() {
        let module = Scripted::new(&[("a", "panic")]);
        let (queue, job, mut ctx) = setup(&module);

        let status = PipelineExecutor::new(queue.clone())
            .execute(&job, &module, &mut ctx)
            .await;

        assert_eq!(status, JobStatus::Failed);
        let job = queue.get_job(&job.id).unwrap();
        assert!(job.error_message.as_deref().unwrap().contains("stage a exploded"));
        assert_eq!(job.stage_status("b"), Some(StageStatus::Pending));
    }

    #[tokio::test]
    async fn test_skipped_stage_does_not_fail_job() {
        let module = Scripted::new(&[("b", "skip")]);
        let (queue, job, mut ctx) = setup(&module);

        let status = PipelineExecutor::new(queue.clone())
            .execute(&job, &module, &mut ctx)
            .await;

        assert_eq!(status, JobStatus::Completed);
        let job = queue.get_job(&job.id).unwrap();
        assert_eq!(job.stage_status("b"), Some(StageStatus::Skipped));
        assert_eq!(job.progress_percent, 100);
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_stops_at_next_stage_boundary() {
        let mut module = Scripted::new(&[]);
        module.cancel_after = Some("a");
        let (queue, job, mut ctx) = setup(&module);
        module.queue = Some(queue.clone());

        let status = PipelineExecutor::new(queue.clone())
            .execute(&job, &module, &mut ctx)
            .await;

        assert_eq!(status, JobStatus::Cancelled);
        assert_eq!(*module.executed.lock().unwrap(), vec!["a"]);
        let job = queue.get_job(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.stage_status("b"), Some(StageStatus::Pending));
    }

    #[tokio::test]
    async fn test_temp_dir_removed_after_failure() {
        let work = tempfile::tempdir().unwrap();
        let module = Scripted::new(&[("a", "fail")]);
        let (queue, job, mut ctx) = setup(&module);
        let dir = ctx.ensure_temp_dir(work.path()).unwrap();

        PipelineExecutor::new(queue)
            .execute(&job, &module, &mut ctx)
            .await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_already_cancelled_token_runs_nothing() {
        let module = Scripted::new(&[]);
        let queue = Arc::new(JobQueue::new());
        let job = queue.create_job("scripted", 1, "example.com", module.stages(), 0);
        let (job, _) = queue.start_job(&job.id).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        queue.cancel_job(&job.id).unwrap();
        let mut ctx = BackupContext::new(&job.id, 1, "example.com", HashMap::new(), token);

        let status = PipelineExecutor::new(queue)
            .execute(&job, &module, &mut ctx)
            .await;
        assert_eq!(status, JobStatus::Cancelled);
        assert!(module.executed.lock().unwrap().is_empty());
    }
}
