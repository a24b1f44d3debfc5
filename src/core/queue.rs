//! In-memory priority queue and registry of backup jobs.
//!
//! Jobs dequeue by (priority desc, creation order asc). Every mutation is
//! broadcast synchronously to registered observers; an observer that fails
//! or panics is logged and skipped.

use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::{BackupJob, JobStatus, StageResult, StageStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("invalid job transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("cannot cancel job {id} in state {status}")]
    CannotCancel { id: String, status: JobStatus },
}

/// Callback invoked after every job mutation.
pub trait JobObserver: Send + Sync {
    fn on_job_update(&self, job: &BackupJob) -> anyhow::Result<()>;
}

impl<F> JobObserver for F
where
    F: Fn(&BackupJob) -> anyhow::Result<()> + Send + Sync,
{
    fn on_job_update(&self, job: &BackupJob) -> anyhow::Result<()> {
        self(job)
    }
}

/// Heap entry ordered by priority, then by enqueue sequence.
#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: i32,
    sequence: u64,
    job_id: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, BackupJob>,
    heap: BinaryHeap<QueueEntry>,
    tokens: HashMap<String, CancellationToken>,
    next_sequence: u64,
}

#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    observers: RwLock<Vec<Arc<dyn JobObserver>>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for all subsequent job mutations.
    pub fn subscribe(&self, observer: Arc<dyn JobObserver>) {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        observers.push(observer);
    }

    /// Allocate a Pending job and enqueue it.
    pub fn create_job(
        &self,
        module: &str,
        target_id: i64,
        target_name: &str,
        stages: Vec<String>,
        priority: i32,
    ) -> BackupJob {
        self.submit(BackupJob::new(
            Self::new_job_id(),
            module,
            target_id,
            target_name,
            stages,
            priority,
        ))
    }

    /// Fresh, time-ordered job id.
    pub fn new_job_id() -> String {
        Uuid::now_v7().to_string()
    }

    /// Enqueue a job built by the caller, e.g. one whose id was recorded elsewhere first.
    pub fn submit(&self, job: BackupJob) -> BackupJob {
        let priority = job.priority;
        {
            let mut state = self.lock();
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.heap.push(QueueEntry {
                priority,
                sequence,
                job_id: job.id.clone(),
            });
            state.jobs.insert(job.id.clone(), job.clone());
        }

        info!(
            job_id = %job.id,
            module = %job.module,
            target_id = job.target_id,
            priority,
            "Job created"
        );

        self.notify.notify_one();
        self.publish(&job);
        job
    }

    /// Pop the highest-priority Pending job, waiting up to `timeout` for one to arrive.
    pub async fn get_next_job(&self, timeout: Duration) -> Option<BackupJob> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.pop_pending() {
                return Some(job);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    fn pop_pending(&self) -> Option<BackupJob> {
        let mut state = self.lock();
        while let Some(entry) = state.heap.pop() {
            // Cancelled jobs stay in the heap until popped
            if let Some(job) = state.jobs.get(&entry.job_id) {
                if job.status == JobStatus::Pending {
                    return Some(job.clone());
                }
            }
        }
        None
    }

    pub fn get_job(&self, job_id: &str) -> Option<BackupJob> {
        self.lock().jobs.get(job_id).cloned()
    }

    pub fn list_jobs(&self) -> Vec<BackupJob> {
        let mut jobs: Vec<BackupJob> = self.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .count()
    }

    /// The non-terminal job for a target, if any.
    pub fn active_job_for_target(&self, target_id: i64) -> Option<BackupJob> {
        self.lock()
            .jobs
            .values()
            .find(|j| j.target_id == target_id && !j.status.is_terminal())
            .cloned()
    }

    /// Move a Pending job to Running and hand out its cancellation token.
    pub fn start_job(&self, job_id: &str) -> Result<(BackupJob, CancellationToken), QueueError> {
        let (job, token) = {
            let mut state = self.lock();
            let job = Self::transition(&mut state, job_id, JobStatus::Running)?;
            job.started_at = Some(Utc::now());
            let job = job.clone();

            let token = CancellationToken::new();
            state.tokens.insert(job_id.to_string(), token.clone());
            (job, token)
        };

        info!(job_id = %job_id, "Job started");
        self.publish(&job);
        Ok((job, token))
    }

    /// Record `stage` as the current stage with the given status.
    pub fn update_job_stage(
        &self,
        job_id: &str,
        stage: &str,
        status: StageStatus,
    ) -> Result<(), QueueError> {
        let job = {
            let mut state = self.lock();
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

            job.current_stage = Some(stage.to_string());
            let entry = job
                .stage_results
                .entry(stage.to_string())
                .or_insert_with(StageResult::pending);
            entry.status = status;
            job.clone()
        };

        debug!(job_id = %job_id, stage, ?status, "Stage updated");
        self.publish(&job);
        Ok(())
    }

    /// Store a finished stage result and refresh progress.
    pub fn record_stage_result(
        &self,
        job_id: &str,
        stage: &str,
        result: StageResult,
    ) -> Result<(), QueueError> {
        let job = {
            let mut state = self.lock();
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

            job.stage_results.insert(stage.to_string(), result);
            job.recompute_progress();
            job.clone()
        };

        self.publish(&job);
        Ok(())
    }

    /// Finish a Running job as Completed or Failed.
    pub fn complete_job(
        &self,
        job_id: &str,
        success: bool,
        error: Option<String>,
    ) -> Result<BackupJob, QueueError> {
        let target = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };

        let job = {
            let mut state = self.lock();
            let job = Self::transition(&mut state, job_id, target)?;
            job.completed_at = Some(Utc::now());
            job.current_stage = None;
            if success {
                job.progress_percent = 100;
                job.error_message = None;
            } else {
                job.error_message = error;
            }
            let job = job.clone();
            state.tokens.remove(job_id);
            job
        };

        match job.status {
            JobStatus::Completed => info!(job_id = %job_id, "Job completed"),
            _ => warn!(
                job_id = %job_id,
                error = job.error_message.as_deref().unwrap_or(""),
                "Job failed"
            ),
        }

        self.publish(&job);
        Ok(job)
    }

    /// Cancel a Pending or Running job.
    ///
    /// Running jobs get their cancellation token triggered; the pipeline stops at
    /// the next stage boundary.
    pub fn cancel_job(&self, job_id: &str) -> Result<BackupJob, QueueError> {
        let job = {
            let mut state = self.lock();
            let current = state
                .jobs
                .get(job_id)
                .map(|j| j.status)
                .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

            if !current.can_transition_to(JobStatus::Cancelled) {
                return Err(QueueError::CannotCancel {
                    id: job_id.to_string(),
                    status: current,
                });
            }

            if let Some(token) = state.tokens.remove(job_id) {
                token.cancel();
            }

            let job = Self::transition(&mut state, job_id, JobStatus::Cancelled)?;
            job.completed_at = Some(Utc::now());
            job.clone()
        };

        info!(job_id = %job_id, "Job cancelled");
        self.publish(&job);
        Ok(job)
    }

    fn transition<'a>(
        state: &'a mut QueueState,
        job_id: &str,
        next: JobStatus,
    ) -> Result<&'a mut BackupJob, QueueError> {
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

        if !job.status.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                from: job.status,
                to: next,
            });
        }

        job.status = next;
        Ok(job)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, job: &BackupJob) {
        let observers: Vec<Arc<dyn JobObserver>> = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for observer in observers {
            match catch_unwind(AssertUnwindSafe(|| observer.on_job_update(job))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(job_id = %job.id, error = %e, "Job observer failed");
                }
                Err(_) => {
                    warn!(job_id = %job.id, "Job observer panicked");
                }
            }
        }
    }
}
