//! In-memory progress tracking for active jobs.
//!
//! The tracker subscribes to the job queue and keeps the latest snapshot of
//! every non-terminal job. Nothing here is persisted; the site mirror in the
//! store is the durable view.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::models::{BackupJob, JobStatus};
use super::queue::JobObserver;

/// Latest view of one active job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobProgress {
    pub target_id: i64,
    pub target_name: String,
    pub status: JobStatus,
    pub current_stage: Option<String>,
    pub percent: u8,
}

impl From<&BackupJob> for JobProgress {
    fn from(job: &BackupJob) -> Self {
        Self {
            target_id: job.target_id,
            target_name: job.target_name.clone(),
            status: job.status,
            current_stage: job.current_stage.clone(),
            percent: job.progress_percent,
        }
    }
}

/// Thread-safe snapshot store, shared via `AppContext`.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<HashMap<String, JobProgress>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, job: &BackupJob) {
        let mut map = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if job.status.is_terminal() {
            map.remove(&job.id);
        } else {
            map.insert(job.id.clone(), JobProgress::from(job));
        }
    }

    pub fn get(&self, job_id: &str) -> Option<JobProgress> {
        self.read().get(job_id).cloned()
    }

    pub fn get_all(&self) -> HashMap<String, JobProgress> {
        self.read().clone()
    }

    pub fn active_count(&self) -> usize {
        self.read().len()
    }

    /// Jobs currently in Running state.
    pub fn running_count(&self) -> usize {
        self.read()
            .values()
            .filter(|p| p.status == JobStatus::Running)
            .count()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, JobProgress>> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl JobObserver for ProgressTracker {
    fn on_job_update(&self, job: &BackupJob) -> anyhow::Result<()> {
        self.update(job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::queue::JobQueue;

    fn stages() -> Vec<String> {
        vec!["dump".to_string(), "upload".to_string()]
    }

    #[test]
    fn test_tracker_follows_job_lifecycle() {
        let queue = JobQueue::new();
        let tracker = ProgressTracker::new();
        queue.subscribe(Arc::new(tracker.clone()));

        let job = queue.create_job("backup", 1, "example.com", stages(), 0);
        assert_eq!(tracker.active_count(), 1);
        assert_eq!(tracker.get(&job.id).unwrap().status, JobStatus::Pending);

        queue.start_job(&job.id).unwrap();
        assert_eq!(tracker.running_count(), 1);

        queue.complete_job(&job.id, true, None).unwrap();
        assert_eq!(tracker.active_count(), 0);
        assert!(tracker.get(&job.id).is_none());
    }

    #[test]
    fn test_tracker_multiple_jobs() {
        let queue = JobQueue::new();
        let tracker = ProgressTracker::new();
        queue.subscribe(Arc::new(tracker.clone()));

        let a = queue.create_job("backup", 1, "a.example", stages(), 0);
        let b = queue.create_job("backup", 2, "b.example", stages(), 0);
        queue.create_job("backup", 3, "c.example", stages(), 0);
        queue.start_job(&a.id).unwrap();
        queue.cancel_job(&b.id).unwrap();

        let all = tracker.get_all();
        assert_eq!(all.len(), 2);
        assert!(all.contains_key(&a.id));
        assert!(!all.contains_key(&b.id));
        assert_eq!(tracker.running_count(), 1);
    }
}
