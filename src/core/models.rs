use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a backup job.
///
/// Pending -> Running -> {Completed, Failed}, Pending -> Cancelled, Running -> Cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed, Failed and Cancelled have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Outcome of a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub status: StageStatus,
    pub message: String,
    /// Structured stage output (sizes, counts, paths)
    pub details: serde_json::Value,
    pub duration: Duration,
}

impl StageResult {
    fn new(status: StageStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: serde_json::Value::Null,
            duration: Duration::ZERO,
        }
    }

    pub fn pending() -> Self {
        Self::new(StageStatus::Pending, "")
    }

    pub fn completed(message: impl Into<String>) -> Self {
        Self::new(StageStatus::Completed, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(StageStatus::Failed, message)
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self::new(StageStatus::Skipped, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == StageStatus::Failed
    }
}

/// A unit of scheduled work: one run of a module's stage pipeline against one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: String,
    pub module: String,
    pub target_id: i64,
    pub target_name: String,
    pub status: JobStatus,
    /// Higher value dequeues first
    pub priority: i32,
    pub stages: Vec<String>,
    pub current_stage: Option<String>,
    pub stage_results: HashMap<String, StageResult>,
    pub progress_percent: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl BackupJob {
    pub fn new(
        id: String,
        module: impl Into<String>,
        target_id: i64,
        target_name: impl Into<String>,
        stages: Vec<String>,
        priority: i32,
    ) -> Self {
        let stage_results = stages
            .iter()
            .map(|s| (s.clone(), StageResult::pending()))
            .collect();

        Self {
            id,
            module: module.into(),
            target_id,
            target_name: target_name.into(),
            status: JobStatus::Pending,
            priority,
            stages,
            current_stage: None,
            stage_results,
            progress_percent: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn stage_status(&self, stage: &str) -> Option<StageStatus> {
        self.stage_results.get(stage).map(|r| r.status)
    }

    /// Percentage of stages that have completed.
    pub fn recompute_progress(&mut self) {
        if self.stages.is_empty() {
            self.progress_percent = 0;
            return;
        }

        let completed = self
            .stages
            .iter()
            .filter(|s| self.stage_status(s) == Some(StageStatus::Completed))
            .count();

        self.progress_percent = ((completed * 100) / self.stages.len()) as u8;
    }
}
