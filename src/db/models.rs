use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Live mirror of a site's most recent job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteBackupStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SiteBackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SiteBackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteBackupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" | "" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown site backup status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for BackupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown backup status: {}", other)),
        }
    }
}

/// Backup execution host; bounds concurrency and retention for its sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    /// Stable identifier used in remote paths
    pub uuid: Option<String>,
    pub name: String,
    /// IANA zone the node's site schedules are expressed in
    pub timezone: String,
    pub max_concurrent_backups: u32,
    pub max_retention_copies: Option<u32>,
    pub storage_used_bytes: u64,
    pub storage_quota_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub uuid: Option<String>,
    pub node_id: i64,
    pub name: String,
    pub owner_email: Option<String>,
    pub is_active: bool,

    pub content_path: String,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    pub db_host: String,

    pub storage_provider_id: Option<i64>,

    pub schedule_frequency: String,
    pub schedule_time: String,
    pub schedule_days: Option<String>,
    pub retention_copies: Option<u32>,
    pub next_run_at: Option<DateTime<Utc>>,

    pub backup_status: SiteBackupStatus,
    pub backup_progress: u8,
    pub backup_message: Option<String>,
    pub backup_error: Option<String>,
    pub last_backup_at: Option<DateTime<Utc>>,

    pub storage_used_bytes: u64,
    pub storage_quota_bytes: Option<u64>,
    pub over_quota_since: Option<DateTime<Utc>>,
    /// Job that owns the running state, if any
    pub backup_job_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageProvider {
    pub id: i64,
    pub name: String,
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub access_key: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub used_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: i64,
    pub site_id: i64,
    pub provider_id: Option<i64>,
    pub filename: String,
    pub remote_path: String,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    pub status: BackupStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scheduled_deletion: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewBackupRecord {
    pub site_id: i64,
    pub provider_id: Option<i64>,
    pub filename: String,
    pub remote_path: String,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    pub status: BackupStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Node {
    /// A node with defaults for everything except name and concurrency ceiling.
    pub fn new(name: impl Into<String>, max_concurrent_backups: u32) -> Self {
        Self {
            id: 0,
            uuid: None,
            name: name.into(),
            timezone: "UTC".to_string(),
            max_concurrent_backups,
            max_retention_copies: None,
            storage_used_bytes: 0,
            storage_quota_bytes: None,
        }
    }
}

/// What claiming a site for a job does to its `next_run_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reschedule {
    /// Manual runs leave the schedule alone
    Keep,
    /// Scheduled runs move to the following run
    To(Option<DateTime<Utc>>),
}

impl Site {
    /// A manual-frequency site with empty credentials.
    pub fn new(node_id: i64, name: impl Into<String>) -> Self {
        Self {
            id: 0,
            uuid: None,
            node_id,
            name: name.into(),
            owner_email: None,
            is_active: true,
            content_path: String::new(),
            db_name: String::new(),
            db_user: String::new(),
            db_password: String::new(),
            db_host: "localhost".to_string(),
            storage_provider_id: None,
            schedule_frequency: "manual".to_string(),
            schedule_time: "02:00".to_string(),
            schedule_days: None,
            retention_copies: None,
            next_run_at: None,
            backup_status: SiteBackupStatus::Idle,
            backup_progress: 0,
            backup_message: None,
            backup_error: None,
            last_backup_at: None,
            storage_used_bytes: 0,
            storage_quota_bytes: None,
            over_quota_since: None,
            backup_job_id: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.backup_status == SiteBackupStatus::Running
    }
}
