//! Persistence for sites, nodes, storage providers and backup records.
//!
//! The engine only talks to [`BackupStore`]; [`SqliteStore`] is the shipped
//! implementation. Every method commits before returning, so the next
//! scheduler tick always reads fresh state.

pub mod models;
mod sqlite;

pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use models::{
    BackupRecord, NewBackupRecord, Node, Reschedule, Site, SiteBackupStatus, StorageProvider,
};

#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Active, non-manual sites whose `next_run_at` has passed.
    async fn due_sites(&self, now: DateTime<Utc>) -> Result<Vec<Site>>;

    /// Active, non-manual sites that have never had a next run computed.
    async fn unscheduled_sites(&self) -> Result<Vec<Site>>;

    async fn get_site(&self, site_id: i64) -> Result<Option<Site>>;
    async fn list_sites(&self) -> Result<Vec<Site>>;
    async fn sites_for_node(&self, node_id: i64) -> Result<Vec<Site>>;

    async fn get_node(&self, node_id: i64) -> Result<Option<Node>>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    async fn get_provider(&self, provider_id: i64) -> Result<Option<StorageProvider>>;

    /// Number of running sites per node.
    async fn running_counts_by_node(&self) -> Result<HashMap<i64, u32>>;

    /// Flip a site to running on behalf of `job_id`. Returns false if it already was.
    ///
    /// The schedule change in `reschedule` is written in the same update.
    async fn try_mark_site_running(
        &self,
        site_id: i64,
        job_id: &str,
        message: &str,
        reschedule: Reschedule,
    ) -> Result<bool>;

    async fn set_next_run_at(&self, site_id: i64, next: Option<DateTime<Utc>>) -> Result<()>;

    /// Mirror live progress; ignored unless the site is running for `job_id`.
    async fn update_site_progress(
        &self,
        site_id: i64,
        job_id: &str,
        progress: u8,
        message: &str,
    ) -> Result<()>;

    /// Record the outcome of `job_id`. Returns false, changing nothing, when the site
    /// is no longer running for that job.
    async fn finish_site_backup(
        &self,
        site_id: i64,
        job_id: &str,
        status: SiteBackupStatus,
        message: &str,
        error: Option<&str>,
        finished_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn insert_backup(&self, record: NewBackupRecord) -> Result<i64>;

    /// Completed backups for a site, oldest first.
    async fn successful_backups(&self, site_id: i64) -> Result<Vec<BackupRecord>>;

    async fn backups_due_for_deletion(&self, now: DateTime<Utc>) -> Result<Vec<BackupRecord>>;

    async fn schedule_backup_deletion(&self, backup_id: i64, at: DateTime<Utc>) -> Result<()>;

    async fn delete_backup(&self, backup_id: i64) -> Result<()>;

    /// Add `delta` bytes to site, node and provider counters, flooring at zero.
    async fn adjust_usage(
        &self,
        site_id: i64,
        node_id: i64,
        provider_id: Option<i64>,
        delta: i64,
    ) -> Result<()>;

    async fn set_site_usage(&self, site_id: i64, bytes: u64) -> Result<()>;
    async fn set_node_usage(&self, node_id: i64, bytes: u64) -> Result<()>;

    async fn set_over_quota(&self, site_id: i64, since: Option<DateTime<Utc>>) -> Result<()>;

    /// Fail every site still marked running. Used at startup, when no job can be in flight.
    async fn release_running_sites(&self, error: &str) -> Result<usize>;
}
