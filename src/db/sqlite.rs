use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, Row};
use tokio_rusqlite::{Connection, params};
use tracing::debug;

use super::BackupStore;
use super::models::{
    BackupRecord, BackupStatus, NewBackupRecord, Node, Reschedule, Site, SiteBackupStatus,
    StorageProvider,
};

const SITE_COLUMNS: &str = "id, uuid, node_id, name, owner_email, is_active,
    content_path, db_name, db_user, db_password, db_host, storage_provider_id,
    schedule_frequency, schedule_time, schedule_days, retention_copies, next_run_at,
    backup_status, backup_progress, backup_message, backup_error, last_backup_at,
    storage_used_bytes, storage_quota_bytes, over_quota_since, backup_job_id";

const NODE_COLUMNS: &str = "id, uuid, name, timezone, max_concurrent_backups,
    max_retention_copies, storage_used_bytes, storage_quota_bytes";

const PROVIDER_COLUMNS: &str =
    "id, name, bucket, region, endpoint, access_key, secret_key, used_bytes";

const BACKUP_COLUMNS: &str = "id, site_id, provider_id, filename, remote_path, size_bytes,
    checksum, status, created_at, completed_at, scheduled_deletion";

/// SQLite-backed store. Timestamps are unix seconds; byte counters are non-negative integers.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .await
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            let schema = include_str!("schema.sql");
            conn.execute_batch(schema)?;

            // SQLite disables foreign keys by default
            conn.execute("PRAGMA foreign_keys = ON;", [])?;

            Ok::<(), rusqlite::Error>(())
        })
        .await?;

        Ok(Self { conn })
    }

    pub async fn insert_node(&self, node: Node) -> Result<i64> {
        let id = self
            .conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO nodes (uuid, name, timezone, max_concurrent_backups,
                     max_retention_copies, storage_used_bytes, storage_quota_bytes)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        node.uuid,
                        node.name,
                        node.timezone,
                        node.max_concurrent_backups,
                        node.max_retention_copies,
                        to_i64(node.storage_used_bytes),
                        node.storage_quota_bytes.map(to_i64),
                    ],
                )?;
                Ok::<i64, rusqlite::Error>(c.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    pub async fn insert_provider(&self, provider: StorageProvider) -> Result<i64> {
        let id = self
            .conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO storage_providers (name, bucket, region, endpoint,
                     access_key, secret_key, used_bytes)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        provider.name,
                        provider.bucket,
                        provider.region,
                        provider.endpoint,
                        provider.access_key,
                        provider.secret_key,
                        to_i64(provider.used_bytes),
                    ],
                )?;
                Ok::<i64, rusqlite::Error>(c.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    pub async fn insert_site(&self, site: Site) -> Result<i64> {
        let id = self
            .conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO sites (uuid, node_id, name, owner_email, is_active,
                     content_path, db_name, db_user, db_password, db_host, storage_provider_id,
                     schedule_frequency, schedule_time, schedule_days, retention_copies,
                     next_run_at, backup_status, storage_used_bytes, storage_quota_bytes)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                     ?15, ?16, ?17, ?18, ?19)",
                    params![
                        site.uuid,
                        site.node_id,
                        site.name,
                        site.owner_email,
                        site.is_active,
                        site.content_path,
                        site.db_name,
                        site.db_user,
                        site.db_password,
                        site.db_host,
                        site.storage_provider_id,
                        site.schedule_frequency,
                        site.schedule_time,
                        site.schedule_days,
                        site.retention_copies,
                        site.next_run_at.map(|t| t.timestamp()),
                        site.backup_status.as_str(),
                        to_i64(site.storage_used_bytes),
                        site.storage_quota_bytes.map(to_i64),
                    ],
                )?;
                Ok::<i64, rusqlite::Error>(c.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    async fn query_sites(&self, filter: &'static str, args: Vec<i64>) -> Result<Vec<Site>> {
        let sites = self
            .conn
            .call(move |c| {
                let sql = format!("SELECT {} FROM sites {} ORDER BY id", SITE_COLUMNS, filter);
                let mut stmt = c.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(args), site_from_row)?;
                rows.collect::<rusqlite::Result<Vec<Site>>>()
            })
            .await?;
        Ok(sites)
    }

    async fn query_backups(&self, filter: &'static str, args: Vec<i64>) -> Result<Vec<BackupRecord>> {
        let backups = self
            .conn
            .call(move |c| {
                let sql = format!("SELECT {} FROM backups {}", BACKUP_COLUMNS, filter);
                let mut stmt = c.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(args), backup_from_row)?;
                rows.collect::<rusqlite::Result<Vec<BackupRecord>>>()
            })
            .await?;
        Ok(backups)
    }
}

#[async_trait]
impl BackupStore for SqliteStore {
    async fn due_sites(&self, now: DateTime<Utc>) -> Result<Vec<Site>> {
        self.query_sites(
            "WHERE is_active = 1 AND lower(trim(schedule_frequency)) NOT IN ('', 'manual')
             AND next_run_at IS NOT NULL AND next_run_at <= ?1",
            vec![now.timestamp()],
        )
        .await
    }

    async fn unscheduled_sites(&self) -> Result<Vec<Site>> {
        self.query_sites(
            "WHERE is_active = 1 AND lower(trim(schedule_frequency)) NOT IN ('', 'manual')
             AND next_run_at IS NULL",
            vec![],
        )
        .await
    }

    async fn get_site(&self, site_id: i64) -> Result<Option<Site>> {
        Ok(self
            .query_sites("WHERE id = ?1", vec![site_id])
            .await?
            .into_iter()
            .next())
    }

    async fn list_sites(&self) -> Result<Vec<Site>> {
        self.query_sites("", vec![]).await
    }

    async fn sites_for_node(&self, node_id: i64) -> Result<Vec<Site>> {
        self.query_sites("WHERE node_id = ?1", vec![node_id]).await
    }

    async fn get_node(&self, node_id: i64) -> Result<Option<Node>> {
        let node = self
            .conn
            .call(move |c| {
                c.query_row(
                    &format!("SELECT {} FROM nodes WHERE id = ?1", NODE_COLUMNS),
                    params![node_id],
                    node_from_row,
                )
                .optional()
            })
            .await?;
        Ok(node)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes = self
            .conn
            .call(|c| {
                let mut stmt = c.prepare(&format!("SELECT {} FROM nodes ORDER BY id", NODE_COLUMNS))?;
                let rows = stmt.query_map([], node_from_row)?;
                rows.collect::<rusqlite::Result<Vec<Node>>>()
            })
            .await?;
        Ok(nodes)
    }

    async fn get_provider(&self, provider_id: i64) -> Result<Option<StorageProvider>> {
        let provider = self
            .conn
            .call(move |c| {
                c.query_row(
                    &format!(
                        "SELECT {} FROM storage_providers WHERE id = ?1",
                        PROVIDER_COLUMNS
                    ),
                    params![provider_id],
                    provider_from_row,
                )
                .optional()
            })
            .await?;
        Ok(provider)
    }

    async fn running_counts_by_node(&self) -> Result<HashMap<i64, u32>> {
        let counts = self
            .conn
            .call(|c| {
                let mut stmt = c.prepare(
                    "SELECT node_id, COUNT(*) FROM sites
                     WHERE backup_status = 'running' GROUP BY node_id",
                )?;
                let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, u32>(1)?)))?;
                rows.collect::<rusqlite::Result<HashMap<i64, u32>>>()
            })
            .await?;
        Ok(counts)
    }

    async fn try_mark_site_running(
        &self,
        site_id: i64,
        job_id: &str,
        message: &str,
        reschedule: Reschedule,
    ) -> Result<bool> {
        let job_id = job_id.to_string();
        let message = message.to_string();
        let (set_next, next) = match reschedule {
            Reschedule::Keep => (false, None),
            Reschedule::To(next) => (true, next.map(|t| t.timestamp())),
        };
        let changed = self
            .conn
            .call(move |c| {
                c.execute(
                    "UPDATE sites SET backup_status = 'running', backup_progress = 0,
                     backup_message = ?3, backup_error = NULL, backup_job_id = ?2,
                     next_run_at = CASE WHEN ?4 THEN ?5 ELSE next_run_at END
                     WHERE id = ?1 AND backup_status != 'running'",
                    params![site_id, job_id, message, set_next, next],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    async fn set_next_run_at(&self, site_id: i64, next: Option<DateTime<Utc>>) -> Result<()> {
        self.conn
            .call(move |c| {
                c.execute(
                    "UPDATE sites SET next_run_at = ?2 WHERE id = ?1",
                    params![site_id, next.map(|t| t.timestamp())],
                )
            })
            .await?;
        Ok(())
    }

    async fn update_site_progress(
        &self,
        site_id: i64,
        job_id: &str,
        progress: u8,
        message: &str,
    ) -> Result<()> {
        let job_id = job_id.to_string();
        let message = message.to_string();
        self.conn
            .call(move |c| {
                c.execute(
                    "UPDATE sites SET backup_progress = ?3, backup_message = ?4
                     WHERE id = ?1 AND backup_job_id = ?2 AND backup_status = 'running'",
                    params![site_id, job_id, progress, message],
                )
            })
            .await?;
        Ok(())
    }

    async fn finish_site_backup(
        &self,
        site_id: i64,
        job_id: &str,
        status: SiteBackupStatus,
        message: &str,
        error: Option<&str>,
        finished_at: DateTime<Utc>,
    ) -> Result<bool> {
        let job_id = job_id.to_string();
        let message = message.to_string();
        let error = error.map(str::to_string);
        let completed = status == SiteBackupStatus::Completed;

        let changed = self
            .conn
            .call(move |c| {
                c.execute(
                    "UPDATE sites SET backup_status = ?2, backup_message = ?3, backup_error = ?4,
                     backup_progress = CASE WHEN ?5 THEN 100 ELSE backup_progress END,
                     last_backup_at = CASE WHEN ?5 THEN ?6 ELSE last_backup_at END
                     WHERE id = ?1 AND backup_job_id = ?7 AND backup_status = 'running'",
                    params![
                        site_id,
                        status.as_str(),
                        message,
                        error,
                        completed,
                        finished_at.timestamp(),
                        job_id
                    ],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    async fn insert_backup(&self, record: NewBackupRecord) -> Result<i64> {
        let id = self
            .conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO backups (site_id, provider_id, filename, remote_path, size_bytes,
                     checksum, status, created_at, completed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        record.site_id,
                        record.provider_id,
                        record.filename,
                        record.remote_path,
                        to_i64(record.size_bytes),
                        record.checksum,
                        record.status.as_str(),
                        record.created_at.timestamp(),
                        record.completed_at.map(|t| t.timestamp()),
                    ],
                )?;
                Ok::<i64, rusqlite::Error>(c.last_insert_rowid())
            })
            .await?;

        debug!(backup_id = id, "Backup record inserted");
        Ok(id)
    }

    async fn successful_backups(&self, site_id: i64) -> Result<Vec<BackupRecord>> {
        self.query_backups(
            "WHERE site_id = ?1 AND status = 'completed' ORDER BY created_at ASC, id ASC",
            vec![site_id],
        )
        .await
    }

    async fn backups_due_for_deletion(&self, now: DateTime<Utc>) -> Result<Vec<BackupRecord>> {
        self.query_backups(
            "WHERE scheduled_deletion IS NOT NULL AND scheduled_deletion <= ?1
             ORDER BY scheduled_deletion ASC, id ASC",
            vec![now.timestamp()],
        )
        .await
    }

    async fn schedule_backup_deletion(&self, backup_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.conn
            .call(move |c| {
                c.execute(
                    "UPDATE backups SET scheduled_deletion = ?2
                     WHERE id = ?1 AND scheduled_deletion IS NULL",
                    params![backup_id, at.timestamp()],
                )
            })
            .await?;
        Ok(())
    }

    async fn delete_backup(&self, backup_id: i64) -> Result<()> {
        self.conn
            .call(move |c| c.execute("DELETE FROM backups WHERE id = ?1", params![backup_id]))
            .await?;
        Ok(())
    }

    async fn adjust_usage(
        &self,
        site_id: i64,
        node_id: i64,
        provider_id: Option<i64>,
        delta: i64,
    ) -> Result<()> {
        self.conn
            .call(move |c| {
                let tx = c.transaction()?;

                tx.execute(
                    "UPDATE sites SET storage_used_bytes = MAX(0, storage_used_bytes + ?2)
                     WHERE id = ?1",
                    params![site_id, delta],
                )?;
                tx.execute(
                    "UPDATE nodes SET storage_used_bytes = MAX(0, storage_used_bytes + ?2)
                     WHERE id = ?1",
                    params![node_id, delta],
                )?;
                if let Some(provider_id) = provider_id {
                    tx.execute(
                        "UPDATE storage_providers SET used_bytes = MAX(0, used_bytes + ?2)
                         WHERE id = ?1",
                        params![provider_id, delta],
                    )?;
                }

                tx.commit()?;
                Ok::<(), rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn set_site_usage(&self, site_id: i64, bytes: u64) -> Result<()> {
        self.conn
            .call(move |c| {
                c.execute(
                    "UPDATE sites SET storage_used_bytes = ?2 WHERE id = ?1",
                    params![site_id, to_i64(bytes)],
                )
            })
            .await?;
        Ok(())
    }

    async fn set_node_usage(&self, node_id: i64, bytes: u64) -> Result<()> {
        self.conn
            .call(move |c| {
                c.execute(
                    "UPDATE nodes SET storage_used_bytes = ?2 WHERE id = ?1",
                    params![node_id, to_i64(bytes)],
                )
            })
            .await?;
        Ok(())
    }

    async fn set_over_quota(&self, site_id: i64, since: Option<DateTime<Utc>>) -> Result<()> {
        self.conn
            .call(move |c| {
                c.execute(
                    "UPDATE sites SET over_quota_since = ?2 WHERE id = ?1",
                    params![site_id, since.map(|t| t.timestamp())],
                )
            })
            .await?;
        Ok(())
    }

    async fn release_running_sites(&self, error: &str) -> Result<usize> {
        let error = error.to_string();
        let released = self
            .conn
            .call(move |c| {
                c.execute(
                    "UPDATE sites SET backup_status = 'failed', backup_message = 'Backup interrupted',
                     backup_error = ?1 WHERE backup_status = 'running'",
                    params![error],
                )
            })
            .await?;
        if released > 0 {
            debug!(released, "Released sites left running");
        }
        Ok(released)
    }
}

fn to_i64(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

fn from_ts(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}

fn site_from_row(row: &Row<'_>) -> rusqlite::Result<Site> {
    let status: String = row.get(17)?;
    Ok(Site {
        id: row.get(0)?,
        uuid: row.get(1)?,
        node_id: row.get(2)?,
        name: row.get(3)?,
        owner_email: row.get(4)?,
        is_active: row.get(5)?,
        content_path: row.get(6)?,
        db_name: row.get(7)?,
        db_user: row.get(8)?,
        db_password: row.get(9)?,
        db_host: row.get(10)?,
        storage_provider_id: row.get(11)?,
        schedule_frequency: row.get(12)?,
        schedule_time: row.get(13)?,
        schedule_days: row.get(14)?,
        retention_copies: row.get(15)?,
        next_run_at: from_ts(row.get(16)?),
        backup_status: status.parse().map_err(|e| conversion_error(17, e))?,
        backup_progress: row.get(18)?,
        backup_message: row.get(19)?,
        backup_error: row.get(20)?,
        last_backup_at: from_ts(row.get(21)?),
        storage_used_bytes: to_u64(row.get(22)?),
        storage_quota_bytes: row.get::<_, Option<i64>>(23)?.map(to_u64),
        over_quota_since: from_ts(row.get(24)?),
        backup_job_id: row.get(25)?,
    })
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: row.get(0)?,
        uuid: row.get(1)?,
        name: row.get(2)?,
        timezone: row.get(3)?,
        max_concurrent_backups: row.get(4)?,
        max_retention_copies: row.get(5)?,
        storage_used_bytes: to_u64(row.get(6)?),
        storage_quota_bytes: row.get::<_, Option<i64>>(7)?.map(to_u64),
    })
}

fn provider_from_row(row: &Row<'_>) -> rusqlite::Result<StorageProvider> {
    Ok(StorageProvider {
        id: row.get(0)?,
        name: row.get(1)?,
        bucket: row.get(2)?,
        region: row.get(3)?,
        endpoint: row.get(4)?,
        access_key: row.get(5)?,
        secret_key: row.get(6)?,
        used_bytes: to_u64(row.get(7)?),
    })
}

fn backup_from_row(row: &Row<'_>) -> rusqlite::Result<BackupRecord> {
    let status: String = row.get(7)?;
    let created_at: i64 = row.get(8)?;
    Ok(BackupRecord {
        id: row.get(0)?,
        site_id: row.get(1)?,
        provider_id: row.get(2)?,
        filename: row.get(3)?,
        remote_path: row.get(4)?,
        size_bytes: to_u64(row.get(5)?),
        checksum: row.get(6)?,
        status: status
            .parse::<BackupStatus>()
            .map_err(|e| conversion_error(7, e))?,
        created_at: from_ts(Some(created_at)).unwrap_or_default(),
        completed_at: from_ts(row.get(9)?),
        scheduled_deletion: from_ts(row.get(10)?),
    })
}
