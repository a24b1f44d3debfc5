use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::storage::ObjectStore;

/// Config keys understood by the site backup stages.
pub mod keys {
    pub const CONTENT_PATH: &str = "content_path";
    pub const DB_NAME: &str = "db_name";
    pub const DB_USER: &str = "db_user";
    pub const DB_PASSWORD: &str = "db_password";
    pub const DB_HOST: &str = "db_host";
    pub const DB_PORT: &str = "db_port";
    pub const NODE_UUID: &str = "node_uuid";
    pub const SITE_UUID: &str = "site_uuid";
    pub const NODE_NAME: &str = "node_name";
    pub const SITE_NAME: &str = "site_name";
}

/// Resolved upload target for one job.
#[derive(Clone)]
pub struct Destination {
    pub provider_id: i64,
    pub store: Arc<dyn ObjectStore>,
}

/// Working state owned by a single pipeline run.
pub struct BackupContext {
    pub job_id: String,
    pub target_id: i64,
    pub target_name: String,
    /// Opaque stage parameters (paths, credentials, identifiers)
    pub config: HashMap<String, String>,
    /// Per-run scratch directory, created by the first stage that needs it
    pub temp_dir: Option<PathBuf>,
    pub archive_path: Option<PathBuf>,
    pub remote_path: Option<String>,
    /// Values passed from one stage to a later one (sizes, names, checksums)
    pub data: Map<String, Value>,
    pub destination: Option<Destination>,
    pub cancel: CancellationToken,
    bytes_processed: Arc<AtomicU64>,
}

impl BackupContext {
    pub fn new(
        job_id: impl Into<String>,
        target_id: i64,
        target_name: impl Into<String>,
        config: HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            target_id,
            target_name: target_name.into(),
            config,
            temp_dir: None,
            archive_path: None,
            remote_path: None,
            data: Map::new(),
            destination: None,
            cancel,
            bytes_processed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_destination(mut self, destination: Option<Destination>) -> Self {
        self.destination = destination;
        self
    }

    /// Non-empty config value for `key`.
    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn set_data(&mut self, key: &str, value: impl Into<Value>) {
        self.data.insert(key.to_string(), value.into());
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn data_u64(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(Value::as_u64)
    }

    /// Shared counter handed to uploads and copies for progress reporting.
    pub fn byte_counter(&self) -> Arc<AtomicU64> {
        self.bytes_processed.clone()
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed.load(Ordering::Relaxed)
    }

    /// Scratch directory for this run, created under `work_dir` on first use.
    pub fn ensure_temp_dir(&mut self, work_dir: &std::path::Path) -> std::io::Result<PathBuf> {
        if let Some(dir) = &self.temp_dir {
            return Ok(dir.clone());
        }

        let dir = work_dir.join(format!("job-{}", self.job_id));
        std::fs::create_dir_all(&dir)?;
        debug!(job_id = %self.job_id, path = %dir.display(), "Created job workspace");
        self.temp_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Remove the scratch directory if it still exists.
    pub async fn remove_temp_dir(&mut self) {
        let Some(dir) = self.temp_dir.take() else {
            return;
        };

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(job_id = %self.job_id, path = %dir.display(), error = %e, "Failed to remove job workspace");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_temp_dir_lifecycle() {
        let work = tempfile::tempdir().unwrap();
        let mut ctx = BackupContext::new(
            "job-1",
            1,
            "example.com",
            HashMap::new(),
            CancellationToken::new(),
        );

        let dir = ctx.ensure_temp_dir(work.path()).unwrap();
        assert!(dir.exists());
        assert_eq!(ctx.ensure_temp_dir(work.path()).unwrap(), dir);

        ctx.remove_temp_dir().await;
        assert!(!dir.exists());
        assert!(ctx.temp_dir.is_none());
    }

    #[test]
    fn test_config_value_ignores_blank() {
        let mut config = HashMap::new();
        config.insert(keys::DB_NAME.to_string(), "  ".to_string());
        config.insert(keys::DB_USER.to_string(), "wp".to_string());
        let ctx = BackupContext::new("job-1", 1, "site", config, CancellationToken::new());

        assert_eq!(ctx.config_value(keys::DB_NAME), None);
        assert_eq!(ctx.config_value(keys::DB_USER), Some("wp"));
    }
}
