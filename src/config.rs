//! Daemon configuration.
//!
//! Layered with figment: built-in defaults, then an optional TOML file, then
//! `SBKD_`-prefixed environment variables (`__` separates nested keys), then
//! command-line overrides.

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::governor::GovernorConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    pub json: bool,
    pub verbose: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            json: false,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    /// How long one dequeue waits before the dispatcher re-checks for shutdown
    pub queue_poll_ms: u64,
    pub scheduled_priority: i32,
    pub manual_priority: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            queue_poll_ms: 1000,
            scheduled_priority: 0,
            manual_priority: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms.max(10))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    pub dump_command: String,
    pub archive_command: String,
    pub dump_timeout_secs: u64,
    pub bundle_timeout_secs: u64,
    /// Captured stderr beyond this many bytes is truncated
    pub max_error_output: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            dump_command: "mysqldump".to_string(),
            archive_command: "tar".to_string(),
            dump_timeout_secs: 3600,
            bundle_timeout_secs: 1800,
            max_error_output: 4000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Parent of every per-job scratch directory
    pub work_dir: PathBuf,
    pub remote_prefix: String,
    pub upload_chunk_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("sbkd"),
            remote_prefix: "backups".to_string(),
            upload_chunk_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub default_copies: u32,
    pub deletion_grace_days: i64,
    pub quota_warning_percent: u8,
    pub reconcile_interval_secs: u64,
    pub sweep_interval_secs: u64,
    /// Report reconciliation drift without writing corrected counters
    pub dry_run: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            default_copies: 5,
            deletion_grace_days: 7,
            quota_warning_percent: 80,
            reconcile_interval_secs: 6 * 3600,
            sweep_interval_secs: 3600,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannelType {
    #[default]
    None,
    Log,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationConfig {
    pub channel: NotificationChannelType,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_path: PathBuf,
    /// Use in-memory object stores instead of real S3 endpoints
    pub simulation: bool,
    pub log: LogSettings,
    pub scheduler: SchedulerConfig,
    pub governor: GovernorConfig,
    pub tools: ToolsConfig,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub notifications: NotificationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("sbkd.db"),
            simulation: false,
            log: LogSettings::default(),
            scheduler: SchedulerConfig::default(),
            governor: GovernorConfig::default(),
            tools: ToolsConfig::default(),
            storage: StorageConfig::default(),
            retention: RetentionConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration. `overrides` is any serializable set of CLI values;
    /// fields it omits fall through to lower layers.
    pub fn new<T: Serialize>(config_path: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("SBKD_").split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract().context("Invalid configuration")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }
}
