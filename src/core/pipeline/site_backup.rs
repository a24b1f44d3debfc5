use async_trait::async_trait;
use std::sync::Arc;

use super::stages::{self, StageName};
use super::{BackupContext, BackupModule};
use crate::config::{StorageConfig, ToolsConfig};
use crate::core::governor::ResourceGovernor;
use crate::core::models::StageResult;

/// Database dump + content archive of one site, bundled and shipped to object storage.
pub struct SiteBackupModule {
    pub(super) governor: Arc<ResourceGovernor>,
    pub(super) tools: ToolsConfig,
    pub(super) storage: StorageConfig,
}

impl SiteBackupModule {
    pub const NAME: &'static str = "backup";

    pub fn new(governor: Arc<ResourceGovernor>, tools: ToolsConfig, storage: StorageConfig) -> Self {
        Self {
            governor,
            tools,
            storage,
        }
    }
}

#[async_trait]
impl BackupModule for SiteBackupModule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn stages(&self) -> Vec<String> {
        StageName::ALL.iter().map(|s| s.as_str().to_string()).collect()
    }

    async fn run_stage(&self, stage: &str, ctx: &mut BackupContext) -> StageResult {
        let Some(stage) = StageName::parse(stage) else {
            return StageResult::failed(format!("Unknown stage: {}", stage));
        };

        match stage {
            StageName::DumpDatabase => stages::dump_database::run(self, ctx).await,
            StageName::ArchiveFiles => stages::archive_files::run(self, ctx).await,
            StageName::CreateBundle => stages::create_bundle::run(self, ctx).await,
            StageName::UploadRemote => stages::upload_remote::run(self, ctx).await,
            StageName::Cleanup => stages::cleanup::run(ctx).await,
        }
    }
}
