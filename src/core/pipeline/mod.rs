//! Staged backup pipelines.
//!
//! A module is an ordered list of stage names plus a function that runs one
//! stage against the job's [`BackupContext`]. The [`PipelineExecutor`] drives
//! the stages and records results on the job queue.

mod context;
mod executor;
pub mod process;
mod site_backup;
mod stages;

pub use context::{BackupContext, Destination, keys};
pub use executor::PipelineExecutor;
pub use site_backup::SiteBackupModule;
pub(crate) use stages::data;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::models::StageResult;

#[async_trait]
pub trait BackupModule: Send + Sync {
    fn name(&self) -> &str;

    fn stages(&self) -> Vec<String>;

    /// Run one stage. Failures are reported through the result, never returned as errors.
    async fn run_stage(&self, stage: &str, ctx: &mut BackupContext) -> StageResult;
}

/// Name → module lookup, populated explicitly at startup.
#[derive(Default, Clone)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn BackupModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, module: Arc<dyn BackupModule>) {
        self.modules.insert(name.into(), module);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BackupModule>> {
        self.modules.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }
}
