use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::ProgressTracker;
use crate::core::governor::ResourceGovernor;
use crate::core::notifications::{Notifier, create_notifier};
use crate::core::pipeline::{BackupModule, ModuleRegistry, SiteBackupModule};
use crate::core::queue::JobQueue;
use crate::core::storage::{DestinationResolver, S3Resolver, SimulatedResolver};
use crate::db::BackupStore;

/// Process-wide services, built once at startup and handed to every loop.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn BackupStore>,
    pub queue: Arc<JobQueue>,
    pub governor: Arc<ResourceGovernor>,
    pub modules: ModuleRegistry,
    pub resolver: Arc<dyn DestinationResolver>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub progress: ProgressTracker,
}

impl AppContext {
    pub fn new(config: AppConfig, store: Arc<dyn BackupStore>) -> Self {
        let governor = Arc::new(ResourceGovernor::new(&config.governor));

        let queue = Arc::new(JobQueue::new());
        let progress = ProgressTracker::new();
        queue.subscribe(Arc::new(progress.clone()));

        let mut modules = ModuleRegistry::new();
        modules.register(
            SiteBackupModule::NAME,
            Arc::new(SiteBackupModule::new(
                governor.clone(),
                config.tools.clone(),
                config.storage.clone(),
            )),
        );

        let resolver: Arc<dyn DestinationResolver> = if config.simulation {
            Arc::new(SimulatedResolver::new())
        } else {
            Arc::new(S3Resolver::new(config.storage.upload_chunk_bytes))
        };

        let notifier = create_notifier(&config.notifications);

        Self {
            config: Arc::new(config),
            store,
            queue,
            governor,
            modules,
            resolver,
            notifier,
            progress,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DestinationResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_notifier(mut self, notifier: Option<Arc<dyn Notifier>>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Register an extra module, replacing any module of the same name.
    pub fn with_module(mut self, name: &str, module: Arc<dyn BackupModule>) -> Self {
        self.modules.register(name, module);
        self
    }
}
