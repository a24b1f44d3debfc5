use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::core::dispatcher::Dispatcher;
use crate::core::maintenance::MaintenanceLoop;
use crate::core::scheduler::Scheduler;

/// Runs the scheduler, dispatcher and maintenance loops until shutdown.
pub struct Orchestrator {
    ctx: AppContext,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops every loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start all loops and block until Ctrl-C or the shutdown token fires.
    pub async fn start(&self) -> Result<()> {
        info!(
            modules = ?self.ctx.modules.names(),
            simulation = self.ctx.config.simulation,
            "Daemon starting"
        );

        let released = self
            .ctx
            .store
            .release_running_sites("Interrupted by daemon restart")
            .await?;
        if released > 0 {
            warn!(released, "Released sites left running by a previous run");
        }

        let tracker = TaskTracker::new();
        let dispatcher = Arc::new(Dispatcher::new(self.ctx.clone()));

        let scheduler = Scheduler::new(self.ctx.clone());
        let token = self.shutdown.clone();
        tracker.spawn(async move { scheduler.run(token).await });

        let maintenance = MaintenanceLoop::new(self.ctx.clone());
        let token = self.shutdown.clone();
        tracker.spawn(async move { maintenance.run(token).await });

        let runner = dispatcher.clone();
        let token = self.shutdown.clone();
        tracker.spawn(async move { runner.run(token).await });
        tracker.close();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
            _ = self.shutdown.cancelled() => {}
        }

        self.shutdown.cancel();
        dispatcher.cancel_all().await;
        tracker.wait().await;

        self.ctx.governor.shutdown().await;
        info!("Daemon stopped");
        Ok(())
    }
}
