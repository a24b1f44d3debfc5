//! Process-wide resource gates shared by every running backup.
//!
//! - Disk I/O and network permits (small counting semaphores)
//! - A fixed-size pool for blocking, CPU-bound work
//! - An upload bandwidth limiter with a one-second accounting window
//!
//! Permits are RAII guards: dropping one releases it on every exit path,
//! including errors and task cancellation.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Duration, Instant, sleep};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

/// How often a throttled upload re-checks the bandwidth window.
const BANDWIDTH_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    pub io_permits: usize,
    pub network_permits: usize,
    pub cpu_workers: usize,
    /// Upload ceiling in bytes per second. 0 disables throttling.
    pub upload_bandwidth_bytes_per_sec: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            io_permits: 2,
            network_permits: 1,
            cpu_workers: 4,
            upload_bandwidth_bytes_per_sec: 0,
        }
    }
}

/// Scoped permit for a governed operation. Released on drop.
#[derive(Debug)]
pub struct GovernorPermit {
    _permit: OwnedSemaphorePermit,
}

pub struct ResourceGovernor {
    io: Arc<Semaphore>,
    network: Arc<Semaphore>,
    cpu: CpuPool,
    bandwidth: BandwidthLimiter,
}

impl ResourceGovernor {
    pub fn new(config: &GovernorConfig) -> Self {
        Self {
            io: Arc::new(Semaphore::new(config.io_permits.max(1))),
            network: Arc::new(Semaphore::new(config.network_permits.max(1))),
            cpu: CpuPool::new(config.cpu_workers),
            bandwidth: BandwidthLimiter::new(config.upload_bandwidth_bytes_per_sec),
        }
    }

    /// Wait for a disk I/O slot.
    pub async fn acquire_io(&self) -> GovernorPermit {
        Self::acquire(&self.io, "io").await
    }

    /// Wait for a network slot.
    pub async fn acquire_network(&self) -> GovernorPermit {
        Self::acquire(&self.network, "network").await
    }

    async fn acquire(semaphore: &Arc<Semaphore>, kind: &'static str) -> GovernorPermit {
        trace!(kind, available = semaphore.available_permits(), "Waiting for permit");
        // The governor never closes its semaphores, so acquisition only ever waits.
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("governor semaphore is never closed");
        GovernorPermit { _permit: permit }
    }

    pub fn cpu(&self) -> &CpuPool {
        &self.cpu
    }

    pub fn bandwidth(&self) -> &BandwidthLimiter {
        &self.bandwidth
    }

    pub fn available_io_permits(&self) -> usize {
        self.io.available_permits()
    }

    pub fn available_network_permits(&self) -> usize {
        self.network.available_permits()
    }

    /// Stop accepting CPU work and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        self.cpu.shutdown().await;
    }
}

/// Fixed-size pool for blocking work.
///
/// Work runs on tokio's blocking threads; a semaphore caps how many run at once
/// and a task tracker lets shutdown wait for everything in flight.
pub struct CpuPool {
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl CpuPool {
    pub fn new(workers: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(workers.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// Run a blocking closure on the pool and wait for its result.
    pub async fn run<F, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(anyhow!("CPU pool is shut down"));
        }

        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("CPU pool is shut down"))?;

        let handle = self.tracker.spawn_blocking(move || {
            let _permit = permit;
            work()
        });

        handle
            .await
            .map_err(|e| anyhow!("CPU pool task failed: {}", e))
    }

    pub async fn shutdown(&self) {
        self.tracker.close();
        debug!(in_flight = self.tracker.len(), "Draining CPU pool");
        self.tracker.wait().await;
        self.slots.close();
        info!("CPU pool drained");
    }
}

/// Sliding one-second accounting window for upload bandwidth.
///
/// Cheap to clone; clones share the same window.
#[derive(Clone)]
pub struct BandwidthLimiter {
    bytes_per_sec: u64,
    window: Arc<Mutex<Window>>,
}

struct Window {
    started: Instant,
    used: u64,
}

impl BandwidthLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            window: Arc::new(Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_limited(&self) -> bool {
        self.bytes_per_sec > 0
    }

    /// Wait until `bytes` fit into the current one-second window, then account for them.
    ///
    /// A chunk larger than the whole ceiling is admitted once the window is empty.
    pub async fn consume(&self, bytes: u64) {
        if !self.is_limited() {
            return;
        }

        loop {
            if self.try_consume(bytes) {
                return;
            }
            sleep(BANDWIDTH_POLL_INTERVAL).await;
        }
    }

    fn try_consume(&self, bytes: u64) -> bool {
        let mut window = self
            .window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if window.started.elapsed() >= Duration::from_secs(1) {
            window.started = Instant::now();
            window.used = 0;
        }

        if window.used == 0 || window.used + bytes <= self.bytes_per_sec {
            window.used += bytes;
            true
        } else {
            false
        }
    }
}
