pub mod dispatcher;
pub mod governor;
pub mod maintenance;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod reconcile;
pub mod retention;
pub mod schedule;
pub mod scheduler;
pub mod storage;

pub use dispatcher::Dispatcher;
pub use governor::ResourceGovernor;
pub use models::{BackupJob, JobStatus, StageResult, StageStatus};
pub use orchestrator::Orchestrator;
pub use progress::ProgressTracker;
pub use queue::{JobObserver, JobQueue, QueueError};
pub use scheduler::Scheduler;
