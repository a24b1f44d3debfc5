mod webhook;

pub use webhook::WebhookNotifier;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{NotificationChannelType, NotificationConfig};

/// Job lifecycle events worth telling a site owner about
#[derive(Debug, Clone)]
pub enum JobEvent {
    Started {
        job_id: String,
        site_name: String,
    },
    Completed {
        job_id: String,
        site_name: String,
        total_bytes: u64,
        duration_secs: u64,
    },
    Failed {
        job_id: String,
        site_name: String,
        error: String,
    },
}

impl JobEvent {
    pub fn subject(&self) -> String {
        match self {
            JobEvent::Started { site_name, .. } => format!("Backup started: {}", site_name),
            JobEvent::Completed { site_name, .. } => format!("Backup complete: {}", site_name),
            JobEvent::Failed { site_name, .. } => format!("Backup failed: {}", site_name),
        }
    }

    pub fn message(&self) -> String {
        match self {
            JobEvent::Started { job_id, site_name } => {
                format!("Job {} started for {}", short_id(job_id), site_name)
            }
            JobEvent::Completed {
                job_id,
                site_name,
                total_bytes,
                duration_secs,
            } => {
                let size_mb = *total_bytes as f64 / (1024.0 * 1024.0);
                let speed_mbps = if *duration_secs > 0 {
                    size_mb / *duration_secs as f64
                } else {
                    0.0
                };
                format!(
                    "Job {} finished for {}: {:.1} MB in {}s ({:.1} MB/s)",
                    short_id(job_id),
                    site_name,
                    size_mb,
                    duration_secs,
                    speed_mbps
                )
            }
            JobEvent::Failed {
                job_id,
                site_name,
                error,
            } => format!("Job {} failed for {}: {}", short_id(job_id), site_name, error),
        }
    }
}

fn short_id(job_id: &str) -> &str {
    &job_id[..8.min(job_id.len())]
}

/// Delivery channel for owner notifications and quota warnings.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, message: &str) -> Result<()>;
}

/// Writes notifications to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient: &str, subject: &str, message: &str) -> Result<()> {
        info!(recipient = %recipient, subject = %subject, "{}", message);
        Ok(())
    }
}

/// Factory function to create a notifier based on config
pub fn create_notifier(config: &NotificationConfig) -> Option<Arc<dyn Notifier>> {
    match &config.channel {
        NotificationChannelType::None => None,
        NotificationChannelType::Log => Some(Arc::new(LogNotifier)),
        NotificationChannelType::Webhook => {
            let url = config.webhook_url.as_ref()?;
            if url.is_empty() {
                warn!("Webhook notifications enabled without a webhook_url");
                return None;
            }
            Some(Arc::new(WebhookNotifier::new(url.clone())))
        }
    }
}

/// Send through `notifier` if there is one. Delivery errors are logged and dropped.
pub async fn deliver(
    notifier: Option<&Arc<dyn Notifier>>,
    recipient: &str,
    subject: &str,
    message: &str,
) -> bool {
    let Some(notifier) = notifier else {
        return false;
    };
    match notifier.send(recipient, subject, message).await {
        Ok(()) => true,
        Err(e) => {
            warn!(recipient = %recipient, subject = %subject, error = %e, "Notification failed");
            false
        }
    }
}

/// Announce a job event to the site owner.
pub async fn notify_job(notifier: Option<&Arc<dyn Notifier>>, recipient: &str, event: &JobEvent) {
    deliver(notifier, recipient, &event.subject(), &event.message()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Failing {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl Notifier for Failing {
        async fn send(&self, _: &str, _: &str, _: &str) -> Result<()> {
            *self.calls.lock().unwrap() += 1;
            anyhow::bail!("smtp down")
        }
    }

    #[test]
    fn test_factory() {
        assert!(create_notifier(&NotificationConfig::default()).is_none());
        assert!(
            create_notifier(&NotificationConfig {
                channel: NotificationChannelType::Log,
                webhook_url: None,
            })
            .is_some()
        );
        assert!(
            create_notifier(&NotificationConfig {
                channel: NotificationChannelType::Webhook,
                webhook_url: Some(String::new()),
            })
            .is_none()
        );
    }

    #[test]
    fn test_event_text() {
        let event = JobEvent::Completed {
            job_id: "0192c3f0-aaaa".to_string(),
            site_name: "Shop".to_string(),
            total_bytes: 10 * 1024 * 1024,
            duration_secs: 5,
        };
        assert_eq!(event.subject(), "Backup complete: Shop");
        assert_eq!(
            event.message(),
            "Job 0192c3f0 finished for Shop: 10.0 MB in 5s (2.0 MB/s)"
        );
    }

    #[tokio::test]
    async fn test_delivery_errors_are_swallowed() {
        let failing = Arc::new(Failing::default());
        let notifier: Arc<dyn Notifier> = failing.clone();

        let delivered = deliver(Some(&notifier), "owner@example.com", "s", "m").await;
        assert!(!delivered);
        assert_eq!(*failing.calls.lock().unwrap(), 1);
        assert!(!deliver(None, "owner@example.com", "s", "m").await);
    }
}
