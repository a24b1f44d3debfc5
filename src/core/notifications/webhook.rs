use super::Notifier;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

/// Posts notifications as JSON to an HTTP endpoint (Slack-compatible `text`).
pub struct WebhookNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(recipient: &str, subject: &str, message: &str) -> serde_json::Value {
        json!({
            "recipient": recipient,
            "subject": subject,
            "text": format!("*{}*\n{}", subject, message),
            "blocks": [
                {
                    "type": "header",
                    "text": {
                        "type": "plain_text",
                        "text": subject,
                        "emoji": true
                    }
                },
                {
                    "type": "section",
                    "fields": [
                        {
                            "type": "mrkdwn",
                            "text": format!("*Recipient:*\n{}", recipient)
                        }
                    ]
                },
                {
                    "type": "section",
                    "text": {
                        "type": "mrkdwn",
                        "text": message
                    }
                }
            ]
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, recipient: &str, subject: &str, message: &str) -> Result<()> {
        let payload = Self::format_message(recipient, subject, message);
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context("Webhook request failed")?
            .error_for_status()
            .context("Webhook rejected notification")?;
        Ok(())
    }
}
