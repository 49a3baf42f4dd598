use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use super::Notifier;
use crate::errors::{Result, VaultError};
use crate::models::{BackupRecord, BackupStatus, Secret};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

const SUCCESS_COLOR: &str = "#36a64f";
const FAILURE_COLOR: &str = "#e01e5a";

/// Slack incoming webhook.
pub struct SlackNotifier {
    webhook_url: Secret,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: Secret) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| VaultError::Notification(format!("failed to build HTTP client: {e}")))?;
        Ok(SlackNotifier {
            webhook_url,
            client,
        })
    }

    /// Block Kit message: header, summary fields, error block on failure, and
    /// an id/timestamp footer.
    pub fn payload(record: &BackupRecord) -> Value {
        let success = record.status == BackupStatus::Completed;
        let (color, emoji, outcome) = if success {
            (SUCCESS_COLOR, ":white_check_mark:", "Completed")
        } else {
            (FAILURE_COLOR, ":x:", "Failed")
        };

        let field = |label: &str, value: String| {
            json!({ "type": "mrkdwn", "text": format!("*{label}:*\n{value}") })
        };
        let fields = vec![
            field("Database", record.database_name.clone()),
            field("Type", record.database_type.to_string()),
            field("Backup Type", record.backup_type.to_string()),
            field("Duration", format!("{:.1}s", record.duration_seconds)),
            field("Size", record.size_human()),
            field("Storage", record.storage_type.to_string()),
        ];

        let mut blocks = vec![
            json!({
                "type": "header",
                "text": {
                    "type": "plain_text",
                    "text": format!("{emoji} DB Vault Backup {outcome}"),
                    "emoji": true,
                },
            }),
            json!({ "type": "section", "fields": fields }),
        ];

        if record.status == BackupStatus::Failed {
            if let Some(error) = record.error_message.as_deref().filter(|e| !e.is_empty()) {
                blocks.push(json!({
                    "type": "section",
                    "text": { "type": "mrkdwn", "text": format!("*Error:*\n```{error}```") },
                }));
            }
        }

        blocks.push(json!({
            "type": "context",
            "elements": [{
                "type": "mrkdwn",
                "text": format!("Backup ID: `{}` | {}", record.id, record.timestamp.to_rfc3339()),
            }],
        }));

        json!({ "attachments": [{ "color": color, "blocks": blocks }] })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn notify(&self, record: &BackupRecord) -> Result<()> {
        self.client
            .post(self.webhook_url.expose())
            .json(&Self::payload(record))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                VaultError::Notification(format!("Slack notification failed: {}", e.without_url()))
            })?;
        info!(id = %record.id, status = %record.status, "slack notification sent");
        Ok(())
    }
}
