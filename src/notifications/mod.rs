//! Post-run notifications. Delivery is best effort and never fails a backup.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::NotificationConfig;
use crate::errors::Result;
use crate::models::{BackupRecord, BackupStatus};

pub mod slack;

pub use slack::SlackNotifier;

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, record: &BackupRecord) -> Result<()>;
}

/// Whether `config` asks for a message about a run that ended like `record`.
pub fn wants(config: &NotificationConfig, record: &BackupRecord) -> bool {
    match record.status {
        BackupStatus::Completed => config.notify_on_success,
        BackupStatus::Failed => config.notify_on_failure,
        BackupStatus::Pending | BackupStatus::InProgress => false,
    }
}

/// The configured notifier, if any.
pub fn from_config(config: &NotificationConfig) -> Result<Option<Box<dyn Notifier>>> {
    match &config.slack_webhook_url {
        Some(url) if !url.expose().is_empty() => {
            Ok(Some(Box::new(SlackNotifier::new(url.clone())?)))
        }
        _ => Ok(None),
    }
}

/// Sends `record` through `notifier` when `config` allows it. Returns whether a
/// message went out; delivery errors are logged and swallowed.
pub async fn dispatch(
    notifier: Option<&dyn Notifier>,
    config: &NotificationConfig,
    record: &BackupRecord,
) -> bool {
    let Some(notifier) = notifier else {
        return false;
    };
    if !wants(config, record) {
        debug!(id = %record.id, status = %record.status, "notification not wanted");
        return false;
    }
    match notifier.notify(record).await {
        Ok(()) => true,
        Err(e) => {
            warn!(notifier = notifier.name(), id = %record.id, error = %e, "notification failed");
            false
        }
    }
}
