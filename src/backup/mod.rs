mod logic;

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::models::{BackupType, CompressionSettings, DatabaseKind};

pub use logic::run_backup;

/// Steps of one backup run, in order. `Failed` can follow any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Pending,
    Connecting,
    Dumping,
    Compressing,
    Checksumming,
    Uploading,
    Completed,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Pending => "pending",
            PipelineStage::Connecting => "connecting",
            PipelineStage::Dumping => "dumping",
            PipelineStage::Compressing => "compressing",
            PipelineStage::Checksumming => "checksumming",
            PipelineStage::Uploading => "uploading",
            PipelineStage::Completed => "completed",
            PipelineStage::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything one backup run needs besides the engine, which carries the
/// connection, and the storage handle.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub backup_type: BackupType,
    pub tables: Option<Vec<String>>,
    pub compression: CompressionSettings,
    /// Where the raw dump and the compressed artifact are staged before upload.
    pub work_dir: PathBuf,
}

impl BackupRequest {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        BackupRequest {
            backup_type: BackupType::Full,
            tables: None,
            compression: CompressionSettings::default(),
            work_dir: work_dir.into(),
        }
    }
}

/// `{kind}/{database label}/{YYYY-MM-DD}/{file_name}`.
pub fn remote_key(kind: DatabaseKind, label: &str, at: DateTime<Utc>, file_name: &str) -> String {
    format!("{kind}/{label}/{}/{file_name}", at.format("%Y-%m-%d"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConnectionSpec;
    use chrono::TimeZone;

    #[test]
    fn key_layout_groups_by_engine_database_and_day() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 1).unwrap();
        assert_eq!(
            remote_key(DatabaseKind::Postgres, "app", at, "postgres_app_20240309_235901.dump.zst"),
            "postgres/app/2024-03-09/postgres_app_20240309_235901.dump.zst"
        );
        let sqlite = ConnectionSpec::sqlite("/var/lib/shop.db");
        assert_eq!(
            remote_key(sqlite.kind, &sqlite.database_label(), at, "x.db"),
            "sqlite/shop/2024-03-09/x.db"
        );
    }
}
