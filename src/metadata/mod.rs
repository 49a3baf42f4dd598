//! One JSON record per backup attempt, completed or failed.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::{Result, VaultError};
use crate::models::BackupRecord;

pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        MetadataStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{YYYYMMDD_HHMMSS}_{id}.json`, so lexical order is chronological order.
    pub fn file_name(record: &BackupRecord) -> String {
        format!(
            "{}_{}.json",
            record.timestamp.format("%Y%m%d_%H%M%S"),
            record.id
        )
    }

    pub fn save(&self, record: &BackupRecord) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            VaultError::Metadata(format!("failed to create {}: {e}", self.dir.display()))
        })?;
        let path = self.dir.join(Self::file_name(record));
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| VaultError::Metadata(format!("failed to serialize record: {e}")))?;
        fs::write(&path, json)
            .map_err(|e| VaultError::Metadata(format!("failed to write {}: {e}", path.display())))?;
        debug!(id = %record.id, file = %path.display(), "metadata saved");
        Ok(path)
    }

    fn record_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            VaultError::Metadata(format!("failed to read {}: {e}", self.dir.display()))
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        files.reverse();
        Ok(files)
    }

    fn read(path: &Path) -> std::result::Result<BackupRecord, String> {
        let raw = fs::read_to_string(path).map_err(|e| e.to_string())?;
        serde_json::from_str(&raw).map_err(|e| e.to_string())
    }

    /// Up to `limit` records, newest first. Unreadable files are skipped.
    pub fn list(&self, limit: usize) -> Result<Vec<BackupRecord>> {
        let mut records = Vec::new();
        for path in self.record_files()? {
            if records.len() >= limit {
                break;
            }
            match Self::read(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!(file = %path.display(), error = %e, "skipping unreadable metadata"),
            }
        }
        Ok(records)
    }

    pub fn get(&self, id: &str) -> Result<BackupRecord> {
        let suffix = format!("_{id}.json");
        let path = self
            .record_files()?
            .into_iter()
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(&suffix))
            })
            .ok_or_else(|| VaultError::BackupNotFound(id.to_string()))?;
        Self::read(&path)
            .map_err(|e| VaultError::Metadata(format!("failed to read {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        BackupStatus, BackupType, CompressionAlgorithm, ConnectionSpec, DatabaseKind, Secret,
        StorageKind,
    };
    use chrono::{Duration, Utc};

    fn record(db: &str, minutes_ago: i64) -> BackupRecord {
        let spec = ConnectionSpec::new(DatabaseKind::Postgres, db)
            .with_credentials("admin", Some(Secret::new("hunter2")));
        let mut record = BackupRecord::pending(
            &spec,
            BackupType::Full,
            CompressionAlgorithm::Zstd,
            StorageKind::Local,
            None,
        );
        record.timestamp = Utc::now() - Duration::minutes(minutes_ago);
        record
    }

    #[test]
    fn saved_record_round_trips_without_secrets() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = MetadataStore::new(tmp.path().join("metadata"));
        let mut rec = record("app", 0);
        rec.status = BackupStatus::Failed;
        rec.error_message = Some("pg_dump failed (exit status: 1): boom".into());

        let path = store.save(&rec)?;
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name.ends_with(&format!("_{}.json", rec.id)));

        let raw = fs::read_to_string(&path)?;
        assert!(!raw.contains("hunter2"));
        assert_eq!(store.get(&rec.id)?, rec);
        Ok(())
    }

    #[test]
    fn list_is_newest_first_and_limited() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = MetadataStore::new(tmp.path());
        for (db, age) in [("old", 300), ("newest", 1), ("middle", 60)] {
            store.save(&record(db, age))?;
        }

        let names: Vec<_> = store
            .list(10)?
            .into_iter()
            .map(|r| r.database_name)
            .collect();
        assert_eq!(names, vec!["newest", "middle", "old"]);
        assert_eq!(store.list(2)?.len(), 2);
        Ok(())
    }

    #[test]
    fn corrupt_files_are_skipped() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = MetadataStore::new(tmp.path());
        store.save(&record("app", 5))?;
        fs::write(tmp.path().join("99999999_999999_garbage.json"), "{not json")?;
        fs::write(tmp.path().join("notes.txt"), "ignored")?;

        let records = store.list(10)?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].database_name, "app");
        Ok(())
    }

    #[test]
    fn missing_dir_and_unknown_id() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = MetadataStore::new(tmp.path().join("absent"));
        assert!(store.list(5)?.is_empty());
        assert!(matches!(
            store.get("deadbeef"),
            Err(VaultError::BackupNotFound(id)) if id == "deadbeef"
        ));
        Ok(())
    }
}
