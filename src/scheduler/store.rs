use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::parse_cron;
use crate::config::{NotificationConfig, StorageConfig, write_private};
use crate::errors::{Result, VaultError};
use crate::models::{BackupType, CompressionSettings, ConnectionSpec};

fn enabled_by_default() -> bool {
    true
}

/// A persisted backup job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub name: String,
    /// Five-field crontab expression, evaluated in local time.
    pub cron: String,
    pub database: ConnectionSpec,
    #[serde(default)]
    pub backup_type: BackupType,
    #[serde(default)]
    pub tables: Option<Vec<String>>,
    #[serde(default)]
    pub compression: CompressionSettings,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    pub fn new(
        id: impl Into<String>,
        cron: impl Into<String>,
        database: ConnectionSpec,
        storage: StorageConfig,
    ) -> Self {
        let id = id.into();
        ScheduleEntry {
            name: id.clone(),
            id,
            cron: cron.into(),
            database,
            backup_type: BackupType::Full,
            tables: None,
            compression: CompressionSettings::default(),
            storage,
            notification: NotificationConfig::default(),
            enabled: true,
            created_at: Utc::now(),
            last_run: None,
        }
    }

    /// Next firing after `now`, or `None` while paused.
    pub fn next_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.enabled {
            return None;
        }
        let schedule = parse_cron(&self.cron).ok()?;
        schedule
            .after(&now.with_timezone(&chrono::Local))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Jobs file. Every operation reads and rewrites the whole file so a running
/// scheduler and the CLI see each other's changes.
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JobStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> Result<Vec<ScheduleEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path).map_err(|e| {
            VaultError::Scheduler(format!("failed to read {}: {e}", self.path.display()))
        })?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|e| {
            VaultError::Scheduler(format!("invalid jobs file {}: {e}", self.path.display()))
        })
    }

    fn save(&self, jobs: &[ScheduleEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                VaultError::Scheduler(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let content = serde_json::to_string_pretty(jobs)
            .map_err(|e| VaultError::Scheduler(format!("failed to serialize jobs: {e}")))?;
        // Entries carry database credentials.
        write_private(&self.path, content.as_bytes()).map_err(|e| {
            VaultError::Scheduler(format!("failed to write {}: {e}", self.path.display()))
        })
    }

    fn update<F>(&self, id: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ScheduleEntry),
    {
        let mut jobs = self.list()?;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| VaultError::Scheduler(format!("no scheduled job with id '{id}'")))?;
        apply(job);
        self.save(&jobs)
    }

    pub fn get(&self, id: &str) -> Result<ScheduleEntry> {
        self.list()?
            .into_iter()
            .find(|j| j.id == id)
            .ok_or_else(|| VaultError::Scheduler(format!("no scheduled job with id '{id}'")))
    }

    /// Adds `entry`, replacing any job with the same id.
    pub fn add(&self, entry: ScheduleEntry) -> Result<()> {
        parse_cron(&entry.cron)?;
        entry.compression.validate()?;
        let mut jobs = self.list()?;
        jobs.retain(|j| j.id != entry.id);
        info!(
            job = %entry.id,
            cron = %entry.cron,
            database = %entry.database.describe(),
            "job added"
        );
        jobs.push(entry);
        self.save(&jobs)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let mut jobs = self.list()?;
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        if jobs.len() == before {
            return Err(VaultError::Scheduler(format!("no scheduled job with id '{id}'")));
        }
        self.save(&jobs)?;
        info!(job = id, "job removed");
        Ok(())
    }

    pub fn pause(&self, id: &str) -> Result<()> {
        self.update(id, |j| j.enabled = false)?;
        info!(job = id, "job paused");
        Ok(())
    }

    pub fn resume(&self, id: &str) -> Result<()> {
        self.update(id, |j| j.enabled = true)?;
        info!(job = id, "job resumed");
        Ok(())
    }

    pub fn record_run(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update(id, |j| j.last_run = Some(at))
    }
}
