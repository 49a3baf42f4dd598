use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Firing, JobStore, ScheduleEntry, firing, parse_cron};
use crate::backup::{BackupRequest, run_backup};
use crate::engines::engine_for;
use crate::errors::Result;
use crate::metadata::MetadataStore;
use crate::models::BackupRecord;
use crate::notifications;
use crate::storage::open_storage;

/// Missed firings older than this are dropped instead of run late.
pub const MISFIRE_GRACE: Duration = Duration::from_secs(3600);

const DEFAULT_TICK: Duration = Duration::from_secs(5);

#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &ScheduleEntry) -> Result<BackupRecord>;
}

/// Runs a job through the backup pipeline and notifies per the job's settings.
pub struct BackupJobRunner {
    metadata_dir: PathBuf,
    work_dir: PathBuf,
}

impl BackupJobRunner {
    pub fn new(metadata_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        BackupJobRunner {
            metadata_dir: metadata_dir.into(),
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl JobRunner for BackupJobRunner {
    async fn run(&self, job: &ScheduleEntry) -> Result<BackupRecord> {
        let engine = engine_for(&job.database);
        let storage = open_storage(&job.storage).await?;
        let metadata = MetadataStore::new(&self.metadata_dir);
        let request = BackupRequest {
            backup_type: job.backup_type,
            tables: job.tables.clone(),
            compression: job.compression,
            work_dir: self.work_dir.join(&job.id),
        };
        let record = run_backup(engine.as_ref(), storage.as_ref(), &metadata, &request).await?;

        let notifier = notifications::from_config(&job.notification).unwrap_or_else(|e| {
            warn!(job = %job.id, error = %e, "notifier unavailable");
            None
        });
        notifications::dispatch(notifier.as_deref(), &job.notification, &record).await;
        Ok(record)
    }
}

/// Bookkeeping carried across ticks.
#[derive(Default)]
struct LoopState {
    /// Per job, the instant up to which firings have been handled.
    seen: HashMap<String, DateTime<Utc>>,
    active: Arc<Mutex<HashSet<String>>>,
    tasks: JoinSet<()>,
}

pub struct Scheduler {
    store: Arc<JobStore>,
    runner: Arc<dyn JobRunner>,
    grace: Duration,
    tick: Duration,
}

impl Scheduler {
    pub fn new(store: JobStore, runner: Arc<dyn JobRunner>) -> Self {
        Scheduler {
            store: Arc::new(store),
            runner,
            grace: MISFIRE_GRACE,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Checks every job each tick until `cancel` fires, then waits for runs in
    /// flight. Each job has at most one run at a time.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let jobs = self.store.list()?;
        info!(
            jobs = jobs.len(),
            enabled = jobs.iter().filter(|j| j.enabled).count(),
            "scheduler started"
        );

        let mut state = LoopState::default();
        loop {
            self.launch_due(Utc::now(), &mut state).await;
            while let Some(joined) = state.tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "scheduled run panicked");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.tick) => {}
            }
        }

        info!(running = state.tasks.len(), "scheduler stopping");
        while let Some(joined) = state.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "scheduled run panicked");
            }
        }
        info!("scheduler stopped");
        Ok(())
    }

    async fn launch_due(&self, now: DateTime<Utc>, state: &mut LoopState) {
        let jobs = match self.store.list() {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "failed to load jobs");
                return;
            }
        };
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::hours(1));

        for job in jobs {
            let since = state
                .seen
                .insert(job.id.clone(), now)
                .or(job.last_run)
                .unwrap_or(job.created_at);
            if !job.enabled {
                continue;
            }
            let schedule = match parse_cron(&job.cron) {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(job = %job.id, error = %e, "skipping job with invalid schedule");
                    continue;
                }
            };

            let at = match firing(&schedule, since, now, grace, &Local) {
                Firing::Idle => continue,
                Firing::Expired { first_missed } => {
                    warn!(
                        job = %job.id,
                        first_missed = %first_missed,
                        "missed runs are past the grace window, skipping"
                    );
                    continue;
                }
                Firing::Due { at, coalesced } => {
                    if coalesced > 1 {
                        info!(job = %job.id, coalesced, "coalescing missed runs into one");
                    }
                    at
                }
            };

            if !state.active.lock().await.insert(job.id.clone()) {
                warn!(job = %job.id, scheduled = %at, "previous run still active, skipping");
                continue;
            }

            let runner = Arc::clone(&self.runner);
            let store = Arc::clone(&self.store);
            let active = Arc::clone(&state.active);
            state.tasks.spawn(async move {
                info!(job = %job.id, scheduled = %at, "scheduled run started");
                match runner.run(&job).await {
                    Ok(record) => info!(
                        job = %job.id,
                        backup = %record.id,
                        status = %record.status,
                        "scheduled run finished"
                    ),
                    Err(e) => error!(job = %job.id, error = %e, "scheduled run failed"),
                }
                if let Err(e) = store.record_run(&job.id, at) {
                    warn!(job = %job.id, error = %e, "failed to record run");
                }
                active.lock().await.remove(&job.id);
            });
        }
    }
}
