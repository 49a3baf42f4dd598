//! Per-database connect, introspect, dump and restore.
//!
//! Postgres, MySQL and MongoDB shell out to their native client tools; SQLite
//! uses the embedded library's online backup API.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::{Result, ToolError, VaultError};
use crate::models::{BackupType, ConnectionSpec, DatabaseKind, RestoreSpec};

pub mod mongodb;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

pub use mongodb::MongoEngine;
pub use mysql::MysqlEngine;
pub use postgres::PostgresEngine;
pub use sqlite::SqliteEngine;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const BACKUP_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const RESTORE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

const FULL_ONLY: &[BackupType] = &[BackupType::Full];

#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    fn kind(&self) -> DatabaseKind;

    fn spec(&self) -> &ConnectionSpec;

    /// Short-lived connection plus a trivial round trip. Never leaves a session open.
    async fn test_connection(&self) -> Result<bool>;

    /// User databases, without the engine's system databases.
    async fn list_databases(&self) -> Result<Vec<String>>;

    /// Tables or collections of `database`, or of the configured database.
    async fn list_tables(&self, database: Option<&str>) -> Result<Vec<String>>;

    /// Writes a raw dump into `output_dir` and returns its path.
    async fn backup(
        &self,
        output_dir: &Path,
        backup_type: BackupType,
        tables: Option<&[String]>,
    ) -> Result<PathBuf>;

    async fn restore(&self, spec: &RestoreSpec) -> Result<()>;

    fn supported_backup_types(&self) -> &'static [BackupType] {
        FULL_ONLY
    }
}

/// Picks the engine implementation for `spec.kind`.
pub fn engine_for(spec: &ConnectionSpec) -> Box<dyn DatabaseEngine> {
    let spec = spec.clone().normalized();
    match spec.kind {
        DatabaseKind::Postgres => Box::new(PostgresEngine::new(spec)),
        DatabaseKind::Mysql => Box::new(MysqlEngine::new(spec)),
        DatabaseKind::Mongodb => Box::new(MongoEngine::new(spec)),
        DatabaseKind::Sqlite => Box::new(SqliteEngine::new(spec)),
    }
}

/// Fails with a `Backup` error unless `requested` is one of `supported`.
pub fn ensure_supported(
    kind: DatabaseKind,
    supported: &[BackupType],
    requested: BackupType,
) -> Result<()> {
    if supported.contains(&requested) {
        return Ok(());
    }
    let reason = match kind {
        DatabaseKind::Postgres => "Incremental/differential backups require WAL archiving.",
        DatabaseKind::Mysql => "Incremental backups require binary logs or Percona XtraBackup.",
        DatabaseKind::Mongodb => "Incremental backups require the oplog of a replica set.",
        DatabaseKind::Sqlite => "SQLite has no change log to build incremental backups from.",
    };
    Err(VaultError::backup(format!(
        "{kind} engine only supports full backups. Got: {requested}. {reason}"
    )))
}

/// `{engine}_{database or "all"}_{YYYYMMDD_HHMMSS}.{ext}` in UTC.
pub fn dump_file_name(kind: DatabaseKind, database: &str, extension: &str) -> String {
    let label = if database.is_empty() { "all" } else { database };
    format!(
        "{kind}_{label}_{}.{extension}",
        Utc::now().format("%Y%m%d_%H%M%S")
    )
}

pub(crate) async fn ensure_output_dir(output_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(output_dir).await.map_err(|e| {
        VaultError::backup(format!(
            "failed to create output directory {}: {e}",
            output_dir.display()
        ))
    })
}

pub(crate) fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Captured result of a finished tool run.
#[derive(Debug)]
pub(crate) struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// One invocation of an external client tool.
///
/// Secrets go through `env`, never `arg`, so they stay out of process listings.
pub(crate) struct ToolCommand {
    tool: &'static str,
    hint: &'static str,
    args: Vec<OsString>,
    envs: Vec<(&'static str, String)>,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(tool: &'static str, hint: &'static str, timeout: Duration) -> Self {
        ToolCommand {
            tool,
            hint,
            args: Vec::new(),
            envs: Vec::new(),
            stdin: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.envs.push((key, value.into()));
        self
    }

    pub fn stdin(mut self, input: Vec<u8>) -> Self {
        self.stdin = Some(input);
        self
    }

    /// The command line as it would run. Environment values are not included.
    pub fn display(&self) -> String {
        std::iter::once(self.tool.to_string())
            .chain(self.args.iter().map(|a| a.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Runs to completion regardless of exit status.
    pub async fn output(self) -> std::result::Result<ToolOutput, ToolError> {
        let path = which::which(self.tool).map_err(|_| ToolError::NotFound {
            tool: self.tool,
            hint: self.hint,
        })?;

        debug!(command = %self.display(), "running external tool");
        let mut child = Command::new(path)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                tool: self.tool,
                source,
            })?;

        if let (Some(input), Some(mut pipe)) = (self.stdin, child.stdin.take()) {
            let tool = self.tool;
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await {
                    warn!(tool, error = %e, "failed to write tool stdin");
                }
            });
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ToolError::TimedOut {
                tool: self.tool,
                after: self.timeout,
            })?
            .map_err(|source| ToolError::Spawn {
                tool: self.tool,
                source,
            })?;

        Ok(ToolOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Runs to completion; a non-zero exit becomes `ToolError::Exited` carrying stderr.
    pub async fn run(self) -> std::result::Result<ToolOutput, ToolError> {
        let tool = self.tool;
        let output = self.output().await?;
        if !output.status.success() {
            return Err(ToolError::Exited {
                tool,
                status: output.status.to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_engines() -> Vec<Box<dyn DatabaseEngine>> {
        vec![
            engine_for(&ConnectionSpec::new(DatabaseKind::Postgres, "app")),
            engine_for(&ConnectionSpec::new(DatabaseKind::Mysql, "app")),
            engine_for(&ConnectionSpec::new(DatabaseKind::Mongodb, "app")),
            engine_for(&ConnectionSpec::sqlite("/nonexistent/app.db")),
        ]
    }

    #[test]
    fn factory_maps_kinds_and_fills_ports() {
        for engine in all_engines() {
            assert_eq!(engine.spec().kind, engine.kind());
            assert_eq!(engine.spec().port, engine.kind().default_port());
            assert_eq!(engine.supported_backup_types(), &[BackupType::Full]);
        }
    }

    #[tokio::test]
    async fn every_engine_rejects_non_full_backups_before_io() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let output_dir = tmp.path().join("never-created");

        for engine in all_engines() {
            for backup_type in [BackupType::Incremental, BackupType::Differential] {
                let err = engine
                    .backup(&output_dir, backup_type, None)
                    .await
                    .unwrap_err();
                assert!(
                    matches!(err, VaultError::Backup(_)),
                    "{} returned {err:?}",
                    engine.kind()
                );
                assert!(err.to_string().contains("only supports full backups"));
            }
        }
        assert!(!output_dir.exists());
        Ok(())
    }

    #[test]
    fn dump_file_name_layout() {
        let name = dump_file_name(DatabaseKind::Postgres, "app", "dump");
        let re = regex::Regex::new(r"^postgres_app_\d{8}_\d{6}\.dump$").unwrap();
        assert!(re.is_match(&name), "{name}");
        assert!(dump_file_name(DatabaseKind::Mysql, "", "sql").starts_with("mysql_all_"));
    }

    #[tokio::test]
    async fn missing_tool_is_reported_with_hint() {
        let err = ToolCommand::new(
            "dbvault-no-such-tool",
            "Install the frobnicator.",
            Duration::from_secs(1),
        )
        .run()
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::NotFound { tool: "dbvault-no-such-tool", .. }));
        assert!(err.to_string().contains("Install the frobnicator."));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_keeps_stderr_verbatim() {
        let err = ToolCommand::new("sh", "", Duration::from_secs(10))
            .args(["-c", "echo 'FATAL: role \"x\" does not exist' >&2; exit 3"])
            .run()
            .await
            .unwrap_err();
        match err {
            ToolError::Exited { tool, stderr, .. } => {
                assert_eq!(tool, "sh");
                assert_eq!(stderr, "FATAL: role \"x\" does not exist");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_tool_is_killed_on_timeout() {
        let err = ToolCommand::new("sleep", "", Duration::from_millis(200))
            .arg("30")
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::TimedOut { tool: "sleep", .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn secrets_travel_by_env_and_stdin() -> anyhow::Result<()> {
        let cmd = ToolCommand::new("sh", "", Duration::from_secs(10))
            .args(["-c", "printf '%s:' \"$DBVAULT_TEST_SECRET\"; cat"])
            .env("DBVAULT_TEST_SECRET", "hunter2")
            .stdin(b"piped".to_vec());
        assert!(!cmd.display().contains("hunter2"));
        let out = cmd.run().await?;
        assert_eq!(out.stdout, "hunter2:piped");
        Ok(())
    }
}
