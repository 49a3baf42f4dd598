use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::{Connection, PgConnection, Row};
use tracing::{info, warn};

use super::{
    BACKUP_TIMEOUT, CONNECT_TIMEOUT, DatabaseEngine, RESTORE_TIMEOUT, ToolCommand, dump_file_name,
    ensure_output_dir, ensure_supported, file_size,
};
use crate::errors::{Failure, Result, ToolError, VaultError};
use crate::models::{BackupType, ConnectionSpec, DatabaseKind, RestoreSpec};

const CLIENT_HINT: &str =
    "Install postgresql-client: apt install postgresql-client / brew install libpq";

/// pg_restore prints `pg_restore: error: ...` for real failures; a run with only
/// `pg_restore: warning: ...` lines can still exit non-zero.
static RESTORE_ERROR_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?mi)^pg_restore:\s+(?:error:|\[archiver[^\]]*\]\s+error)").ok()
});

pub struct PostgresEngine {
    spec: ConnectionSpec,
}

impl PostgresEngine {
    pub fn new(spec: ConnectionSpec) -> Self {
        PostgresEngine { spec }
    }

    fn connect_options(&self, database: &str) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&self.spec.host)
            .port(self.spec.port_or_default())
            .database(database)
            .ssl_mode(if self.spec.ssl {
                PgSslMode::Require
            } else {
                PgSslMode::Prefer
            });
        if let Some(user) = &self.spec.username {
            options = options.username(user);
        }
        if let Some(password) = self.spec.password() {
            options = options.password(password);
        }
        options
    }

    async fn connect(&self, database: &str) -> Result<PgConnection> {
        let options = self.connect_options(database);
        tokio::time::timeout(CONNECT_TIMEOUT, PgConnection::connect_with(&options))
            .await
            .map_err(|_| {
                VaultError::connection(format!(
                    "PostgreSQL connection to {} timed out after {}s",
                    self.spec.describe(),
                    CONNECT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| {
                VaultError::connection(format!(
                    "PostgreSQL connection to {} failed: {e}",
                    self.spec.describe()
                ))
            })
    }

    async fn query_names(&self, database: &str, sql: &str) -> Result<Vec<String>> {
        let mut conn = self.connect(database).await?;
        let rows = sqlx::query(sql)
            .fetch_all(&mut conn)
            .await
            .map_err(|e| VaultError::connection(format!("PostgreSQL query failed: {e}")))?;
        let names = rows
            .iter()
            .map(|row| row.try_get::<String, _>(0))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| VaultError::connection(format!("unexpected PostgreSQL row: {e}")))?;
        let _ = conn.close().await;
        Ok(names)
    }

    /// Connection flags and env shared by pg_dump and pg_restore.
    fn tool(&self, tool: &'static str, timeout: std::time::Duration) -> ToolCommand {
        let mut cmd = ToolCommand::new(tool, CLIENT_HINT, timeout)
            .arg(format!("--host={}", self.spec.host))
            .arg(format!("--port={}", self.spec.port_or_default()));
        if let Some(user) = &self.spec.username {
            cmd = cmd.arg(format!("--username={user}"));
        }
        cmd = cmd.arg("--no-password");
        if let Some(password) = self.spec.password() {
            cmd = cmd.env("PGPASSWORD", password);
        }
        if self.spec.ssl {
            cmd = cmd.env("PGSSLMODE", "require");
        }
        cmd
    }

    pub(crate) fn dump_command(
        &self,
        output_file: &Path,
        tables: Option<&[String]>,
    ) -> ToolCommand {
        let mut cmd = self
            .tool("pg_dump", BACKUP_TIMEOUT)
            .arg("--format=custom")
            .arg(format!("--file={}", output_file.display()));
        for table in tables.unwrap_or_default() {
            cmd = cmd.arg("--table").arg(table);
        }
        cmd.arg(&self.spec.database)
    }

    pub(crate) fn restore_command(&self, target_db: &str, spec: &RestoreSpec) -> ToolCommand {
        let mut cmd = self
            .tool("pg_restore", RESTORE_TIMEOUT)
            .arg(format!("--dbname={target_db}"))
            .arg("--verbose");
        if spec.drop_existing {
            cmd = cmd.args(["--clean", "--if-exists"]);
        }
        if spec.no_owner {
            cmd = cmd.arg("--no-owner");
        }
        for table in spec.tables.as_deref().unwrap_or_default() {
            cmd = cmd.arg("--table").arg(table);
        }
        cmd.arg(&spec.backup_file)
    }
}

/// Whether pg_restore's diagnostics contain an actual error, not just warnings.
pub fn restore_stderr_has_error(stderr: &str) -> bool {
    match RESTORE_ERROR_LINE.as_ref() {
        Some(re) => re.is_match(stderr),
        None => stderr.to_lowercase().contains("error"),
    }
}

#[async_trait]
impl DatabaseEngine for PostgresEngine {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Postgres
    }

    fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    async fn test_connection(&self) -> Result<bool> {
        let database = if self.spec.database.is_empty() {
            "postgres"
        } else {
            &self.spec.database
        };
        let mut conn = self.connect(database).await?;
        conn.ping()
            .await
            .map_err(|e| VaultError::connection(format!("PostgreSQL ping failed: {e}")))?;
        let _ = conn.close().await;
        info!(host = %self.spec.host, database = %self.spec.database, "postgres connection ok");
        Ok(true)
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        self.query_names(
            "postgres",
            "SELECT datname FROM pg_database WHERE datistemplate = false ORDER BY datname",
        )
        .await
    }

    async fn list_tables(&self, database: Option<&str>) -> Result<Vec<String>> {
        let database = database.unwrap_or(&self.spec.database);
        self.query_names(
            database,
            "SELECT tablename::text FROM pg_tables WHERE schemaname = 'public' ORDER BY tablename",
        )
        .await
    }

    async fn backup(
        &self,
        output_dir: &Path,
        backup_type: BackupType,
        tables: Option<&[String]>,
    ) -> Result<PathBuf> {
        ensure_supported(self.kind(), self.supported_backup_types(), backup_type)?;
        ensure_output_dir(output_dir).await?;

        let output_file =
            output_dir.join(dump_file_name(self.kind(), &self.spec.database, "dump"));
        info!(
            database = %self.spec.database,
            file = %output_file.display(),
            "postgres backup start"
        );

        if let Err(e) = self.dump_command(&output_file, tables).run().await {
            let _ = tokio::fs::remove_file(&output_file).await;
            return Err(VaultError::backup(e));
        }

        info!(
            file = %output_file.display(),
            size = file_size(&output_file),
            "postgres backup complete"
        );
        Ok(output_file)
    }

    async fn restore(&self, spec: &RestoreSpec) -> Result<()> {
        let target_db = spec
            .target_database
            .as_deref()
            .filter(|db| !db.is_empty())
            .unwrap_or(&self.spec.database);
        if target_db.is_empty() {
            return Err(VaultError::restore("No target database specified for restore."));
        }

        let cmd = self.restore_command(target_db, spec);
        if spec.dry_run {
            info!(command = %cmd.display(), "postgres restore dry run");
            return Ok(());
        }

        info!(database = target_db, file = %spec.backup_file.display(), "postgres restore start");
        let output = cmd.output().await.map_err(VaultError::restore)?;
        if !output.status.success() {
            if restore_stderr_has_error(&output.stderr) {
                return Err(VaultError::Restore(Failure::Tool(ToolError::Exited {
                    tool: "pg_restore",
                    status: output.status.to_string(),
                    stderr: output.stderr.trim().to_string(),
                })));
            }
            warn!(
                status = %output.status,
                "pg_restore exited non-zero with warnings only"
            );
        }
        info!(database = target_db, "postgres restore complete");
        Ok(())
    }
}
