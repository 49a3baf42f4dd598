use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::backup::Progress;
use rusqlite::types::Value;
use rusqlite::{Connection, DatabaseName, OpenFlags, OptionalExtension, params_from_iter};
use tracing::{debug, info, warn};

use super::{CONNECT_TIMEOUT, DatabaseEngine, dump_file_name, ensure_supported, file_size};
use crate::errors::{Result, VaultError};
use crate::models::{BackupType, ConnectionSpec, DatabaseKind, RestoreSpec};

const NO_PROGRESS: Option<fn(Progress)> = None;

pub struct SqliteEngine {
    spec: ConnectionSpec,
}

impl SqliteEngine {
    pub fn new(spec: ConnectionSpec) -> Self {
        SqliteEngine { spec }
    }

    fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.spec.database)
    }
}

fn open_read_only(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(CONNECT_TIMEOUT)?;
    Ok(conn)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn table_sql(conn: &Connection, table: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )
    .optional()
}

/// Copies every row of `table` from `src` into the same-named table in `dst`.
fn copy_rows(src: &Connection, dst: &Connection, table: &str) -> rusqlite::Result<usize> {
    let mut select = src.prepare(&format!("SELECT * FROM {}", quote_ident(table)))?;
    let columns = select.column_count();
    if columns == 0 {
        return Ok(0);
    }
    let placeholders = vec!["?"; columns].join(", ");
    let mut insert = dst.prepare(&format!(
        "INSERT INTO {} VALUES ({placeholders})",
        quote_ident(table)
    ))?;

    let mut rows = select.query([])?;
    let mut copied = 0;
    while let Some(row) = rows.next()? {
        let values = (0..columns)
            .map(|i| row.get::<_, Value>(i))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        insert.execute(params_from_iter(values))?;
        copied += 1;
    }
    Ok(copied)
}

fn list_tables_blocking(path: &Path) -> rusqlite::Result<Vec<String>> {
    let conn = open_read_only(path)?;
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' \
         AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

/// New database at `dest` holding only `tables`, schema and rows.
fn backup_tables(source: &Path, dest: &Path, tables: &[String]) -> rusqlite::Result<()> {
    let src = open_read_only(source)?;
    let mut dst = Connection::open(dest)?;
    let tx = dst.transaction()?;
    for table in tables {
        let Some(create_sql) = table_sql(&src, table)? else {
            warn!(table = %table, "table not found, skipping");
            continue;
        };
        tx.execute_batch(&create_sql)?;
        let rows = copy_rows(&src, &tx, table)?;
        debug!(table = %table, rows, "table copied");
    }
    tx.commit()
}

fn restore_tables(
    backup: &Path,
    target: &Path,
    tables: &[String],
    drop_existing: bool,
) -> rusqlite::Result<()> {
    let src = open_read_only(backup)?;
    let mut dst = Connection::open(target)?;
    dst.busy_timeout(CONNECT_TIMEOUT)?;
    let tx = dst.transaction()?;
    for table in tables {
        let Some(create_sql) = table_sql(&src, table)? else {
            warn!(table = %table, "table not found in backup, skipping");
            continue;
        };
        if drop_existing {
            tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))?;
        }
        if let Err(e) = tx.execute_batch(&create_sql) {
            debug!(table = %table, error = %e, "create skipped, table already present");
        }
        let rows = copy_rows(&src, &tx, table)?;
        debug!(table = %table, rows, "table restored");
    }
    tx.commit()
}

fn restore_full(
    backup: &Path,
    target: &Path,
    drop_existing: bool,
) -> std::result::Result<(), String> {
    if target.exists() && drop_existing {
        fs::remove_file(target).map_err(|e| format!("failed to remove {}: {e}", target.display()))?;
    }
    if target.exists() {
        let mut dst = Connection::open(target).map_err(|e| e.to_string())?;
        dst.busy_timeout(CONNECT_TIMEOUT).map_err(|e| e.to_string())?;
        dst.restore(DatabaseName::Main, backup, NO_PROGRESS)
            .map_err(|e| e.to_string())
    } else {
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        fs::copy(backup, target).map(|_| ()).map_err(|e| {
            format!(
                "failed to copy {} to {}: {e}",
                backup.display(),
                target.display()
            )
        })
    }
}

async fn blocking<T, F>(f: F) -> std::result::Result<T, String>
where
    T: Send + 'static,
    F: FnOnce() -> std::result::Result<T, String> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| format!("sqlite task failed: {e}"))?
}

#[async_trait]
impl DatabaseEngine for SqliteEngine {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Sqlite
    }

    fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    async fn test_connection(&self) -> Result<bool> {
        let path = self.db_path();
        if !path.exists() {
            return Err(VaultError::connection(format!(
                "SQLite database file not found: {}",
                path.display()
            )));
        }
        let db_path = path.clone();
        blocking(move || {
            let conn = open_read_only(&db_path).map_err(|e| e.to_string())?;
            let integrity: String = conn
                .query_row("PRAGMA integrity_check", [], |row| row.get(0))
                .map_err(|e| e.to_string())?;
            if integrity != "ok" {
                return Err(format!("integrity check failed: {integrity}"));
            }
            conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
                .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
        .map_err(|e| VaultError::connection(format!("SQLite connection failed: {e}")))?;

        info!(database = %path.display(), "sqlite connection ok");
        Ok(true)
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(vec![self.spec.database.clone()])
    }

    async fn list_tables(&self, database: Option<&str>) -> Result<Vec<String>> {
        let path = database
            .map(PathBuf::from)
            .unwrap_or_else(|| self.db_path());
        blocking(move || list_tables_blocking(&path).map_err(|e| e.to_string()))
            .await
            .map_err(|e| VaultError::connection(format!("Failed to list tables: {e}")))
    }

    async fn backup(
        &self,
        output_dir: &Path,
        backup_type: BackupType,
        tables: Option<&[String]>,
    ) -> Result<PathBuf> {
        ensure_supported(self.kind(), self.supported_backup_types(), backup_type)?;

        let db_path = self.db_path();
        if !db_path.exists() {
            return Err(VaultError::backup(format!(
                "SQLite database file not found: {}",
                db_path.display()
            )));
        }
        super::ensure_output_dir(output_dir).await?;

        let label = db_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let output_file = output_dir.join(dump_file_name(self.kind(), &label, "db"));
        info!(database = %db_path.display(), file = %output_file.display(), "sqlite backup start");

        let (source, dest) = (db_path.clone(), output_file.clone());
        let tables = tables.filter(|t| !t.is_empty()).map(<[String]>::to_vec);
        let result = blocking(move || match tables {
            Some(tables) => backup_tables(&source, &dest, &tables).map_err(|e| e.to_string()),
            None => open_read_only(&source)
                .and_then(|src| src.backup(DatabaseName::Main, &dest, NO_PROGRESS))
                .map_err(|e| e.to_string()),
        })
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&output_file).await;
            return Err(VaultError::backup(format!("SQLite backup failed: {e}")));
        }

        info!(
            file = %output_file.display(),
            size = file_size(&output_file),
            "sqlite backup complete"
        );
        Ok(output_file)
    }

    async fn restore(&self, spec: &RestoreSpec) -> Result<()> {
        let target = spec
            .target_database
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.db_path());
        let backup = spec.backup_file.clone();

        if !backup.exists() {
            return Err(VaultError::restore(format!(
                "Backup file not found: {}",
                backup.display()
            )));
        }

        if spec.dry_run {
            info!(
                source = %backup.display(),
                target = %target.display(),
                tables = ?spec.tables,
                "sqlite restore dry run"
            );
            return Ok(());
        }

        info!(source = %backup.display(), target = %target.display(), "sqlite restore start");
        let tables = spec.tables.clone().filter(|t| !t.is_empty());
        let drop_existing = spec.drop_existing;
        let destination = target.clone();
        blocking(move || match tables {
            Some(tables) => restore_tables(&backup, &destination, &tables, drop_existing)
                .map_err(|e| e.to_string()),
            None => restore_full(&backup, &destination, drop_existing),
        })
        .await
        .map_err(|e| VaultError::restore(format!("SQLite restore failed: {e}")))?;

        info!(target = %target.display(), "sqlite restore complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `users` with 3 rows and `orders` with 4.
    fn fixture(dir: &Path) -> anyhow::Result<PathBuf> {
        let path = dir.join("shop.db");
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER, total REAL, note BLOB);
             INSERT INTO users (name) VALUES ('ada'), ('grace'), ('linus');
             INSERT INTO orders (user_id, total, note) VALUES
                (1, 9.5, x'00ff'), (1, 12.0, NULL), (2, 3.25, x'01'), (3, 100.0, NULL);",
        )?;
        Ok(path)
    }

    fn count(path: &Path, table: &str) -> anyhow::Result<i64> {
        let conn = Connection::open(path)?;
        Ok(conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |r| r.get(0))?)
    }

    fn tables(path: &Path) -> anyhow::Result<Vec<String>> {
        Ok(list_tables_blocking(path)?)
    }

    #[tokio::test]
    async fn connection_and_introspection() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let db = fixture(tmp.path())?;
        let engine = SqliteEngine::new(ConnectionSpec::sqlite(&db));

        assert!(engine.test_connection().await?);
        assert_eq!(engine.list_databases().await?, vec![db.display().to_string()]);
        assert_eq!(engine.list_tables(None).await?, vec!["orders", "users"]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_or_garbage_file_fails_connection() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let missing = SqliteEngine::new(ConnectionSpec::sqlite(tmp.path().join("nope.db")));
        assert!(matches!(
            missing.test_connection().await,
            Err(VaultError::Connection(_))
        ));
        assert!(!tmp.path().join("nope.db").exists());

        let junk = tmp.path().join("junk.db");
        fs::write(&junk, b"this is not a database file at all, not even close......")?;
        let junk_engine = SqliteEngine::new(ConnectionSpec::sqlite(&junk));
        assert!(matches!(
            junk_engine.test_connection().await,
            Err(VaultError::Connection(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn full_backup_copies_everything() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let db = fixture(tmp.path())?;
        let engine = SqliteEngine::new(ConnectionSpec::sqlite(&db));

        let out = engine
            .backup(&tmp.path().join("out"), BackupType::Full, None)
            .await?;
        let name = out.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name.starts_with("sqlite_shop_") && name.ends_with(".db"), "{name}");
        assert_eq!(count(&out, "users")?, 3);
        assert_eq!(count(&out, "orders")?, 4);
        Ok(())
    }

    #[tokio::test]
    async fn selective_backup_then_plain_restore() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let db = fixture(tmp.path())?;
        let engine = SqliteEngine::new(ConnectionSpec::sqlite(&db));

        let out = engine
            .backup(
                &tmp.path().join("out"),
                BackupType::Full,
                Some(&["users".to_string()]),
            )
            .await?;
        assert_eq!(tables(&out)?, vec!["users"]);

        let target = tmp.path().join("restored.db");
        let spec = RestoreSpec {
            target_database: Some(target.display().to_string()),
            ..RestoreSpec::new(&out)
        };
        engine.restore(&spec).await?;

        assert_eq!(tables(&target)?, vec!["users"]);
        assert_eq!(count(&target, "users")?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn selective_backup_skips_unknown_tables() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let db = fixture(tmp.path())?;
        let engine = SqliteEngine::new(ConnectionSpec::sqlite(&db));

        let out = engine
            .backup(
                &tmp.path().join("out"),
                BackupType::Full,
                Some(&["ghost".to_string(), "orders".to_string()]),
            )
            .await?;
        assert_eq!(tables(&out)?, vec!["orders"]);
        assert_eq!(count(&out, "orders")?, 4);
        Ok(())
    }

    #[tokio::test]
    async fn selective_restore_with_drop_replaces_rows() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let db = fixture(tmp.path())?;
        let engine = SqliteEngine::new(ConnectionSpec::sqlite(&db));
        let out = engine
            .backup(&tmp.path().join("out"), BackupType::Full, None)
            .await?;

        {
            let conn = Connection::open(&db)?;
            conn.execute_batch("DELETE FROM users WHERE id > 1; DELETE FROM orders;")?;
        }

        let spec = RestoreSpec {
            tables: Some(vec!["users".into()]),
            drop_existing: true,
            ..RestoreSpec::new(&out)
        };
        engine.restore(&spec).await?;
        assert_eq!(count(&db, "users")?, 3);
        assert_eq!(count(&db, "orders")?, 0, "orders was not requested");
        Ok(())
    }

    #[tokio::test]
    async fn full_restore_over_existing_target_uses_backup_api() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let db = fixture(tmp.path())?;
        let engine = SqliteEngine::new(ConnectionSpec::sqlite(&db));
        let out = engine
            .backup(&tmp.path().join("out"), BackupType::Full, None)
            .await?;

        {
            let conn = Connection::open(&db)?;
            conn.execute_batch("DROP TABLE orders; CREATE TABLE scratch (x);")?;
        }

        engine.restore(&RestoreSpec::new(&out)).await?;
        assert_eq!(tables(&db)?, vec!["orders", "users"]);
        assert_eq!(count(&db, "orders")?, 4);
        Ok(())
    }

    #[tokio::test]
    async fn dry_run_does_not_create_target() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let db = fixture(tmp.path())?;
        let engine = SqliteEngine::new(ConnectionSpec::sqlite(&db));
        let out = engine
            .backup(&tmp.path().join("out"), BackupType::Full, None)
            .await?;

        let target = tmp.path().join("never.db");
        let spec = RestoreSpec {
            target_database: Some(target.display().to_string()),
            dry_run: true,
            ..RestoreSpec::new(&out)
        };
        engine.restore(&spec).await?;
        assert!(!target.exists());
        Ok(())
    }

    #[tokio::test]
    async fn restore_from_missing_backup_reports_not_found() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let engine = SqliteEngine::new(ConnectionSpec::sqlite(tmp.path().join("a.db")));
        let err = engine
            .restore(&RestoreSpec::new(tmp.path().join("missing.db")))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Restore(_)));
        assert!(err.to_string().contains("not found"));
        Ok(())
    }

    #[tokio::test]
    async fn backup_of_missing_database_fails_without_output() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let engine = SqliteEngine::new(ConnectionSpec::sqlite(tmp.path().join("gone.db")));
        let out_dir = tmp.path().join("out");
        let err = engine
            .backup(&out_dir, BackupType::Full, None)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Backup(_)));
        assert!(!out_dir.exists());
        Ok(())
    }
}
