use std::path::{Path, PathBuf};

use tracing::{info, warn};
use uuid::Uuid;

use crate::compression::{self, detect_algorithm};
use crate::engines::DatabaseEngine;
use crate::errors::{Result, VaultError};
use crate::models::{CompressionAlgorithm, DatabaseKind, RestoreSpec};
use crate::storage::StorageBackend;

/// Downloads `remote_key` into `work_dir`, keeping its file name.
pub async fn fetch_backup(
    storage: &dyn StorageBackend,
    remote_key: &str,
    work_dir: &Path,
) -> Result<PathBuf> {
    let name = remote_key
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .ok_or_else(|| VaultError::Storage(format!("invalid storage key: {remote_key:?}")))?;
    tokio::fs::create_dir_all(work_dir).await.map_err(|e| {
        VaultError::Storage(format!("failed to create {}: {e}", work_dir.display()))
    })?;
    let local = storage.download(remote_key, &work_dir.join(name)).await?;
    info!(key = remote_key, file = %local.display(), "backup downloaded");
    Ok(local)
}

/// Decompresses if needed, checks the target is reachable (not for sqlite),
/// then hands off to the engine.
///
/// Nothing applied to the target is rolled back on failure. The decompressed
/// copy is removed after a successful restore and kept otherwise.
pub async fn run_restore(engine: &dyn DatabaseEngine, spec: &RestoreSpec) -> Result<()> {
    let source = spec.backup_file.clone();
    if !source.exists() {
        return Err(VaultError::BackupNotFound(source.display().to_string()));
    }

    let algorithm = detect_algorithm(&source);
    let staging = if algorithm == CompressionAlgorithm::None {
        None
    } else {
        Some(staging_dir(&source))
    };

    let actual = match &staging {
        Some(dir) => {
            let output = dir.join(source.with_extension("").file_name().unwrap_or_default());
            let (input, dir) = (source.clone(), dir.clone());
            tokio::task::spawn_blocking(move || {
                std::fs::create_dir_all(&dir).map_err(|e| {
                    VaultError::Compression(format!("failed to create {}: {e}", dir.display()))
                })?;
                compression::decompress(&input, Some(&output))
            })
            .await
            .map_err(|e| VaultError::Compression(format!("worker task failed: {e}")))??
        }
        None => source.clone(),
    };

    if engine.kind() != DatabaseKind::Sqlite {
        engine.test_connection().await?;
    }

    let request = RestoreSpec {
        backup_file: actual.clone(),
        ..spec.clone()
    };
    info!(
        engine = %engine.kind(),
        file = %actual.display(),
        target = ?spec.target_database,
        dry_run = spec.dry_run,
        "restore started"
    );
    if let Err(e) = engine.restore(&request).await {
        if let Some(dir) = &staging {
            warn!(dir = %dir.display(), "decompressed backup kept for inspection");
        }
        return Err(e);
    }

    if let Some(dir) = staging {
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(dir = %dir.display(), error = %e, "failed to remove decompressed backup");
        }
    }
    info!(engine = %engine.kind(), dry_run = spec.dry_run, "restore finished");
    Ok(())
}

/// Private directory next to the backup, so an existing file with the
/// decompressed name is never overwritten.
fn staging_dir(source: &Path) -> PathBuf {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    source
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(".dbvault-restore-{id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::SqliteEngine;
    use crate::models::ConnectionSpec;
    use crate::storage::LocalStorage;
    use rusqlite::Connection;

    fn compressed_fixture(dir: &Path) -> anyhow::Result<PathBuf> {
        let db = dir.join("shop.db");
        let conn = Connection::open(&db)?;
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO users (name) VALUES ('ada'), ('grace'), ('linus');",
        )?;
        drop(conn);
        let gz = compression::compress(&db, CompressionAlgorithm::Gzip, 6, None)?;
        std::fs::remove_file(&db)?;
        Ok(gz)
    }

    fn leftovers(dir: &Path) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    #[tokio::test]
    async fn compressed_backup_is_restored_and_staging_removed() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let backup = compressed_fixture(tmp.path())?;
        let target = tmp.path().join("restored.db");
        let engine = SqliteEngine::new(ConnectionSpec::sqlite(&target));

        run_restore(&engine, &RestoreSpec::new(&backup)).await?;

        let conn = Connection::open(&target)?;
        let users: i64 = conn.query_row("SELECT count(*) FROM users", [], |r| r.get(0))?;
        assert_eq!(users, 3);
        assert_eq!(leftovers(tmp.path())?, vec!["restored.db", "shop.db.gz"]);
        Ok(())
    }

    #[tokio::test]
    async fn dry_run_leaves_no_trace() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let backup = compressed_fixture(tmp.path())?;
        let target = tmp.path().join("restored.db");
        let engine = SqliteEngine::new(ConnectionSpec::sqlite(&target));

        let spec = RestoreSpec {
            dry_run: true,
            ..RestoreSpec::new(&backup)
        };
        run_restore(&engine, &spec).await?;
        assert!(!target.exists());
        assert_eq!(leftovers(tmp.path())?, vec!["shop.db.gz"]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_backup_is_backup_not_found() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let engine = SqliteEngine::new(ConnectionSpec::sqlite(tmp.path().join("t.db")));
        let err = run_restore(&engine, &RestoreSpec::new(tmp.path().join("gone.db.zst")))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::BackupNotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn fetch_backup_downloads_into_work_dir() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let storage = LocalStorage::new(&tmp.path().join("vault"))?;
        let artifact = tmp.path().join("sqlite_shop_20240101_000000.db.gz");
        std::fs::write(&artifact, b"payload")?;
        let key = "sqlite/shop/2024-01-01/sqlite_shop_20240101_000000.db.gz";
        storage.upload(&artifact, key).await?;

        let work = tmp.path().join("work");
        let local = fetch_backup(&storage, key, &work).await?;
        assert_eq!(local, work.join("sqlite_shop_20240101_000000.db.gz"));
        assert_eq!(std::fs::read(&local)?, b"payload");

        let missing = fetch_backup(&storage, "sqlite/shop/nope.db", &work).await;
        assert!(matches!(missing, Err(VaultError::StorageNotFound(_))));
        Ok(())
    }
}
