use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{StorageBackend, validate_key};
use crate::errors::{Result, VaultError};
use crate::models::{StorageKind, StorageObject};

/// Backups kept under a directory on this machine.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Creates the base directory if needed and resolves it to an absolute path.
    pub fn new(base_path: &Path) -> Result<Self> {
        fs::create_dir_all(base_path).map_err(|e| {
            VaultError::Storage(format!(
                "failed to create storage directory {}: {e}",
                base_path.display()
            ))
        })?;
        let base_path = fs::canonicalize(base_path).map_err(|e| {
            VaultError::Storage(format!("failed to resolve {}: {e}", base_path.display()))
        })?;
        Ok(LocalStorage { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, remote_key: &str) -> Result<PathBuf> {
        validate_key(remote_key)?;
        Ok(self.base_path.join(remote_key))
    }
}

/// Copies `from` to `to` and gives the copy the source's modification time.
async fn copy_with_mtime(from: &Path, to: &Path) -> std::io::Result<u64> {
    let size = tokio::fs::copy(from, to).await?;
    let (from, to) = (from.to_path_buf(), to.to_path_buf());
    tokio::task::spawn_blocking(move || {
        let modified = fs::metadata(&from)?.modified()?;
        fs::OpenOptions::new().write(true).open(&to)?.set_modified(modified)
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(size)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<String> {
        let dest = self.full_path(remote_key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                VaultError::Storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        if same_file(local_path, &dest) {
            debug!(path = %dest.display(), "source already at destination, skipping copy");
            return Ok(dest.to_string_lossy().into_owned());
        }

        let size = copy_with_mtime(local_path, &dest).await.map_err(|e| {
            VaultError::Storage(format!(
                "failed to copy backup {} to {}: {e}",
                local_path.display(),
                dest.display()
            ))
        })?;
        info!(
            source = %local_path.display(),
            destination = %dest.display(),
            size,
            "local upload complete"
        );
        Ok(dest.to_string_lossy().into_owned())
    }

    async fn download(&self, remote_key: &str, local_path: &Path) -> Result<PathBuf> {
        let source = self.full_path(remote_key)?;
        if !source.is_file() {
            return Err(VaultError::StorageNotFound(source.display().to_string()));
        }
        if let Some(parent) = local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                VaultError::Storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        if same_file(&source, local_path) {
            return Ok(local_path.to_path_buf());
        }
        copy_with_mtime(&source, local_path).await.map_err(|e| {
            VaultError::Storage(format!("failed to download backup {}: {e}", source.display()))
        })?;
        info!(
            source = %source.display(),
            destination = %local_path.display(),
            "local download complete"
        );
        Ok(local_path.to_path_buf())
    }

    async fn list_backups(&self, prefix: &str) -> Result<Vec<StorageObject>> {
        let search_dir = if prefix.is_empty() {
            self.base_path.clone()
        } else {
            self.full_path(prefix)?
        };
        let base = self.base_path.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<StorageObject>> {
            if !search_dir.exists() {
                return Ok(Vec::new());
            }
            let mut objects = Vec::new();
            for entry in WalkDir::new(&search_dir).sort_by_file_name() {
                let entry = entry
                    .map_err(|e| VaultError::Storage(format!("failed to walk storage: {e}")))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let meta = entry.metadata().map_err(|e| {
                    VaultError::Storage(format!("failed to stat {}: {e}", entry.path().display()))
                })?;
                let relative = entry.path().strip_prefix(&base).unwrap_or(entry.path());
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let last_modified = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                objects.push(StorageObject {
                    key,
                    size: meta.len(),
                    last_modified,
                });
            }
            Ok(objects)
        })
        .await
        .map_err(|e| VaultError::Storage(format!("listing task failed: {e}")))?
    }

    async fn delete(&self, remote_key: &str) -> Result<()> {
        let target = self.full_path(remote_key)?;
        if !target.exists() {
            return Err(VaultError::StorageNotFound(format!(
                "File not found: {}",
                target.display()
            )));
        }
        tokio::fs::remove_file(&target).await.map_err(|e| {
            VaultError::Storage(format!("failed to delete {}: {e}", target.display()))
        })?;
        info!(path = %target.display(), "local delete complete");
        Ok(())
    }

    async fn exists(&self, remote_key: &str) -> Result<bool> {
        Ok(self.full_path(remote_key)?.exists())
    }
}
