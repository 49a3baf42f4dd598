//! Where finished backups live: a local directory or an S3 bucket, addressed
//! by the same logical keys.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::config::StorageConfig;
use crate::errors::{Result, VaultError};
use crate::models::{StorageKind, StorageObject};

pub mod local;
pub mod s3;

pub use local::LocalStorage;
pub use s3::S3Storage;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> StorageKind;

    /// Stores `local_path` under `remote_key` and returns the canonical location.
    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<String>;

    /// Fetches `remote_key` into `local_path`. Missing objects are `StorageNotFound`.
    async fn download(&self, remote_key: &str, local_path: &Path) -> Result<PathBuf>;

    /// Objects under `prefix`, keyed relative to the backend root.
    async fn list_backups(&self, prefix: &str) -> Result<Vec<StorageObject>>;

    /// Removes `remote_key`. Missing objects are `StorageNotFound`.
    async fn delete(&self, remote_key: &str) -> Result<()>;

    /// `Ok(false)` for a missing object; `Err` only when the backend itself fails.
    async fn exists(&self, remote_key: &str) -> Result<bool>;
}

/// Builds the backend selected by `config`.
pub async fn open_storage(config: &StorageConfig) -> Result<Box<dyn StorageBackend>> {
    match config.kind {
        StorageKind::Local => Ok(Box::new(LocalStorage::new(&config.local_path)?)),
        StorageKind::S3 => Ok(Box::new(S3Storage::connect(config).await?)),
    }
}

/// Rejects keys that could escape the storage root.
pub(crate) fn validate_key(remote_key: &str) -> Result<()> {
    let escapes = Path::new(remote_key).components().any(|c| {
        matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))
    });
    if remote_key.is_empty() || escapes {
        return Err(VaultError::Storage(format!("invalid storage key: {remote_key:?}")));
    }
    Ok(())
}
