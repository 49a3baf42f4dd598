use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart, ServerSideEncryption};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use super::{StorageBackend, validate_key};
use crate::config::StorageConfig;
use crate::errors::{Result, VaultError};
use crate::models::{StorageKind, StorageObject};

pub const MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024;
pub const MULTIPART_PART_SIZE: u64 = 50 * 1024 * 1024;
pub const MAX_CONCURRENT_PARTS: usize = 10;

/// Backups kept in an S3 (or S3-compatible) bucket under a key prefix.
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: s3::Client,
    bucket: String,
    prefix: String,
}

/// `"backups"` and `"backups///"` both become `"backups/"`; blank stays blank.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// Splits `size` bytes into `(part_number, offset, length)` triples.
pub fn plan_parts(size: u64, part_size: u64) -> Vec<(i32, u64, u64)> {
    let mut parts = Vec::new();
    let mut offset = 0;
    let mut number = 1;
    while offset < size {
        let len = part_size.min(size - offset);
        parts.push((number, offset, len));
        offset += len;
        number += 1;
    }
    parts
}

/// Logs transfer progress at every 10% boundary.
struct Progress<'a> {
    key: &'a str,
    total: u64,
    done: AtomicU64,
    last_decile: AtomicU64,
}

impl<'a> Progress<'a> {
    fn new(key: &'a str, total: u64) -> Self {
        Progress {
            key,
            total,
            done: AtomicU64::new(0),
            last_decile: AtomicU64::new(0),
        }
    }

    fn advance(&self, bytes: u64) {
        if self.total == 0 {
            return;
        }
        let done = self.done.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let decile = done * 10 / self.total;
        if self.last_decile.fetch_max(decile, Ordering::Relaxed) < decile {
            info!(key = self.key, percent = decile * 10, "s3 upload progress");
        }
    }
}

impl S3Storage {
    /// Builds a client from the ambient AWS configuration plus any endpoint
    /// or static credentials in `config`.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let bucket = config
            .s3_bucket
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| VaultError::Config("s3_bucket is required for S3 storage".to_string()))?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.s3_region.clone()));
        if let Some(endpoint) = &config.s3_endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(key_id), Some(secret)) =
            (&config.s3_access_key_id, &config.s3_secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                key_id,
                secret.expose(),
                None,
                None,
                "Static",
            ));
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(config.s3_endpoint_url.is_some())
            .build();

        Ok(Self::with_client(
            s3::Client::from_conf(s3_config),
            bucket,
            &config.s3_prefix,
        ))
    }

    pub fn with_client(client: s3::Client, bucket: impl Into<String>, prefix: &str) -> Self {
        S3Storage {
            client,
            bucket: bucket.into(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn full_key(&self, remote_key: &str) -> Result<String> {
        validate_key(remote_key)?;
        Ok(format!("{}{}", self.prefix, remote_key))
    }

    fn strip_prefix<'k>(&self, key: &'k str) -> &'k str {
        key.strip_prefix(self.prefix.as_str()).unwrap_or(key)
    }

    fn location(&self, full_key: &str) -> String {
        format!("s3://{}/{}", self.bucket, full_key)
    }

    async fn put_single(&self, local_path: &Path, full_key: &str) -> Result<()> {
        let body = ByteStream::from_path(local_path).await.map_err(|e| {
            VaultError::Storage(format!(
                "failed to read {} for upload: {e}",
                local_path.display()
            ))
        })?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(full_key)
            .server_side_encryption(ServerSideEncryption::Aes256)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                VaultError::Storage(format!(
                    "S3 upload of {} failed: {}",
                    self.location(full_key),
                    s3::error::DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    async fn put_multipart(&self, local_path: &Path, full_key: &str, size: u64) -> Result<()> {
        let parts = plan_parts(size, MULTIPART_PART_SIZE);
        info!(
            key = full_key,
            size,
            parts = parts.len(),
            "starting multipart upload"
        );

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(full_key)
            .server_side_encryption(ServerSideEncryption::Aes256)
            .send()
            .await
            .map_err(|e| {
                VaultError::Storage(format!(
                    "failed to initiate multipart upload for {}: {}",
                    self.location(full_key),
                    s3::error::DisplayErrorContext(&e)
                ))
            })?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| VaultError::Storage("no upload id returned by S3".to_string()))?
            .to_string();

        let progress = Progress::new(full_key, size);
        let uploaded: Result<Vec<CompletedPart>> = stream::iter(parts)
            .map(|(number, offset, len)| {
                self.put_part(local_path, full_key, &upload_id, number, offset, len, &progress)
            })
            .buffer_unordered(MAX_CONCURRENT_PARTS)
            .try_collect()
            .await;

        let mut completed = match uploaded {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(full_key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key = full_key, error = %abort, "failed to abort multipart upload");
                }
                return Err(e);
            }
        };
        completed.sort_by_key(|p| p.part_number());

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(full_key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                VaultError::Storage(format!(
                    "failed to complete multipart upload for {}: {}",
                    self.location(full_key),
                    s3::error::DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn put_part(
        &self,
        local_path: &Path,
        full_key: &str,
        upload_id: &str,
        number: i32,
        offset: u64,
        len: u64,
        progress: &Progress<'_>,
    ) -> Result<CompletedPart> {
        let read_err = |e: std::io::Error| {
            VaultError::Storage(format!(
                "failed to read part {number} of {}: {e}",
                local_path.display()
            ))
        };
        let mut file = tokio::fs::File::open(local_path).await.map_err(read_err)?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(read_err)?;
        let mut buffer = vec![0u8; len as usize];
        file.read_exact(&mut buffer).await.map_err(read_err)?;

        debug!(key = full_key, part = number, bytes = len, "uploading part");
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(full_key)
            .upload_id(upload_id)
            .part_number(number)
            .body(ByteStream::from(buffer))
            .send()
            .await
            .map_err(|e| {
                VaultError::Storage(format!(
                    "upload of part {number} for {} failed: {}",
                    self.location(full_key),
                    s3::error::DisplayErrorContext(&e)
                ))
            })?;
        progress.advance(len);

        Ok(CompletedPart::builder()
            .part_number(number)
            .set_e_tag(output.e_tag().map(str::to_string))
            .build())
    }
}

fn to_chrono(ts: &s3::primitives::DateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts.secs(), ts.subsec_nanos()).unwrap_or_else(Utc::now)
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn kind(&self) -> StorageKind {
        StorageKind::S3
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<String> {
        let full_key = self.full_key(remote_key)?;
        let size = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| {
                VaultError::Storage(format!("failed to stat {}: {e}", local_path.display()))
            })?
            .len();

        info!(bucket = %self.bucket, key = %full_key, size, "s3 upload start");
        if size > MULTIPART_THRESHOLD {
            self.put_multipart(local_path, &full_key, size).await?;
        } else {
            self.put_single(local_path, &full_key).await?;
        }

        let location = self.location(&full_key);
        info!(location = %location, size, "s3 upload complete");
        Ok(location)
    }

    async fn download(&self, remote_key: &str, local_path: &Path) -> Result<PathBuf> {
        let full_key = self.full_key(remote_key)?;
        if let Some(parent) = local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                VaultError::Storage(format!(
                    "failed to create directory for download {}: {e}",
                    parent.display()
                ))
            })?;
        }

        info!(bucket = %self.bucket, key = %full_key, "s3 download start");
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    VaultError::StorageNotFound(self.location(&full_key))
                } else {
                    VaultError::Storage(format!(
                        "S3 download of {} failed: {}",
                        self.location(&full_key),
                        s3::error::DisplayErrorContext(&e)
                    ))
                }
            })?;

        let mut body = object.body.into_async_read();
        let mut file = tokio::fs::File::create(local_path).await.map_err(|e| {
            VaultError::Storage(format!(
                "failed to create destination file {}: {e}",
                local_path.display()
            ))
        })?;
        let written = match tokio::io::copy(&mut body, &mut file).await {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(local_path).await;
                return Err(VaultError::Storage(format!(
                    "failed to write downloaded file {}: {e}",
                    local_path.display()
                )));
            }
        };

        info!(destination = %local_path.display(), size = written, "s3 download complete");
        Ok(local_path.to_path_buf())
    }

    async fn list_backups(&self, prefix: &str) -> Result<Vec<StorageObject>> {
        let full_prefix = format!("{}{}", self.prefix, prefix);
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&full_prefix)
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                VaultError::Storage(format!(
                    "failed to list S3 objects under {}: {}",
                    self.location(&full_prefix),
                    s3::error::DisplayErrorContext(&e)
                ))
            })?;
            for obj in page.contents() {
                let Some(key) = obj.key() else { continue };
                objects.push(StorageObject {
                    key: self.strip_prefix(key).to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified: obj.last_modified().map(to_chrono).unwrap_or_else(Utc::now),
                });
            }
        }
        Ok(objects)
    }

    async fn delete(&self, remote_key: &str) -> Result<()> {
        // DeleteObject succeeds on missing keys, so check first.
        if !self.exists(remote_key).await? {
            return Err(VaultError::StorageNotFound(
                self.location(&self.full_key(remote_key)?),
            ));
        }
        let full_key = self.full_key(remote_key)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| {
                VaultError::Storage(format!(
                    "failed to delete {}: {}",
                    self.location(&full_key),
                    s3::error::DisplayErrorContext(&e)
                ))
            })?;
        info!(bucket = %self.bucket, key = %full_key, "s3 delete complete");
        Ok(())
    }

    async fn exists(&self, remote_key: &str) -> Result<bool> {
        let full_key = self.full_key(remote_key)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(VaultError::Storage(format!(
                "failed to check {}: {}",
                self.location(&full_key),
                s3::error::DisplayErrorContext(&e)
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_storage(prefix: &str) -> S3Storage {
        let conf = s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .build();
        S3Storage::with_client(s3::Client::from_conf(conf), "bucket", prefix)
    }

    #[test]
    fn prefix_is_normalized_with_single_trailing_slash() {
        assert_eq!(normalize_prefix("db-vault"), "db-vault/");
        assert_eq!(normalize_prefix("db-vault///"), "db-vault/");
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
    }

    #[test]
    fn keys_are_prefixed_and_stripped_symmetrically() -> anyhow::Result<()> {
        let storage = offline_storage("team/backups");
        let full = storage.full_key("postgres/app/2024-01-01/a.dump.zst")?;
        assert_eq!(full, "team/backups/postgres/app/2024-01-01/a.dump.zst");
        assert_eq!(storage.strip_prefix(&full), "postgres/app/2024-01-01/a.dump.zst");
        assert_eq!(storage.location(&full), format!("s3://bucket/{full}"));
        assert!(storage.full_key("../x").is_err());
        Ok(())
    }

    #[test]
    fn parts_cover_the_file_exactly() {
        let size = 2 * MULTIPART_PART_SIZE + 123;
        let parts = plan_parts(size, MULTIPART_PART_SIZE);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], (1, 0, MULTIPART_PART_SIZE));
        assert_eq!(parts[2], (3, 2 * MULTIPART_PART_SIZE, 123));
        assert_eq!(parts.iter().map(|p| p.2).sum::<u64>(), size);
        assert!(plan_parts(0, MULTIPART_PART_SIZE).is_empty());
    }

    #[test]
    fn progress_reports_each_decile_once() {
        let progress = Progress::new("k", 100);
        progress.advance(5);
        assert_eq!(progress.last_decile.load(Ordering::Relaxed), 0);
        progress.advance(10);
        assert_eq!(progress.last_decile.load(Ordering::Relaxed), 1);
        progress.advance(85);
        assert_eq!(progress.last_decile.load(Ordering::Relaxed), 10);
    }
}
