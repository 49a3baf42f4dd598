use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::{BackupRequest, PipelineStage, remote_key};
use crate::compression;
use crate::engines::{DatabaseEngine, ensure_supported};
use crate::errors::{Result, VaultError};
use crate::metadata::MetadataStore;
use crate::models::{BackupRecord, BackupStatus, CompressionAlgorithm};
use crate::storage::StorageBackend;

/// Runs connect, dump, compress, checksum and upload in order, stopping at the
/// first failure.
///
/// Step failures do not surface as `Err`: they are recorded on the returned
/// record (`status == Failed`, `error_message` set and naming the step that
/// failed). The record is persisted to `metadata` either way, and `Err` means
/// that write itself failed.
pub async fn run_backup(
    engine: &dyn DatabaseEngine,
    storage: &dyn StorageBackend,
    metadata: &MetadataStore,
    request: &BackupRequest,
) -> Result<BackupRecord> {
    let mut record = BackupRecord::pending(
        engine.spec(),
        request.backup_type,
        request.compression.algorithm,
        storage.kind(),
        request.tables.clone(),
    );
    record.status = BackupStatus::InProgress;

    info!(
        id = %record.id,
        database = %engine.spec().describe(),
        backup_type = %request.backup_type,
        compression = %request.compression.algorithm,
        storage = %storage.kind(),
        "backup started"
    );

    let started = Instant::now();
    let mut stage = PipelineStage::Pending;
    let outcome = execute(engine, storage, request, &mut record, &mut stage).await;
    record.duration_seconds = started.elapsed().as_secs_f64();

    match outcome {
        Ok(()) => {
            record.status = BackupStatus::Completed;
            info!(
                id = %record.id,
                file = %record.file_name,
                location = %record.file_path,
                size = %record.size_human(),
                seconds = format!("{:.1}", record.duration_seconds),
                "backup completed"
            );
        }
        Err(e) => {
            let failed_at = stage;
            enter(&mut stage, PipelineStage::Failed);
            record.status = BackupStatus::Failed;
            record.error_message = Some(format!("{e} (stage: {failed_at})"));
            error!(
                id = %record.id,
                stage = %failed_at,
                database = %record.database_name,
                error = %e,
                "backup failed"
            );
        }
    }

    metadata.save(&record)?;
    Ok(record)
}

fn enter(stage: &mut PipelineStage, next: PipelineStage) {
    debug!(from = %stage, to = %next, "pipeline stage");
    *stage = next;
}

async fn execute(
    engine: &dyn DatabaseEngine,
    storage: &dyn StorageBackend,
    request: &BackupRequest,
    record: &mut BackupRecord,
    stage: &mut PipelineStage,
) -> Result<()> {
    enter(stage, PipelineStage::Connecting);
    ensure_supported(engine.kind(), engine.supported_backup_types(), request.backup_type)?;
    engine.test_connection().await?;

    enter(stage, PipelineStage::Dumping);
    let raw = engine
        .backup(&request.work_dir, request.backup_type, request.tables.as_deref())
        .await?;
    record.file_size = file_len(&raw).await.map_err(VaultError::backup)?;

    let algorithm = request.compression.algorithm;
    let artifact = if algorithm == CompressionAlgorithm::None {
        record.compressed_size = record.file_size;
        raw
    } else {
        enter(stage, PipelineStage::Compressing);
        let level = request.compression.level;
        let source = raw.clone();
        let compressed =
            blocking(move || compression::compress(&source, algorithm, level, None)).await?;
        record.compressed_size = file_len(&compressed)
            .await
            .map_err(VaultError::Compression)?;
        if compressed != raw {
            if let Err(e) = tokio::fs::remove_file(&raw).await {
                warn!(file = %raw.display(), error = %e, "failed to remove uncompressed dump");
            }
        }
        compressed
    };
    record.file_name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    enter(stage, PipelineStage::Checksumming);
    let target = artifact.clone();
    record.checksum_sha256 = blocking(move || compression::checksum(&target)).await?;

    enter(stage, PipelineStage::Uploading);
    let key = remote_key(
        engine.kind(),
        &engine.spec().database_label(),
        record.timestamp,
        &record.file_name,
    );
    let location = storage.upload(&artifact, &key).await?;
    record.file_path = location.clone();

    if !same_location(&artifact, &location) {
        if let Err(e) = tokio::fs::remove_file(&artifact).await {
            warn!(file = %artifact.display(), error = %e, "failed to remove staged backup");
        }
    }

    enter(stage, PipelineStage::Completed);
    Ok(())
}

/// Size of a file the previous step claims to have written.
async fn file_len(path: &Path) -> std::result::Result<u64, String> {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .map_err(|e| format!("expected output {} is missing: {e}", path.display()))
}

fn same_location(local: &Path, location: &str) -> bool {
    match (
        std::fs::canonicalize(local),
        std::fs::canonicalize(PathBuf::from(location)),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VaultError::Compression(format!("worker task failed: {e}")))?
}
