//! Connection specs, backup records and the other value types shared by the
//! engines, storage backends and pipelines.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::VaultError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Postgres,
    Mysql,
    Mongodb,
    Sqlite,
}

impl DatabaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Postgres => "postgres",
            DatabaseKind::Mysql => "mysql",
            DatabaseKind::Mongodb => "mongodb",
            DatabaseKind::Sqlite => "sqlite",
        }
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            DatabaseKind::Postgres => Some(5432),
            DatabaseKind::Mysql => Some(3306),
            DatabaseKind::Mongodb => Some(27017),
            DatabaseKind::Sqlite => None,
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DatabaseKind::Postgres),
            "mysql" | "mariadb" => Ok(DatabaseKind::Mysql),
            "mongodb" | "mongo" => Ok(DatabaseKind::Mongodb),
            "sqlite" | "sqlite3" => Ok(DatabaseKind::Sqlite),
            other => Err(VaultError::EngineUnsupported(other.to_string())),
        }
    }
}

/// A password or token. Never printed, never serialized into metadata.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

/// Where and how to reach a database.
///
/// For sqlite, `database` is a filesystem path and the network fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    #[serde(rename = "type")]
    pub kind: DatabaseKind,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<Secret>,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub ssl: bool,
}

impl ConnectionSpec {
    pub fn new(kind: DatabaseKind, database: impl Into<String>) -> Self {
        ConnectionSpec {
            kind,
            host: default_host(),
            port: kind.default_port(),
            username: None,
            password: None,
            database: database.into(),
            ssl: false,
        }
    }

    pub fn sqlite(path: impl AsRef<Path>) -> Self {
        ConnectionSpec::new(DatabaseKind::Sqlite, path.as_ref().to_string_lossy())
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: Option<Secret>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    /// Fills in the per-kind default port. Deserialized specs go through this too.
    pub fn normalized(mut self) -> Self {
        if self.port.is_none() {
            self.port = self.kind.default_port();
        }
        if self.kind == DatabaseKind::Sqlite {
            self.port = None;
        }
        self
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.or(self.kind.default_port()).unwrap_or_default()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(Secret::expose)
    }

    /// Connection string with the password left out.
    pub fn describe(&self) -> String {
        if self.kind == DatabaseKind::Sqlite {
            return format!("sqlite:///{}", self.database);
        }
        let user = self.username.as_deref().unwrap_or("");
        let host = match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        };
        format!("{}://{}@{}/{}", self.kind, user, host, self.database)
    }

    /// Label used in storage keys and metadata: database name, sqlite file stem, or `default`.
    pub fn database_label(&self) -> String {
        if self.kind == DatabaseKind::Sqlite {
            return Path::new(&self.database)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "default".to_string());
        }
        if self.database.is_empty() {
            "default".to_string()
        } else {
            self.database.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    #[default]
    Full,
    Incremental,
    Differential,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::Differential => "differential",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            "differential" => Ok(BackupType::Differential),
            other => Err(VaultError::Config(format!("unknown backup type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Zstd,
    Gzip,
    Lz4,
    None,
}

impl CompressionAlgorithm {
    pub const ALL: [CompressionAlgorithm; 4] = [
        CompressionAlgorithm::Zstd,
        CompressionAlgorithm::Gzip,
        CompressionAlgorithm::Lz4,
        CompressionAlgorithm::None,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Zstd => "zstd",
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::None => "none",
        }
    }

    /// Filename suffix, including the dot. Empty for `None`.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Zstd => ".zst",
            CompressionAlgorithm::Gzip => ".gz",
            CompressionAlgorithm::Lz4 => ".lz4",
            CompressionAlgorithm::None => "",
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zstd" => Ok(CompressionAlgorithm::Zstd),
            "gzip" | "gz" => Ok(CompressionAlgorithm::Gzip),
            "lz4" => Ok(CompressionAlgorithm::Lz4),
            "none" => Ok(CompressionAlgorithm::None),
            other => Err(VaultError::Config(format!("unknown compression algorithm: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    pub algorithm: CompressionAlgorithm,
    pub level: i32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        CompressionSettings {
            algorithm: CompressionAlgorithm::Zstd,
            level: 3,
        }
    }
}

impl CompressionSettings {
    pub fn validate(&self) -> Result<(), VaultError> {
        if !(1..=22).contains(&self.level) {
            return Err(VaultError::Config(format!(
                "compression level must be between 1 and 22, got {}",
                self.level
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    S3,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Local => "local",
            StorageKind::S3 => "s3",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(StorageKind::Local),
            "s3" => Ok(StorageKind::S3),
            other => Err(VaultError::Config(format!("unknown storage type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackupStatus::Pending => "pending",
            BackupStatus::InProgress => "in_progress",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        })
    }
}

/// One backup attempt, persisted once the pipeline finishes either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub database_name: String,
    pub database_type: DatabaseKind,
    pub backup_type: BackupType,
    pub file_name: String,
    pub file_path: String,
    pub file_size: u64,
    pub compressed_size: u64,
    pub compression: CompressionAlgorithm,
    pub checksum_sha256: String,
    pub duration_seconds: f64,
    pub status: BackupStatus,
    pub storage_type: StorageKind,
    pub error_message: Option<String>,
    pub tables: Option<Vec<String>>,
}

impl BackupRecord {
    pub fn pending(
        spec: &ConnectionSpec,
        backup_type: BackupType,
        compression: CompressionAlgorithm,
        storage_type: StorageKind,
        tables: Option<Vec<String>>,
    ) -> Self {
        let database_name = if spec.database.is_empty() {
            spec.host.clone()
        } else {
            spec.database.clone()
        };
        BackupRecord {
            id: new_record_id(),
            timestamp: Utc::now(),
            database_name,
            database_type: spec.kind,
            backup_type,
            file_name: String::new(),
            file_path: String::new(),
            file_size: 0,
            compressed_size: 0,
            compression,
            checksum_sha256: String::new(),
            duration_seconds: 0.0,
            status: BackupStatus::Pending,
            storage_type,
            error_message: None,
            tables,
        }
    }

    /// compressed / raw. Lower is better; 0.0 when nothing was dumped.
    pub fn compression_ratio(&self) -> f64 {
        if self.file_size == 0 {
            return 0.0;
        }
        self.compressed_size as f64 / self.file_size as f64
    }

    pub fn size_human(&self) -> String {
        let size = if self.compressed_size > 0 {
            self.compressed_size
        } else {
            self.file_size
        };
        human_size(size)
    }
}

fn new_record_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// What to restore, and how.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreSpec {
    pub backup_file: PathBuf,
    pub target_database: Option<String>,
    pub tables: Option<Vec<String>>,
    pub dry_run: bool,
    pub drop_existing: bool,
    pub no_owner: bool,
}

impl RestoreSpec {
    pub fn new(backup_file: impl Into<PathBuf>) -> Self {
        RestoreSpec {
            backup_file: backup_file.into(),
            ..Default::default()
        }
    }
}

/// An entry returned by `StorageBackend::list_backups`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageObject {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

pub fn human_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1} PB")
}

/// Splits a comma-separated table list, dropping blanks.
pub fn parse_table_list(raw: Option<&str>) -> Option<Vec<String>> {
    let tables: Vec<String> = raw?
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if tables.is_empty() { None } else { Some(tables) }
}
