use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use uuid::Uuid;

use crate::errors::{Result, VaultError};
use crate::models::{
    CompressionAlgorithm, CompressionSettings, ConnectionSpec, DatabaseKind, Secret, StorageKind,
};

const APP_NAME: &str = "db-vault";
const ENV_PREFIX: &str = "DB_VAULT_";

/// Filesystem locations, resolved once at startup and passed down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl Paths {
    pub fn new(config_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Paths {
            config_dir: config_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    /// Resolves from the process environment.
    pub fn resolve() -> Self {
        Self::resolve_with(|key| std::env::var(key).ok())
    }

    /// `DB_VAULT_HOME` wins; otherwise the XDG base directories, falling back to `$HOME`.
    pub fn resolve_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(home) = non_empty("DB_VAULT_HOME") {
            let home = PathBuf::from(home);
            return Paths::new(home.clone(), home);
        }

        let user_home = non_empty("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let config_base = non_empty("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| user_home.join(".config"));
        let data_base = non_empty("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| user_home.join(".local").join("share"));

        Paths::new(config_base.join(APP_NAME), data_base.join(APP_NAME))
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.data_dir.join("metadata")
    }

    pub fn jobs_file(&self) -> PathBuf {
        self.data_dir.join("jobs.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Scratch space for dumps before they are compressed and shipped.
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join("work")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.config_dir.clone(),
            self.data_dir.clone(),
            self.metadata_dir(),
            self.log_dir(),
            self.work_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| {
                VaultError::Config(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }
}

/// Replaces `path` with `contents`, readable by the owner only on Unix.
///
/// The data goes to a new 0600 sibling that is renamed over `path`, so the
/// file never exists with wider permissions or half written.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staged = path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()));
    let outcome = create_private(&staged)
        .and_then(|mut file| {
            file.write_all(contents)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&staged, path));
    if outcome.is_err() {
        let _ = fs::remove_file(&staged);
    }
    outcome
}

#[cfg(unix)]
fn create_private(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> io::Result<File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

fn default_local_path() -> PathBuf {
    PathBuf::from("./backups")
}

fn default_s3_prefix() -> String {
    "db-vault/".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "type", default = "default_storage_kind")]
    pub kind: StorageKind,
    #[serde(default = "default_local_path")]
    pub local_path: PathBuf,
    #[serde(default)]
    pub s3_bucket: Option<String>,
    #[serde(default = "default_s3_prefix")]
    pub s3_prefix: String,
    #[serde(default = "default_s3_region")]
    pub s3_region: String,
    #[serde(default)]
    pub s3_endpoint_url: Option<String>,
    /// Static credentials for S3-compatible services. Left unset, the SDK's
    /// default provider chain is used.
    #[serde(default)]
    pub s3_access_key_id: Option<String>,
    #[serde(default)]
    pub s3_secret_access_key: Option<Secret>,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            kind: StorageKind::Local,
            local_path: default_local_path(),
            s3_bucket: None,
            s3_prefix: default_s3_prefix(),
            s3_region: default_s3_region(),
            s3_endpoint_url: None,
            s3_access_key_id: None,
            s3_secret_access_key: None,
        }
    }
}

impl StorageConfig {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        StorageConfig {
            local_path: path.into(),
            ..Default::default()
        }
    }
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub slack_webhook_url: Option<Secret>,
    #[serde(default = "yes")]
    pub notify_on_success: bool,
    #[serde(default = "yes")]
    pub notify_on_failure: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        NotificationConfig {
            slack_webhook_url: None,
            notify_on_success: true,
            notify_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Console,
    Json,
}

impl FromStr for LogFormat {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" => Ok(LogFormat::Console),
            "json" => Ok(LogFormat::Json),
            other => Err(VaultError::Config(format!("unknown log format: {other}"))),
        }
    }
}

fn default_log_level() -> String {
    "INFO".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            log_file: None,
            format: LogFormat::Console,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub databases: BTreeMap<String, ConnectionSpec>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub compression: CompressionSettings,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Reads the JSON config file. A missing file yields the defaults.
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(AppConfig::default());
        }
        let content = fs::read_to_string(config_path).map_err(|e| {
            VaultError::Config(format!(
                "failed to read config file at {}: {e}",
                config_path.display()
            ))
        })?;
        let mut config: AppConfig = serde_json::from_str(&content).map_err(|e| {
            VaultError::Config(format!(
                "failed to parse JSON from config file at {}: {e}",
                config_path.display()
            ))
        })?;
        config.databases = std::mem::take(&mut config.databases)
            .into_iter()
            .map(|(name, spec)| (name, spec.normalized()))
            .collect();
        config.compression.validate()?;
        Ok(config)
    }

    /// File first, then `DB_VAULT_*` variables from the process environment.
    pub fn load(config_path: &Path) -> Result<Self> {
        let mut config = Self::load_from_json(config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies `DB_VAULT_*` overrides. `lookup` receives the full variable name.
    ///
    /// `DB_VAULT_DB_TYPE` builds (or replaces) the `default` profile from the
    /// `DB_VAULT_DB_*` variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| lookup(&format!("{ENV_PREFIX}{key}")).filter(|v| !v.is_empty());

        if let Some(kind) = env("DB_TYPE") {
            let kind = DatabaseKind::from_str(&kind).map_err(|e| {
                VaultError::Config(format!("invalid database config in environment: {e}"))
            })?;
            let mut spec = ConnectionSpec::new(kind, env("DB_NAME").unwrap_or_default());
            spec.port = None;
            if let Some(host) = env("DB_HOST") {
                spec.host = host;
            }
            if let Some(port) = env("DB_PORT") {
                spec.port = Some(port.parse().map_err(|_| {
                    VaultError::Config(format!(
                        "invalid database config in environment: bad port {port}"
                    ))
                })?);
            }
            spec.username = env("DB_USERNAME");
            spec.password = env("DB_PASSWORD").map(Secret::new);
            spec.ssl = env("DB_SSL").map(|v| parse_flag(&v)).unwrap_or(false);
            self.databases.insert("default".to_string(), spec.normalized());
        }

        if let Some(kind) = env("STORAGE_TYPE") {
            self.storage.kind = kind.parse()?;
        }
        if let Some(path) = env("STORAGE_LOCAL_PATH") {
            self.storage.local_path = PathBuf::from(path);
        }
        if let Some(bucket) = env("S3_BUCKET") {
            self.storage.s3_bucket = Some(bucket);
        }
        if let Some(prefix) = env("S3_PREFIX") {
            self.storage.s3_prefix = prefix;
        }
        if let Some(region) = env("S3_REGION") {
            self.storage.s3_region = region;
        }
        if let Some(endpoint) = env("S3_ENDPOINT_URL") {
            self.storage.s3_endpoint_url = Some(endpoint);
        }

        if let Some(algorithm) = env("COMPRESSION") {
            self.compression.algorithm = CompressionAlgorithm::from_str(&algorithm)?;
        }
        if let Some(level) = env("COMPRESSION_LEVEL") {
            self.compression.level = level.parse().map_err(|_| {
                VaultError::Config(format!("invalid compression level in environment: {level}"))
            })?;
        }
        self.compression.validate()?;

        if let Some(webhook) = env("SLACK_WEBHOOK_URL") {
            self.notification.slack_webhook_url = Some(Secret::new(webhook));
        }

        if let Some(level) = env("LOG_LEVEL") {
            self.logging.level = level.to_ascii_uppercase();
        }
        if let Some(file) = env("LOG_FILE") {
            self.logging.log_file = Some(PathBuf::from(file));
        }
        if let Some(format) = env("LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        Ok(())
    }

    /// Writes the config as pretty JSON, readable by the owner only on Unix.
    pub fn save(&self, config_path: &Path) -> Result<PathBuf> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                VaultError::Config(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| VaultError::Config(format!("failed to serialize config: {e}")))?;
        write_private(config_path, content.as_bytes()).map_err(|e| {
            VaultError::Config(format!(
                "failed to write config file at {}: {e}",
                config_path.display()
            ))
        })?;
        Ok(config_path.to_path_buf())
    }

    /// Looks up a named database profile.
    pub fn profile(&self, name: &str) -> Result<ConnectionSpec> {
        self.databases.get(name).cloned().ok_or_else(|| {
            let known: Vec<&str> = self.databases.keys().map(String::as_str).collect();
            VaultError::Config(format!(
                "database profile '{name}' not found (configured: {})",
                if known.is_empty() {
                    "none".to_string()
                } else {
                    known.join(", ")
                }
            ))
        })
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}
