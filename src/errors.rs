use std::time::Duration;

use thiserror::Error;

/// Failure raised by an external dump/restore tool.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{tool} not found on PATH. {hint}")]
    NotFound { tool: &'static str, hint: &'static str },

    #[error("{tool} timed out after {}s", after.as_secs())]
    TimedOut { tool: &'static str, after: Duration },

    #[error("{tool} failed ({status}): {stderr}")]
    Exited {
        tool: &'static str,
        status: String,
        stderr: String,
    },

    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Detail carried by connection/backup/restore failures.
#[derive(Error, Debug)]
pub enum Failure {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Tool(#[from] ToolError),
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Failure::Message(message)
    }
}

impl From<&str> for Failure {
    fn from(message: &str) -> Self {
        Failure::Message(message.to_string())
    }
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Connection failed: {0}")]
    Connection(Failure),

    #[error("Backup failed: {0}")]
    Backup(Failure),

    #[error("Restore failed: {0}")]
    Restore(Failure),

    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("Storage operation failed: object not found: {0}")]
    StorageNotFound(String),

    #[error("Unsupported database engine: {0}")]
    EngineUnsupported(String),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Metadata store error: {0}")]
    Metadata(String),
}

/// The taxonomy callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Backup,
    Restore,
    Compression,
    Storage,
    EngineUnsupported,
    BackupNotFound,
    Config,
    Scheduler,
    Notification,
    Metadata,
}

impl VaultError {
    pub fn connection(detail: impl Into<Failure>) -> Self {
        VaultError::Connection(detail.into())
    }

    pub fn backup(detail: impl Into<Failure>) -> Self {
        VaultError::Backup(detail.into())
    }

    pub fn restore(detail: impl Into<Failure>) -> Self {
        VaultError::Restore(detail.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Connection(_) => ErrorKind::Connection,
            VaultError::Backup(_) => ErrorKind::Backup,
            VaultError::Restore(_) => ErrorKind::Restore,
            VaultError::Compression(_) => ErrorKind::Compression,
            VaultError::Storage(_) | VaultError::StorageNotFound(_) => ErrorKind::Storage,
            VaultError::EngineUnsupported(_) => ErrorKind::EngineUnsupported,
            VaultError::BackupNotFound(_) => ErrorKind::BackupNotFound,
            VaultError::Config(_) => ErrorKind::Config,
            VaultError::Scheduler(_) => ErrorKind::Scheduler,
            VaultError::Notification(_) => ErrorKind::Notification,
            VaultError::Metadata(_) => ErrorKind::Metadata,
        }
    }

    /// The external tool failure underneath, if any.
    pub fn tool_error(&self) -> Option<&ToolError> {
        match self {
            VaultError::Connection(Failure::Tool(t))
            | VaultError::Backup(Failure::Tool(t))
            | VaultError::Restore(Failure::Tool(t)) => Some(t),
            _ => None,
        }
    }

    /// Connection failures and tool timeouts are worth another attempt; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::Connection(_))
            || matches!(self.tool_error(), Some(ToolError::TimedOut { .. }))
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
