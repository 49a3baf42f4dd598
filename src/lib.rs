//! Database backup and restore: dump, compress, checksum, ship to local or S3
//! storage, and bring it back.

pub mod backup;
pub mod compression;
pub mod config;
pub mod engines;
pub mod errors;
pub mod logging;
pub mod metadata;
pub mod models;
pub mod notifications;
pub mod restore;
pub mod scheduler;
pub mod storage;

pub use errors::{ErrorKind, Result, VaultError};
