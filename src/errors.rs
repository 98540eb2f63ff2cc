use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Unreachable host, refused connection, TLS or authentication failure.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Export of {object} failed: {cause}")]
    Export { object: String, cause: String },

    #[error("Compression of {object} failed: {cause}")]
    Compression { object: String, cause: String },

    #[error("Write to {} failed: {cause}", path.display())]
    Write { path: PathBuf, cause: String },

    #[error("Destination {} already exists or is already being written", path.display())]
    DuplicateDestination { path: PathBuf },

    #[error("Invalid backup request: {0}")]
    Validation(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable classification of a [`BackupError`], carried into results and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Query,
    Export,
    Compression,
    Write,
    DuplicateDestination,
    Validation,
    Cancelled,
    Config,
    Internal,
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::Connection(_) => ErrorKind::Connection,
            BackupError::Query(_) => ErrorKind::Query,
            BackupError::Export { .. } => ErrorKind::Export,
            BackupError::Compression { .. } => ErrorKind::Compression,
            BackupError::Write { .. } => ErrorKind::Write,
            BackupError::DuplicateDestination { .. } => ErrorKind::DuplicateDestination,
            BackupError::Validation(_) => ErrorKind::Validation,
            BackupError::Cancelled(_) => ErrorKind::Cancelled,
            BackupError::Config(_) => ErrorKind::Config,
            BackupError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, cause: impl std::fmt::Display) -> Self {
        BackupError::Write {
            path: path.into(),
            cause: cause.to_string(),
        }
    }

    pub(crate) fn export(object: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        BackupError::Export {
            object: object.into(),
            cause: cause.to_string(),
        }
    }
}

/// Maps a driver error onto the connection/query split.
///
/// SQLSTATE class 28 (invalid authorization) counts as a connection failure.
impl From<sqlx::Error> for BackupError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Protocol(_)
            | sqlx::Error::Configuration(_) => BackupError::Connection(err.to_string()),
            sqlx::Error::Database(db_err) => {
                let auth_failure = db_err
                    .code()
                    .map(|code| code.starts_with("28") || code == "3D000")
                    .unwrap_or(false);
                if auth_failure {
                    BackupError::Connection(err.to_string())
                } else {
                    BackupError::Query(err.to_string())
                }
            }
            _ => BackupError::Query(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
