//! Orchestrator error type.

use std::path::PathBuf;

use thiserror::Error;

use contentsync_core::{ConfigError, ParseError, ScanError};
use contentsync_ops::{TransportError, UnpackError};

use crate::state::SyncStatus;

/// Errors surfaced by the sync orchestrator.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another attempt or an apply is running.
    #[error("A sync is already in progress")]
    Busy,

    /// The connectivity precondition failed.
    #[error("Network unavailable")]
    NetworkUnavailable,

    /// The remote rejected our credentials, or none were configured.
    #[error("Authorization failed: {message}")]
    AuthorizationFailed { message: String },

    /// A remote document could not be fetched.
    #[error("Cannot fetch document: {0}")]
    Fetch(TransportError),

    #[error(transparent)]
    MalformedDocument(#[from] ParseError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Some downloads failed; the rest are staged.
    #[error("{failed} of {total} downloads failed")]
    PartialDownloadFailure { failed: usize, total: usize },

    /// There is no verified plan waiting to be applied.
    #[error("No staged changes to apply")]
    NothingToApply,

    #[error(transparent)]
    Unpack(#[from] UnpackError),

    /// A filesystem operation outside a single action failed.
    #[error("I/O error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The persisted state file is unreadable.
    #[error("Invalid sync state file {path}: {source}")]
    State {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A background task died.
    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Create a filesystem error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Terminal status an attempt ending with this error reports.
    pub fn status(&self) -> SyncStatus {
        match self {
            Self::NetworkUnavailable => SyncStatus::NoConnectivity,
            Self::AuthorizationFailed { .. } => SyncStatus::AuthorizationFailed,
            Self::Cancelled => SyncStatus::Cancelled,
            _ => SyncStatus::Failed,
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized { .. } => Self::AuthorizationFailed {
                message: err.to_string(),
            },
            TransportError::Unavailable { .. } => Self::NetworkUnavailable,
            other => Self::Fetch(other),
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}
