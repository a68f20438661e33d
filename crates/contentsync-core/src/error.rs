//! Error types for snapshots, documents, configuration and scanning.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while assembling a [`Snapshot`](crate::Snapshot).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// Two nodes resolved to the same path.
    #[error("Duplicate path: {path}")]
    DuplicatePath { path: String },

    /// A child was attached to a file or symlink.
    #[error("Not a directory: {path}")]
    NotADirectory { path: String },

    /// A node name that cannot appear in a root-relative path.
    #[error("Invalid node name: {name:?}")]
    InvalidName { name: String },

    /// A parent id that does not belong to this snapshot.
    #[error("Unknown node id: {id}")]
    UnknownNode { id: u32 },
}

/// Errors raised while turning a serialized document into a snapshot.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The document is not valid JSON for the tree schema.
    #[error("Malformed document: {0}")]
    Json(#[from] serde_json::Error),

    /// The tree violates a snapshot invariant.
    #[error("Malformed document: {0}")]
    Snapshot(#[from] SnapshotError),

    /// A timestamp in an unsupported format.
    #[error("Malformed document: invalid timestamp {value:?}")]
    InvalidTimestamp { value: String },

    /// A node whose fields contradict each other.
    #[error("Malformed document: invalid node {path:?}: {reason}")]
    InvalidNode { path: String, reason: String },
}

impl ParseError {
    pub(crate) fn invalid_node(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidNode {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A semantic problem with the configured values.
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    /// The configuration file could not be read.
    #[error("Cannot read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for the schema.
    #[error("Invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// Errors that can occur while scanning a local tree.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Permission denied for a path.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Root path exists but is not a directory.
    #[error("Root path is not a directory: {path}")]
    NotADirectory { path: PathBuf },

    /// The scanned entries could not be assembled into a snapshot.
    #[error("Cannot build snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
}

impl ScanError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }
}
