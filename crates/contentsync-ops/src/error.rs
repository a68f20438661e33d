//! Error types for remote access, downloads and archive extraction.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while talking to the content server.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The server could not be reached at all.
    #[error("Network unavailable while fetching {url}: {message}")]
    Unavailable { url: String, message: String },

    /// The server rejected our credentials.
    #[error("Authorization failed for {url} (HTTP {status})")]
    Unauthorized { url: String, status: u16 },

    /// Any other non-success response.
    #[error("Unexpected HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    /// A URL could not be parsed or resolved.
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The response body broke off or could not be read.
    #[error("Failed reading response from {url}: {message}")]
    Body { url: String, message: String },
}

impl TransportError {
    /// Whether this error means the remote refused our credentials.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Whether this error means the remote could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Errors raised by a single download task.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The remote entry carries no download URL.
    #[error("No download URL for {path}")]
    MissingUrl { path: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The body length disagrees with the advertised file size.
    #[error("Size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// Writing the staged file failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The task observed its cancellation token.
    #[error("Download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors raised while unpacking an archive.
#[derive(Debug, Error)]
pub enum UnpackError {
    /// The archive extension is not one we can read.
    #[error("Unsupported archive format: {path}")]
    UnsupportedFormat { path: PathBuf },

    /// An entry would land outside the destination directory.
    #[error("Archive entry escapes destination: {name}")]
    UnsafeEntry { name: String },

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unpack cancelled")]
    Cancelled,
}

impl UnpackError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
