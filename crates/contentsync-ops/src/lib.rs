//! Operations for contentsync.
//!
//! This crate provides the side-effecting pieces of a sync: the
//! [`Transport`] seam with its HTTP implementation, the per-file
//! [`DownloadTask`], archive extraction for bootstrapping, and the apply
//! operation that moves staged files into place with progress reporting
//! via channels.

mod apply;
mod download;
mod error;
mod operation;
mod progress;
mod transport;
mod unpack;

pub use apply::{
    ApplyRequest, ApplyResult, apply_action, clear_directory, create_directory, create_symlink,
    move_item, remove_item, start_apply,
};
pub use download::{DownloadOutcome, DownloadRequest, DownloadTask, PART_SUFFIX, part_path};
pub use error::{DownloadError, TransportError, UnpackError};
pub use operation::{ApplyAction, OperationError, join_relative};
pub use progress::{OperationComplete, OperationProgress, TaskProgress};
pub use transport::{BoxFuture, ChunkStream, Download, HttpTransport, Transport, resolve_url};
pub use unpack::{ArchiveExtractor, ArchiveFormat, StandardExtractor, UnpackProgress};

/// Default channel buffer size for operation progress updates.
pub const OPERATION_CHANNEL_SIZE: usize = 100;
