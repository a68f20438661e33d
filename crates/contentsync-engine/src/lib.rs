//! Sync orchestration for contentsync.
//!
//! [`SyncOrchestrator`] ties the workspace together: it fetches the remote
//! documents, plans against a live scan, downloads through a bounded worker
//! pool and applies the staged result, notifying registered
//! [`SyncListener`]s along the way.

mod collector;
mod error;
mod events;
mod orchestrator;
mod schedule;
mod state;

pub use collector::{Collector, DetailedDownloadError, ErrorLog, TaskReport};
pub use error::SyncError;
pub use events::{EventBus, EventKind, ListenerId, SyncEvent, SyncListener};
pub use orchestrator::{SyncHandle, SyncOrchestrator};
pub use schedule::{SyncState, sync_due};
pub use state::{SyncPhase, SyncStatus};
