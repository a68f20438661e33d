//! Core types for contentsync.
//!
//! This crate provides the data structures shared by the rest of the
//! workspace: content snapshots and their wire format, content categories,
//! sync plans and the planner that computes them, and configuration.

mod category;
mod config;
mod document;
mod error;
mod node;
mod plan;
mod planner;
mod snapshot;

pub use category::{Category, CategoryMatcher};
pub use config::{
    STATE_FILE_NAME, ScanConfig, ScanConfigBuilder, SyncConfig, SyncConfigBuilder,
    SyncConfigBuilderError,
};
pub use document::{
    ContentDocument, DocumentNode, DocumentParser, JsonDocumentParser, Timestamp, parse_timestamp,
};
pub use error::{ConfigError, ParseError, ScanError, SnapshotError};
pub use node::{ContentNode, FileMeta, NodeId, NodeKind};
pub use plan::{PlanEntry, SyncPlan, is_text_file};
pub use planner::{SyncPolicy, compute_sync_plan, compute_sync_plan_with_staged, structure_differs};
pub use snapshot::{Snapshot, SnapshotBuilder, join_path};
