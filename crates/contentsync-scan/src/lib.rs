//! Local directory scanning for contentsync.
//!
//! Walks a directory with jwalk and assembles a [`Snapshot`] with the same
//! path space as parsed remote documents, so the two can be diffed.
//!
//! # Example
//!
//! ```rust,no_run
//! use contentsync_scan::{LocalScanner, ScanConfig};
//!
//! let config = ScanConfig::new("/path/to/content");
//! let snapshot = LocalScanner::new().scan(&config).unwrap();
//!
//! println!("Total size: {} bytes", snapshot.total_size());
//! println!("Total files: {}", snapshot.list_files().len());
//! ```

mod scanner;

pub use scanner::LocalScanner;

// Re-export core types for convenience
pub use contentsync_core::{ScanConfig, ScanError, Snapshot};
