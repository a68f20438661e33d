//! Progress reporting types for sync operations.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::OperationError;

/// Progress of an apply run, sent after every action.
#[derive(Debug, Clone)]
pub struct OperationProgress {
    /// Number of actions finished.
    pub files_completed: usize,
    /// Total number of actions.
    pub files_total: usize,
    /// Bytes moved into place so far.
    pub bytes_processed: u64,
    /// Errors encountered so far.
    pub errors: Vec<OperationError>,
}

impl OperationProgress {
    pub fn new(files_total: usize) -> Self {
        Self {
            files_completed: 0,
            files_total,
            bytes_processed: 0,
            errors: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: OperationError) {
        self.files_completed += 1;
        self.errors.push(error);
    }

    /// Count a finished action and the bytes it moved.
    pub fn complete_file(&mut self, bytes: u64) {
        self.files_completed += 1;
        self.bytes_processed += bytes;
    }
}

/// Result of a finished apply run.
#[derive(Debug, Clone)]
pub struct OperationComplete {
    pub succeeded: usize,
    pub failed: usize,
    /// Total bytes moved into place.
    pub bytes_processed: u64,
    pub errors: Vec<OperationError>,
}

impl OperationComplete {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn summary(&self) -> String {
        if self.failed == 0 {
            format!("Applied {} items", self.succeeded)
        } else {
            format!("Applied {} items, {} failed", self.succeeded, self.failed)
        }
    }
}

/// Byte counters shared between a running task and its observers.
///
/// Both counters only ever grow.
#[derive(Debug, Default)]
pub struct TaskProgress {
    bytes_transferred: AtomicU64,
    bytes_total: AtomicU64,
}

impl TaskProgress {
    pub fn new(bytes_total: u64) -> Self {
        Self {
            bytes_transferred: AtomicU64::new(0),
            bytes_total: AtomicU64::new(bytes_total),
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total.load(Ordering::Relaxed)
    }

    /// Fraction done in `0.0..=1.0`; zero while the total is unknown.
    pub fn fraction(&self) -> f64 {
        let total = self.bytes_total();
        if total == 0 {
            return 0.0;
        }
        (self.bytes_transferred() as f64 / total as f64).min(1.0)
    }

    /// Record `n` more bytes.
    pub fn add(&self, n: u64) {
        self.bytes_transferred.fetch_add(n, Ordering::Relaxed);
    }

    /// Raise the total if a larger one becomes known.
    pub fn raise_total(&self, total: u64) {
        self.bytes_total.fetch_max(total, Ordering::Relaxed);
    }
}
