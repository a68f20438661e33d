//! Single-writer fan-in of download task results.
//!
//! Workers never touch the plan. Each sends one [`TaskReport`] through a
//! channel and the attempt's owner folds it in with [`Collector::on_report`].

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::Serialize;

use contentsync_core::SyncPlan;
use contentsync_ops::{DownloadError, DownloadOutcome};

use crate::events::SyncEvent;

/// A failed download with enough context to retry or report it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetailedDownloadError {
    pub path: CompactString,
    pub url: Option<String>,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Errors gathered over one attempt.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    messages: Vec<String>,
    detailed: Vec<DetailedDownloadError>,
}

impl ErrorLog {
    pub fn push(&mut self, error: DetailedDownloadError) {
        self.messages
            .push(format!("{}: {}", error.path, error.message));
        self.detailed.push(error);
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn detailed(&self) -> &[DetailedDownloadError] {
        &self.detailed
    }

    pub fn len(&self) -> usize {
        self.detailed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detailed.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.detailed.clear();
    }
}

/// What a worker reports when its task ends.
#[derive(Debug)]
pub enum TaskReport {
    Finished(DownloadOutcome),
    Failed {
        path: CompactString,
        url: Option<String>,
        error: DownloadError,
    },
}

/// Running totals for the downloads of one attempt.
#[derive(Debug)]
pub struct Collector {
    completed: usize,
    total: usize,
    bytes_total: u64,
    last_bytes: u64,
    failed: usize,
    cancelled: usize,
}

impl Collector {
    pub fn new(total: usize, bytes_total: u64) -> Self {
        Self {
            completed: 0,
            total,
            bytes_total,
            last_bytes: 0,
            failed: 0,
            cancelled: 0,
        }
    }

    /// Fold one report into `plan`.
    ///
    /// Returns the error to log when the task failed for a reason other
    /// than cancellation.
    pub fn on_report(
        &mut self,
        plan: &mut SyncPlan,
        report: TaskReport,
    ) -> Option<DetailedDownloadError> {
        self.completed += 1;
        match report {
            TaskReport::Finished(outcome) => {
                plan.mark_staged(&outcome.path);
                None
            }
            TaskReport::Failed { path, error, .. } if error.is_cancelled() => {
                plan.remove_item_to_download(&path);
                self.cancelled += 1;
                None
            }
            TaskReport::Failed { path, url, error } => {
                tracing::warn!(path = %path, err = %error, "download failed");
                plan.record_download_failure(&path);
                self.failed += 1;
                Some(DetailedDownloadError {
                    path,
                    url,
                    message: error.to_string(),
                    occurred_at: Utc::now(),
                })
            }
        }
    }

    /// A progress event for the current byte count.
    ///
    /// `bytes_transferred` is the sum over every task's counter. Retried
    /// or restarted tasks can make that sum dip, so the reported value
    /// never goes below the last one.
    pub fn progress_event(
        &mut self,
        bytes_transferred: u64,
        current: Option<CompactString>,
    ) -> SyncEvent {
        self.last_bytes = self.last_bytes.max(bytes_transferred);
        self.bytes_total = self.bytes_total.max(self.last_bytes);
        SyncEvent::SyncProgress {
            completed: self.completed,
            total: self.total,
            bytes_transferred: self.last_bytes,
            bytes_total: self.bytes_total,
            current,
        }
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use contentsync_core::{FileMeta, SnapshotBuilder, SyncPolicy, compute_sync_plan};

    fn plan_with(paths: &[&str]) -> SyncPlan {
        let when = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let local = SnapshotBuilder::new(when).build();
        let mut remote = SnapshotBuilder::new(when);
        for path in paths {
            remote
                .add_file_at(path, FileMeta::new(10).with_download_url(format!("/{path}")))
                .unwrap();
        }
        compute_sync_plan(&local, &remote.build(), &SyncPolicy::new())
    }

    fn finished(path: &str) -> TaskReport {
        TaskReport::Finished(DownloadOutcome {
            path: path.into(),
            staged_path: path.into(),
            bytes: 10,
        })
    }

    #[test]
    fn test_fan_in_partitions() {
        let mut plan = plan_with(&["a", "b", "c"]);
        let mut collector = Collector::new(3, 30);

        assert!(collector.on_report(&mut plan, finished("a")).is_none());
        let err = collector.on_report(
            &mut plan,
            TaskReport::Failed {
                path: "b".into(),
                url: Some("/b".into()),
                error: DownloadError::MissingUrl { path: "b".into() },
            },
        );
        assert_eq!(err.map(|e| e.path), Some(CompactString::from("b")));
        assert!(
            collector
                .on_report(
                    &mut plan,
                    TaskReport::Failed {
                        path: "c".into(),
                        url: None,
                        error: DownloadError::Cancelled,
                    },
                )
                .is_none()
        );

        assert!(!plan.has_items_to_download());
        assert!(plan.is_staged("a"));
        assert_eq!(plan.failed_downloads().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(collector.failed(), 1);
        assert_eq!(collector.cancelled(), 1);
        assert_eq!(collector.completed(), 3);
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut collector = Collector::new(2, 20);
        let first = collector.progress_event(15, None);
        let second = collector.progress_event(5, None);
        let bytes = |e: &SyncEvent| match e {
            SyncEvent::SyncProgress {
                bytes_transferred, ..
            } => *bytes_transferred,
            _ => unreachable!(),
        };
        assert_eq!(bytes(&first), 15);
        assert_eq!(bytes(&second), 15);

        match collector.progress_event(40, None) {
            SyncEvent::SyncProgress {
                bytes_transferred,
                bytes_total,
                ..
            } => {
                assert_eq!(bytes_transferred, 40);
                assert_eq!(bytes_total, 40);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_error_log() {
        let mut log = ErrorLog::default();
        log.push(DetailedDownloadError {
            path: "x".into(),
            url: None,
            message: "boom".into(),
            occurred_at: Utc::now(),
        });
        assert_eq!(log.messages(), ["x: boom".to_string()]);
        assert_eq!(log.len(), 1);
        log.clear();
        assert!(log.is_empty());
    }
}
