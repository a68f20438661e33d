//! Persisted sync timestamps and the scheduling rule built on them.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// What survives between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// End of the last attempt that finished downloading without errors.
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,
    /// Remote `generated_on` of the last applied document.
    #[serde(default)]
    pub last_generated_on: Option<DateTime<Utc>>,
}

impl SyncState {
    /// Read the state file.
    ///
    /// A missing or unreadable file yields the default state; the next
    /// successful sync rewrites it.
    pub fn load(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(err) => {
                tracing::warn!(path = %path.display(), err = %err, "cannot read sync state");
                return Self::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(path = %path.display(), err = %err, "ignoring corrupt sync state");
                Self::default()
            }
        }
    }

    /// Write the state file via a temporary file and a rename.
    pub fn save(&self, path: &Path) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(|source| SyncError::State {
            path: path.to_path_buf(),
            source,
        })?;
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = std::path::PathBuf::from(tmp);
        std::fs::write(&tmp, json).map_err(|e| SyncError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| SyncError::io(path, e))
    }
}

/// Whether a scheduled sync is due.
///
/// Never-synced installations are always due. A last success in the future
/// (clock moved backwards) counts as due too.
pub fn sync_due(last_success: Option<DateTime<Utc>>, interval: Duration, now: DateTime<Utc>) -> bool {
    let Some(last) = last_success else {
        return true;
    };
    match (now - last).to_std() {
        Ok(elapsed) => elapsed >= interval,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_sync_due() {
        let now = Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();
        let day = Duration::from_secs(86_400);
        assert!(sync_due(None, day, now));
        assert!(!sync_due(Some(now - chrono::Duration::hours(1)), day, now));
        assert!(sync_due(Some(now - chrono::Duration::hours(25)), day, now));
        assert!(sync_due(Some(now + chrono::Duration::hours(1)), day, now));
    }

    #[test]
    fn test_state_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/state.json");
        assert_eq!(SyncState::load(&path), SyncState::default());

        let state = SyncState {
            last_success: Some(Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap()),
            last_generated_on: None,
        };
        state.save(&path).unwrap();
        assert_eq!(SyncState::load(&path), state);
    }

    #[test]
    fn test_corrupt_state_is_ignored() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(SyncState::load(&path), SyncState::default());
    }
}
