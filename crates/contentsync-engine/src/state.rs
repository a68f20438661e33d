//! Orchestrator phases and outcome statuses.

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

/// Where a sync currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, Serialize, Deserialize)]
pub enum SyncPhase {
    #[strum(to_string = "idle")]
    Idle,
    #[strum(to_string = "fetching metadata")]
    FetchingMetadata,
    #[strum(to_string = "planning")]
    Planning,
    #[strum(to_string = "downloading")]
    Downloading,
    #[strum(to_string = "awaiting apply")]
    AwaitingApply,
    #[strum(to_string = "applying")]
    Applying,
    #[strum(to_string = "completed")]
    Completed,
    #[strum(to_string = "failed")]
    Failed,
}

impl SyncPhase {
    /// Whether a sync attempt is running in this phase.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::FetchingMetadata | Self::Planning | Self::Downloading | Self::Applying
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Outcome of a sync attempt.
///
/// Variants are ordered by severity; the final status of an attempt is the
/// worst one observed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize,
)]
pub enum SyncStatus {
    #[strum(to_string = "ok")]
    Ok,
    #[strum(to_string = "cancelled")]
    Cancelled,
    #[strum(to_string = "no connectivity")]
    NoConnectivity,
    #[strum(to_string = "authorization failed")]
    AuthorizationFailed,
    #[strum(to_string = "failed")]
    Failed,
}

impl SyncStatus {
    /// The more severe of the two.
    pub fn worst(self, other: SyncStatus) -> SyncStatus {
        self.max(other)
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}
