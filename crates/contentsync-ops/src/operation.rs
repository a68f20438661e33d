//! Apply action types.

use std::path::{Path, PathBuf};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// One change to the live content root. Paths are root-relative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyAction {
    /// Delete a file, symlink or whole directory.
    Remove { path: CompactString },
    /// Make sure a directory exists.
    CreateDirectory { path: CompactString },
    /// Move a verified file from the staging area into place.
    MoveStaged { path: CompactString },
    /// Create or retarget a symlink.
    CreateSymlink {
        path: CompactString,
        target: CompactString,
    },
}

impl ApplyAction {
    /// Create a removal.
    pub fn remove(path: impl Into<CompactString>) -> Self {
        Self::Remove { path: path.into() }
    }

    /// Create a directory creation.
    pub fn create_directory(path: impl Into<CompactString>) -> Self {
        Self::CreateDirectory { path: path.into() }
    }

    /// Create a staged file move.
    pub fn move_staged(path: impl Into<CompactString>) -> Self {
        Self::MoveStaged { path: path.into() }
    }

    /// Create a symlink creation.
    pub fn create_symlink(path: impl Into<CompactString>, target: impl Into<CompactString>) -> Self {
        Self::CreateSymlink {
            path: path.into(),
            target: target.into(),
        }
    }

    /// Root-relative path this action touches.
    pub fn path(&self) -> &str {
        match self {
            Self::Remove { path }
            | Self::CreateDirectory { path }
            | Self::MoveStaged { path }
            | Self::CreateSymlink { path, .. } => path.as_str(),
        }
    }
}

/// Join a slash-separated relative path onto `root`.
///
/// Empty, `.` and `..` segments are dropped so the result never leaves
/// `root`.
pub fn join_relative(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .fold(root.to_path_buf(), |acc, segment| acc.join(segment))
}

/// An error that occurred during an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationError {
    /// The path that caused the error.
    pub path: PathBuf,
    /// A human-readable error message.
    pub message: String,
}

impl OperationError {
    /// Create a new operation error.
    pub fn new(path: PathBuf, message: impl Into<String>) -> Self {
        Self {
            path,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_relative() {
        let root = Path::new("/srv/content");
        assert_eq!(join_relative(root, "a/b.txt"), root.join("a").join("b.txt"));
        assert_eq!(join_relative(root, "/a//b/"), root.join("a").join("b"));
        assert_eq!(join_relative(root, "../etc/passwd"), root.join("etc").join("passwd"));
    }

    #[test]
    fn test_action_path() {
        assert_eq!(ApplyAction::create_symlink("cur", "v2").path(), "cur");
        assert_eq!(ApplyAction::remove("old").path(), "old");
    }
}
