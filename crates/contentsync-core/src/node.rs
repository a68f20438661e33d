//! Content node types.

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Index of a node within a snapshot arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The root node of every snapshot.
    pub const ROOT: NodeId = NodeId(0);

    /// Create a NodeId from an arena index.
    pub fn new(index: usize) -> Self {
        Self(index as u32)
    }

    /// Position of this node in the arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Metadata carried only by file nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Where the remote copy can be fetched from. Absent for local files.
    pub download_url: Option<String>,
    /// Size in bytes. Remote documents may leave it out.
    pub size: Option<u64>,
    /// Last modification time.
    pub modified: Option<DateTime<Utc>>,
}

impl FileMeta {
    /// File metadata with only a size.
    pub fn new(size: u64) -> Self {
        Self {
            download_url: None,
            size: Some(size),
            modified: None,
        }
    }

    /// File metadata whose size is not known.
    pub fn r#unsized() -> Self {
        Self {
            download_url: None,
            size: None,
            modified: None,
        }
    }

    /// Set the modification time.
    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    /// Set the download URL.
    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = Some(url.into());
        self
    }

    /// Whether both entries describe the same content.
    ///
    /// Sizes and modification times are each compared only when both
    /// sides carry one; times at second precision.
    pub fn same_content(&self, other: &FileMeta) -> bool {
        if let (Some(a), Some(b)) = (self.size, other.size) {
            if a != b {
                return false;
            }
        }
        match (self.modified, other.modified) {
            (Some(a), Some(b)) => a.timestamp() == b.timestamp(),
            _ => true,
        }
    }
}

/// What a node is. A node is exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Directory with ordered children.
    Directory,
    /// Regular file.
    File(FileMeta),
    /// Symbolic link.
    Symlink {
        /// Link target, verbatim.
        target: CompactString,
    },
}

impl NodeKind {
    /// Check if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, NodeKind::Directory)
    }

    /// Check if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, NodeKind::File(_))
    }

    /// Check if this is a symlink.
    pub fn is_symlink(&self) -> bool {
        matches!(self, NodeKind::Symlink { .. })
    }
}

/// A single entry in a content tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentNode {
    /// Position in the owning snapshot.
    pub id: NodeId,
    /// Parent directory; `None` only for the root.
    pub parent: Option<NodeId>,
    /// Root-relative, slash separated path. Empty for the root.
    pub path: CompactString,
    /// Last path component.
    pub name: CompactString,
    /// Node type and associated metadata.
    pub kind: NodeKind,
    /// Children in insertion order (directories only).
    pub children: Vec<NodeId>,
}

impl ContentNode {
    /// Check if this node is the root of its snapshot.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Check if this node is a directory.
    pub fn is_directory(&self) -> bool {
        self.kind.is_dir()
    }

    /// Check if this node is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Check if this node is a symlink.
    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }

    /// File metadata, if this is a file.
    pub fn file(&self) -> Option<&FileMeta> {
        match &self.kind {
            NodeKind::File(meta) => Some(meta),
            _ => None,
        }
    }

    /// Symlink target, if this is a symlink.
    pub fn symlink_target(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Symlink { target } => Some(target.as_str()),
            _ => None,
        }
    }

    pub fn download_url(&self) -> Option<&str> {
        self.file().and_then(|f| f.download_url.as_deref())
    }

    pub fn file_size(&self) -> Option<u64> {
        self.file().and_then(|f| f.size)
    }

    pub fn modified_date(&self) -> Option<DateTime<Utc>> {
        self.file().and_then(|f| f.modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_node_id() {
        let id = NodeId::new(42);
        assert_eq!(id.0, 42);
        assert_eq!(id.index(), 42);
        assert_eq!(NodeId::ROOT.index(), 0);
    }

    #[test]
    fn test_same_content_compares_seconds() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let a = FileMeta::new(10).with_modified(t);
        let b = FileMeta::new(10).with_modified(t + chrono::Duration::milliseconds(400));
        assert!(a.same_content(&b));

        let c = FileMeta::new(10).with_modified(t + chrono::Duration::seconds(1));
        assert!(!a.same_content(&c));
        assert!(!a.same_content(&FileMeta::new(11).with_modified(t)));
    }

    #[test]
    fn test_same_content_without_dates() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert!(FileMeta::new(3).same_content(&FileMeta::new(3).with_modified(t)));
    }

    #[test]
    fn test_same_content_without_size() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let remote = FileMeta::r#unsized().with_modified(t);
        assert!(remote.same_content(&FileMeta::new(5).with_modified(t)));
        assert!(!remote.same_content(&FileMeta::new(5).with_modified(t + chrono::Duration::hours(1))));
    }
}
