//! The classified difference between two snapshots.

use compact_str::CompactString;
use indexmap::{IndexMap, IndexSet};

use crate::node::{ContentNode, FileMeta, NodeKind};

/// An owned copy of the node a plan action refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    /// Root-relative path.
    pub path: CompactString,
    /// Last path component.
    pub name: CompactString,
    /// Node type and metadata at the time of planning.
    pub kind: NodeKind,
}

impl PlanEntry {
    /// Copy the relevant fields out of a snapshot node.
    pub fn from_node(node: &ContentNode) -> Self {
        Self {
            path: node.path.clone(),
            name: node.name.clone(),
            kind: node.kind.clone(),
        }
    }

    /// File metadata, if the entry is a file.
    pub fn file(&self) -> Option<&FileMeta> {
        match &self.kind {
            NodeKind::File(meta) => Some(meta),
            _ => None,
        }
    }

    /// Symlink target, if the entry is a symlink.
    pub fn symlink_target(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Symlink { target } => Some(target.as_str()),
            _ => None,
        }
    }

    pub fn download_url(&self) -> Option<&str> {
        self.file().and_then(|f| f.download_url.as_deref())
    }

    /// Advertised size, if the document carried one.
    pub fn expected_size(&self) -> Option<u64> {
        self.file().and_then(|f| f.size)
    }

    /// Size in bytes, zero when unknown.
    pub fn size(&self) -> u64 {
        self.expected_size().unwrap_or(0)
    }
}

type EntryMap = IndexMap<CompactString, PlanEntry>;

/// Result of one diff computation plus download bookkeeping.
///
/// Created by the planner, mutated only by the owner of a sync attempt as
/// downloads finish, and dropped together with the snapshots it came from.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub(crate) additions: EntryMap,
    pub(crate) modifications: EntryMap,
    pub(crate) removals: EntryMap,
    pub(crate) symlinks_to_create: EntryMap,
    pub(crate) directories_to_create: EntryMap,
    pub(crate) remaining_downloads: IndexSet<CompactString>,
    pub(crate) staged: IndexSet<CompactString>,
    pub(crate) failed_downloads: IndexSet<CompactString>,
    pub(crate) structure_changed: Option<bool>,
    pub(crate) total_items_to_download: usize,
}

impl SyncPlan {
    /// An empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote files missing locally.
    pub fn additions(&self) -> impl ExactSizeIterator<Item = &PlanEntry> + '_ {
        self.additions.values()
    }

    /// Remote files whose local copy differs.
    pub fn modifications(&self) -> impl ExactSizeIterator<Item = &PlanEntry> + '_ {
        self.modifications.values()
    }

    /// Local nodes absent from the remote tree.
    pub fn removals(&self) -> impl ExactSizeIterator<Item = &PlanEntry> + '_ {
        self.removals.values()
    }

    /// Remote symlinks to create or retarget.
    pub fn symlinks_to_create(&self) -> impl ExactSizeIterator<Item = &PlanEntry> + '_ {
        self.symlinks_to_create.values()
    }

    /// Remote directories missing locally.
    pub fn directories_to_create(&self) -> impl ExactSizeIterator<Item = &PlanEntry> + '_ {
        self.directories_to_create.values()
    }

    /// Paths still waiting for a download.
    pub fn remaining_downloads(&self) -> impl ExactSizeIterator<Item = &str> + '_ {
        self.remaining_downloads.iter().map(CompactString::as_str)
    }

    /// Paths whose file is sitting verified in the staging area.
    pub fn staged(&self) -> impl ExactSizeIterator<Item = &str> + '_ {
        self.staged.iter().map(CompactString::as_str)
    }

    /// Paths whose download failed during this attempt.
    pub fn failed_downloads(&self) -> impl ExactSizeIterator<Item = &str> + '_ {
        self.failed_downloads.iter().map(CompactString::as_str)
    }

    /// Whether the set of directories differs, when that was asked for.
    pub fn structure_changed(&self) -> Option<bool> {
        self.structure_changed
    }

    /// Record the outcome of a separate structure comparison.
    pub fn set_structure_changed(&mut self, changed: bool) {
        self.structure_changed = Some(changed);
    }

    /// Look up an addition or modification by path.
    pub fn download_entry(&self, path: &str) -> Option<&PlanEntry> {
        self.additions
            .get(path)
            .or_else(|| self.modifications.get(path))
    }

    /// Entries still waiting for a download, in plan order.
    pub fn pending_downloads(&self) -> Vec<PlanEntry> {
        self.remaining_downloads
            .iter()
            .filter_map(|path| self.download_entry(path))
            .cloned()
            .collect()
    }

    /// Drop `path` from the remaining downloads.
    ///
    /// Returns whether it was still pending; calling it again is a no-op.
    pub fn remove_item_to_download(&mut self, path: &str) -> bool {
        self.remaining_downloads.shift_remove(path)
    }

    /// Mark a download as finished and its staged file verified.
    pub fn mark_staged(&mut self, path: &str) -> bool {
        let was_pending = self.remove_item_to_download(path);
        self.failed_downloads.shift_remove(path);
        self.staged.insert(CompactString::from(path));
        was_pending
    }

    /// Mark a download as failed for this attempt.
    pub fn record_download_failure(&mut self, path: &str) -> bool {
        let was_pending = self.remove_item_to_download(path);
        self.failed_downloads.insert(CompactString::from(path));
        was_pending
    }

    pub fn has_failed_downloads(&self) -> bool {
        !self.failed_downloads.is_empty()
    }

    /// Whether the staged copy of `path` is ready to be applied.
    pub fn is_staged(&self, path: &str) -> bool {
        self.staged.contains(path)
    }

    pub fn has_items_to_download(&self) -> bool {
        !self.remaining_downloads.is_empty()
    }

    /// Whether applying this plan would change anything locally.
    pub fn has_items_for_app_to_apply(&self) -> bool {
        !(self.additions.is_empty()
            && self.modifications.is_empty()
            && self.removals.is_empty()
            && self.symlinks_to_create.is_empty()
            && self.directories_to_create.is_empty())
    }

    /// Additions, modifications and removals.
    pub fn total_items_to_apply(&self) -> usize {
        self.additions.len() + self.modifications.len() + self.removals.len()
    }

    pub fn total_symlinks_to_apply(&self) -> usize {
        self.symlinks_to_create.len()
    }

    /// Downloads required when the plan was computed.
    pub fn total_items_to_download(&self) -> usize {
        self.total_items_to_download
    }

    /// Bytes still to download.
    pub fn remaining_bytes(&self) -> u64 {
        self.remaining_downloads
            .iter()
            .filter_map(|path| self.download_entry(path))
            .map(PlanEntry::size)
            .sum()
    }

    /// True when there is nothing to download or apply.
    pub fn is_empty(&self) -> bool {
        !self.has_items_to_download() && !self.has_items_for_app_to_apply()
    }

    /// Forget every action.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "text", "md", "html", "htm", "css", "js", "json", "xml", "csv", "plist", "strings",
];

/// Whether a file name looks like a text document.
pub fn is_text_file(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| TEXT_EXTENSIONS.iter().any(|t| t.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}
