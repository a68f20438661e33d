//! Immutable content tree snapshots.
//!
//! A [`Snapshot`] stores its nodes in a flat arena addressed by [`NodeId`].
//! Each node keeps the ids of its children in insertion order, so pre-order
//! flattening reproduces document order for parsed trees and name order for
//! scanned ones.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use indexmap::IndexMap;

use crate::error::SnapshotError;
use crate::node::{ContentNode, FileMeta, NodeId, NodeKind};

/// Point-in-time view of one content tree.
#[derive(Debug, Clone)]
pub struct Snapshot {
    generated_on: DateTime<Utc>,
    nodes: Vec<ContentNode>,
    by_path: IndexMap<CompactString, NodeId>,
}

impl Snapshot {
    /// A snapshot holding only an empty root directory.
    pub fn empty(generated_on: DateTime<Utc>) -> Self {
        SnapshotBuilder::new(generated_on).build()
    }

    /// When the tree was generated (remote) or scanned (local).
    pub fn generated_on(&self) -> DateTime<Utc> {
        self.generated_on
    }

    /// The root directory.
    pub fn root(&self) -> &ContentNode {
        &self.nodes[NodeId::ROOT.index()]
    }

    /// Get a node by id.
    pub fn node(&self, id: NodeId) -> Option<&ContentNode> {
        self.nodes.get(id.index())
    }

    /// Parent of a node, `None` for the root.
    pub fn parent(&self, id: NodeId) -> Option<&ContentNode> {
        self.node(id)?.parent.and_then(|p| self.node(p))
    }

    /// Direct children of a node in order.
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = &ContentNode> + '_ {
        self.node(id)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|child| self.node(*child))
    }

    /// Total number of nodes including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the tree holds nothing but its root.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Look up a node by root-relative path.
    ///
    /// Leading and trailing slashes are ignored; the empty path is the root.
    pub fn lookup(&self, path: &str) -> Option<&ContentNode> {
        let key = path.trim_matches('/');
        self.by_path.get(key).and_then(|id| self.node(*id))
    }

    /// Check whether a path exists in this snapshot.
    pub fn contains(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    /// All descendants of `id` in pre-order, excluding `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<&ContentNode> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = match self.node(id) {
            Some(node) => node.children.iter().rev().copied().collect(),
            None => return out,
        };

        while let Some(next) = stack.pop() {
            if let Some(node) = self.node(next) {
                out.push(node);
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    /// Every directory below the root, pre-order.
    pub fn list_directories(&self) -> Vec<&ContentNode> {
        self.flatten(NodeKind::is_dir)
    }

    /// Every regular file, pre-order.
    pub fn list_files(&self) -> Vec<&ContentNode> {
        self.flatten(NodeKind::is_file)
    }

    /// Every symlink, pre-order.
    pub fn list_symlinks(&self) -> Vec<&ContentNode> {
        self.flatten(NodeKind::is_symlink)
    }

    /// Paths of every directory below the root.
    pub fn directory_paths(&self) -> BTreeSet<&str> {
        self.list_directories()
            .into_iter()
            .map(|n| n.path.as_str())
            .collect()
    }

    /// Sum of all file sizes.
    pub fn total_size(&self) -> u64 {
        self.nodes.iter().filter_map(|n| n.file_size()).sum()
    }

    fn flatten(&self, keep: fn(&NodeKind) -> bool) -> Vec<&ContentNode> {
        self.descendants(NodeId::ROOT)
            .into_iter()
            .filter(|n| keep(&n.kind))
            .collect()
    }
}

/// Incrementally assembles a [`Snapshot`] while enforcing its invariants.
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    generated_on: DateTime<Utc>,
    nodes: Vec<ContentNode>,
    by_path: IndexMap<CompactString, NodeId>,
}

impl SnapshotBuilder {
    /// Start a tree with an unnamed root directory.
    pub fn new(generated_on: DateTime<Utc>) -> Self {
        let root = ContentNode {
            id: NodeId::ROOT,
            parent: None,
            path: CompactString::default(),
            name: CompactString::default(),
            kind: NodeKind::Directory,
            children: Vec::new(),
        };
        let mut by_path = IndexMap::new();
        by_path.insert(CompactString::default(), NodeId::ROOT);

        Self {
            generated_on,
            nodes: vec![root],
            by_path,
        }
    }

    /// Name the root directory. The root path stays empty.
    pub fn root_name(mut self, name: impl Into<CompactString>) -> Self {
        self.nodes[NodeId::ROOT.index()].name = name.into();
        self
    }

    /// Id of the root directory.
    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    /// Add a directory under `parent`.
    pub fn add_directory(&mut self, parent: NodeId, name: &str) -> Result<NodeId, SnapshotError> {
        self.add(parent, name, NodeKind::Directory)
    }

    /// Add a regular file under `parent`.
    pub fn add_file(
        &mut self,
        parent: NodeId,
        name: &str,
        meta: FileMeta,
    ) -> Result<NodeId, SnapshotError> {
        self.add(parent, name, NodeKind::File(meta))
    }

    /// Add a symlink under `parent`.
    pub fn add_symlink(
        &mut self,
        parent: NodeId,
        name: &str,
        target: &str,
    ) -> Result<NodeId, SnapshotError> {
        self.add(
            parent,
            name,
            NodeKind::Symlink {
                target: target.into(),
            },
        )
    }

    /// Return the directory at `path`, creating any missing ancestors.
    pub fn ensure_directory(&mut self, path: &str) -> Result<NodeId, SnapshotError> {
        let mut current = NodeId::ROOT;
        for segment in split_path(path) {
            let child_path = join_path(&self.nodes[current.index()].path, segment);
            let existing = self.by_path.get(child_path.as_str()).copied();
            current = match existing {
                Some(existing) => {
                    if !self.nodes[existing.index()].is_directory() {
                        return Err(SnapshotError::NotADirectory {
                            path: child_path.to_string(),
                        });
                    }
                    existing
                }
                None => self.add_directory(current, segment)?,
            };
        }
        Ok(current)
    }

    /// Add a file at a root-relative path, creating parent directories.
    pub fn add_file_at(&mut self, path: &str, meta: FileMeta) -> Result<NodeId, SnapshotError> {
        let (parent, name) = self.split_parent(path)?;
        self.add_file(parent, name, meta)
    }

    /// Add a symlink at a root-relative path, creating parent directories.
    pub fn add_symlink_at(&mut self, path: &str, target: &str) -> Result<NodeId, SnapshotError> {
        let (parent, name) = self.split_parent(path)?;
        self.add_symlink(parent, name, target)
    }

    /// Finish the tree.
    pub fn build(self) -> Snapshot {
        Snapshot {
            generated_on: self.generated_on,
            nodes: self.nodes,
            by_path: self.by_path,
        }
    }

    fn split_parent<'p>(&mut self, path: &'p str) -> Result<(NodeId, &'p str), SnapshotError> {
        let trimmed = path.trim_matches('/');
        match trimmed.rsplit_once('/') {
            Some((dir, name)) => Ok((self.ensure_directory(dir)?, name)),
            None => Ok((NodeId::ROOT, trimmed)),
        }
    }

    fn add(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> Result<NodeId, SnapshotError> {
        if !is_valid_name(name) {
            return Err(SnapshotError::InvalidName {
                name: name.to_string(),
            });
        }

        let parent_node = self
            .nodes
            .get(parent.index())
            .ok_or(SnapshotError::UnknownNode { id: parent.0 })?;
        if !parent_node.is_directory() {
            return Err(SnapshotError::NotADirectory {
                path: parent_node.path.to_string(),
            });
        }

        let path = join_path(&parent_node.path, name);
        if self.by_path.contains_key(path.as_str()) {
            return Err(SnapshotError::DuplicatePath {
                path: path.to_string(),
            });
        }

        let id = NodeId::new(self.nodes.len());
        self.nodes[parent.index()].children.push(id);
        self.by_path.insert(path.clone(), id);
        self.nodes.push(ContentNode {
            id,
            parent: Some(parent),
            path,
            name: name.into(),
            kind,
            children: Vec::new(),
        });
        Ok(id)
    }
}

/// Join a parent path and a child name with `/`.
pub fn join_path(parent: &str, name: &str) -> CompactString {
    if parent.is_empty() {
        CompactString::from(name)
    } else {
        let mut path = CompactString::with_capacity(parent.len() + name.len() + 1);
        path.push_str(parent);
        path.push('/');
        path.push_str(name);
        path
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        let mut b = SnapshotBuilder::new(Utc::now());
        let docs = b.add_directory(NodeId::ROOT, "docs").unwrap();
        b.add_file(docs, "b.txt", FileMeta::new(5)).unwrap();
        b.add_file(NodeId::ROOT, "a.txt", FileMeta::new(10)).unwrap();
        b.add_symlink(docs, "latest", "b.txt").unwrap();
        b.build()
    }

    #[test]
    fn test_preorder_keeps_insertion_order() {
        let snap = sample();
        let paths: Vec<_> = snap
            .descendants(NodeId::ROOT)
            .into_iter()
            .map(|n| n.path.as_str())
            .collect();
        assert_eq!(paths, vec!["docs", "docs/b.txt", "docs/latest", "a.txt"]);
    }

    #[test]
    fn test_listings() {
        let snap = sample();
        let files: Vec<_> = snap.list_files().into_iter().map(|n| n.path.as_str()).collect();
        assert_eq!(files, vec!["docs/b.txt", "a.txt"]);
        assert_eq!(snap.list_directories().len(), 1);
        assert_eq!(snap.list_symlinks()[0].symlink_target(), Some("b.txt"));
        assert_eq!(snap.total_size(), 15);
    }

    #[test]
    fn test_lookup_normalizes_slashes() {
        let snap = sample();
        assert!(snap.lookup("/docs/b.txt").is_some());
        assert!(snap.lookup("docs/").is_some());
        assert!(snap.lookup("").unwrap().is_root());
        assert!(snap.lookup("missing").is_none());
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let mut b = SnapshotBuilder::new(Utc::now());
        b.add_file(NodeId::ROOT, "a.txt", FileMeta::new(1)).unwrap();
        let err = b.add_directory(NodeId::ROOT, "a.txt").unwrap_err();
        assert_eq!(
            err,
            SnapshotError::DuplicatePath {
                path: "a.txt".into()
            }
        );
    }

    #[test]
    fn test_leaf_cannot_have_children() {
        let mut b = SnapshotBuilder::new(Utc::now());
        let file = b.add_file(NodeId::ROOT, "a.txt", FileMeta::new(1)).unwrap();
        assert!(matches!(
            b.add_file(file, "b.txt", FileMeta::new(1)),
            Err(SnapshotError::NotADirectory { .. })
        ));
    }

    #[test]
    fn test_invalid_names() {
        let mut b = SnapshotBuilder::new(Utc::now());
        for name in ["", ".", "..", "a/b"] {
            assert!(matches!(
                b.add_directory(NodeId::ROOT, name),
                Err(SnapshotError::InvalidName { .. })
            ));
        }
    }

    #[test]
    fn test_add_file_at_creates_parents() {
        let mut b = SnapshotBuilder::new(Utc::now());
        b.add_file_at("x/y/z.txt", FileMeta::new(1)).unwrap();
        b.add_file_at("x/w.txt", FileMeta::new(1)).unwrap();
        let snap = b.build();
        assert!(snap.lookup("x/y").unwrap().is_directory());
        assert_eq!(snap.parent(snap.lookup("x/y/z.txt").unwrap().id).unwrap().path, "x/y");
        assert_eq!(snap.children(snap.lookup("x").unwrap().id).count(), 2);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = Snapshot::empty(Utc::now());
        assert!(snap.is_empty());
        assert_eq!(snap.len(), 1);
        assert!(snap.list_files().is_empty());
    }
}
