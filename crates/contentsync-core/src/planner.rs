//! Diff computation between a local and a remote snapshot.

use compact_str::CompactString;
use indexmap::IndexMap;

use crate::category::{Category, CategoryMatcher};
use crate::node::{ContentNode, NodeId};
use crate::plan::{PlanEntry, SyncPlan};
use crate::snapshot::Snapshot;

/// Knobs that influence classification.
#[derive(Debug, Clone, Default)]
pub struct SyncPolicy {
    /// Also report whether the directory layout changed.
    pub compare_structure: bool,
    /// Treat every remote file as modified.
    pub force_sync: bool,
    /// Categories whose items are neither downloaded nor deleted.
    pub disabled_categories: Vec<Category>,
}

impl SyncPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compare_structure(mut self, yes: bool) -> Self {
        self.compare_structure = yes;
        self
    }

    pub fn force_sync(mut self, yes: bool) -> Self {
        self.force_sync = yes;
        self
    }

    pub fn disable(mut self, category: Category) -> Self {
        self.disabled_categories.push(category);
        self
    }
}

/// Classify every remote and local node into a fresh plan.
///
/// Pure: neither snapshot is touched and the same inputs always produce
/// the same plan.
pub fn compute_sync_plan(local: &Snapshot, remote: &Snapshot, policy: &SyncPolicy) -> SyncPlan {
    compute_sync_plan_with_staged(local, remote, policy, None)
}

/// Like [`compute_sync_plan`], but files already present in `staged` with
/// matching size and modification date are not downloaded again.
pub fn compute_sync_plan_with_staged(
    local: &Snapshot,
    remote: &Snapshot,
    policy: &SyncPolicy,
    staged: Option<&Snapshot>,
) -> SyncPlan {
    let excluded = CategoryMatcher::new(&policy.disabled_categories);
    let mut plan = SyncPlan::new();

    for dir in remote.list_directories() {
        if excluded.matches(&dir.path, &dir.name) {
            continue;
        }
        if !local.lookup(&dir.path).is_some_and(ContentNode::is_directory) {
            insert(&mut plan.directories_to_create, dir);
        }
    }

    for file in remote.list_files() {
        if excluded.matches(&file.path, &file.name) {
            continue;
        }
        let Some(remote_meta) = file.file() else {
            continue;
        };
        match local.lookup(&file.path) {
            None => insert(&mut plan.additions, file),
            Some(existing) => {
                let unchanged = existing
                    .file()
                    .is_some_and(|local_meta| local_meta.same_content(remote_meta));
                if policy.force_sync || !unchanged {
                    insert(&mut plan.modifications, file);
                }
            }
        }
    }

    for link in remote.list_symlinks() {
        if excluded.matches(&link.path, &link.name) {
            continue;
        }
        let current = local.lookup(&link.path).and_then(ContentNode::symlink_target);
        if policy.force_sync || current != link.symlink_target() {
            insert(&mut plan.symlinks_to_create, link);
        }
    }

    collect_removals(local, NodeId::ROOT, remote, &excluded, &mut plan);

    if policy.compare_structure {
        plan.structure_changed = Some(structure_differs(local, remote));
    }

    let to_download: Vec<_> = plan
        .additions
        .values()
        .chain(plan.modifications.values())
        .map(|entry| entry.path.clone())
        .collect();
    for path in to_download {
        if already_staged(staged, remote, &path) {
            plan.staged.insert(path);
        } else {
            plan.remaining_downloads.insert(path);
        }
    }
    plan.total_items_to_download = plan.remaining_downloads.len();

    tracing::debug!(
        additions = plan.additions.len(),
        modifications = plan.modifications.len(),
        removals = plan.removals.len(),
        symlinks = plan.symlinks_to_create.len(),
        downloads = plan.total_items_to_download,
        "computed sync plan"
    );
    plan
}

/// Whether the two snapshots disagree on their set of directory paths.
pub fn structure_differs(local: &Snapshot, remote: &Snapshot) -> bool {
    local.directory_paths() != remote.directory_paths()
}

fn insert(map: &mut IndexMap<CompactString, PlanEntry>, node: &ContentNode) {
    map.insert(node.path.clone(), PlanEntry::from_node(node));
}

fn already_staged(staged: Option<&Snapshot>, remote: &Snapshot, path: &str) -> bool {
    let Some(staged) = staged else {
        return false;
    };
    let remote_meta = remote.lookup(path).and_then(ContentNode::file);
    let staged_meta = staged.lookup(path).and_then(ContentNode::file);
    match (remote_meta, staged_meta) {
        (Some(r), Some(s)) => r.same_content(s),
        _ => false,
    }
}

fn collect_removals(
    local: &Snapshot,
    dir: NodeId,
    remote: &Snapshot,
    excluded: &CategoryMatcher,
    plan: &mut SyncPlan,
) {
    for node in local.children(dir) {
        if excluded.matches(&node.path, &node.name) {
            continue;
        }

        let counterpart = remote.lookup(&node.path);
        let kept = counterpart.is_some_and(|r| r.is_directory() == node.is_directory());
        if kept {
            if node.is_directory() {
                collect_removals(local, node.id, remote, excluded, plan);
            }
            continue;
        }

        if node.is_directory() && has_protected_descendant(local, node.id, excluded) {
            collect_removals(local, node.id, remote, excluded, plan);
            continue;
        }

        insert(&mut plan.removals, node);
    }
}

fn has_protected_descendant(local: &Snapshot, dir: NodeId, excluded: &CategoryMatcher) -> bool {
    local
        .descendants(dir)
        .into_iter()
        .any(|n| excluded.matches(&n.path, &n.name))
}
