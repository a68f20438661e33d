use chrono::{DateTime, TimeZone, Utc};
use contentsync_core::{
    Category, FileMeta, NodeKind, PlanEntry, Snapshot, SnapshotBuilder, SyncPolicy,
    compute_sync_plan, compute_sync_plan_with_staged,
};

fn t1() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap()
}

fn t2() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

enum Item<'a> {
    File(&'a str, u64, DateTime<Utc>),
    Dir(&'a str),
    Link(&'a str, &'a str),
}

fn snapshot(items: &[Item<'_>]) -> Snapshot {
    let mut builder = SnapshotBuilder::new(t2());
    for item in items {
        match item {
            Item::File(path, size, modified) => {
                let meta = FileMeta::new(*size)
                    .with_modified(*modified)
                    .with_download_url(format!("files/{path}"));
                builder.add_file_at(path, meta).unwrap();
            }
            Item::Dir(path) => {
                builder.ensure_directory(path).unwrap();
            }
            Item::Link(path, target) => {
                builder.add_symlink_at(path, target).unwrap();
            }
        }
    }
    builder.build()
}

fn paths<'a>(entries: impl Iterator<Item = &'a PlanEntry>) -> Vec<&'a str> {
    entries.map(|e| e.path.as_str()).collect()
}

/// Pretend the plan was applied to `local` and return the resulting tree.
fn applied(local: &Snapshot, remote: &Snapshot, policy: &SyncPolicy) -> Snapshot {
    let plan = compute_sync_plan(local, remote, policy);
    let removed: Vec<&str> = paths(plan.removals());

    let mut builder = SnapshotBuilder::new(remote.generated_on());
    for node in local.descendants(local.root().id) {
        if removed
            .iter()
            .any(|r| node.path == *r || node.path.starts_with(&format!("{r}/")))
        {
            continue;
        }
        let path = node.path.as_str();
        let replaced = plan.download_entry(path).is_some()
            || plan.symlinks_to_create().any(|e| e.path == path);
        if replaced {
            continue;
        }
        match &node.kind {
            NodeKind::Directory => {
                builder.ensure_directory(path).unwrap();
            }
            NodeKind::File(meta) => {
                builder.add_file_at(path, meta.clone()).unwrap();
            }
            NodeKind::Symlink { target } => {
                builder.add_symlink_at(path, target).unwrap();
            }
        }
    }
    for dir in plan.directories_to_create() {
        builder.ensure_directory(&dir.path).unwrap();
    }
    for entry in plan.additions().chain(plan.modifications()) {
        builder
            .add_file_at(&entry.path, entry.file().unwrap().clone())
            .unwrap();
    }
    for link in plan.symlinks_to_create() {
        builder
            .add_symlink_at(&link.path, link.symlink_target().unwrap())
            .unwrap();
    }
    builder.build()
}

#[test]
fn test_scenario_fresh_install() {
    let local = snapshot(&[]);
    let remote = snapshot(&[Item::File("a.txt", 10, t1()), Item::File("dir/b.txt", 5, t1())]);

    let plan = compute_sync_plan(&local, &remote, &SyncPolicy::new());

    assert_eq!(paths(plan.additions()), vec!["a.txt", "dir/b.txt"]);
    assert!(plan.removals().next().is_none());
    assert_eq!(plan.total_items_to_download(), 2);
    assert!(plan.has_items_to_download());
    assert_eq!(paths(plan.directories_to_create()), vec!["dir"]);
}

#[test]
fn test_scenario_identical_trees() {
    let local = snapshot(&[Item::File("a.txt", 10, t1())]);
    let remote = snapshot(&[Item::File("a.txt", 10, t1())]);

    let plan = compute_sync_plan(&local, &remote, &SyncPolicy::new());

    assert!(plan.is_empty());
    assert!(!plan.has_items_for_app_to_apply());
    assert_eq!(plan.total_items_to_apply(), 0);
}

#[test]
fn test_scenario_stale_local_file() {
    let local = snapshot(&[Item::File("stale.txt", 3, t1())]);
    let remote = snapshot(&[]);

    let plan = compute_sync_plan(&local, &remote, &SyncPolicy::new());

    assert_eq!(paths(plan.removals()), vec!["stale.txt"]);
    assert_eq!(plan.total_items_to_apply(), 1);
    assert_eq!(plan.total_items_to_download(), 0);
    assert!(!plan.has_items_to_download());
    assert!(plan.has_items_for_app_to_apply());
}

#[test]
fn test_partition_of_remote_files() {
    let local = snapshot(&[
        Item::File("same.txt", 1, t1()),
        Item::File("newer.txt", 1, t1()),
        Item::File("bigger.txt", 1, t1()),
    ]);
    let remote = snapshot(&[
        Item::File("same.txt", 1, t1()),
        Item::File("newer.txt", 1, t2()),
        Item::File("bigger.txt", 2, t1()),
        Item::File("new.txt", 1, t1()),
    ]);

    let plan = compute_sync_plan(&local, &remote, &SyncPolicy::new());

    assert_eq!(paths(plan.additions()), vec!["new.txt"]);
    assert_eq!(paths(plan.modifications()), vec!["newer.txt", "bigger.txt"]);
    assert!(plan.removals().next().is_none());

    let again = compute_sync_plan(&local, &remote, &SyncPolicy::new());
    assert_eq!(paths(again.modifications()), paths(plan.modifications()));
}

#[test]
fn test_force_sync_marks_everything_modified() {
    let items = [
        Item::File("a.txt", 1, t1()),
        Item::File("d/b.txt", 2, t1()),
        Item::Link("d/cur", "b.txt"),
    ];
    let local = snapshot(&items);
    let remote = snapshot(&items);

    let plan = compute_sync_plan(&local, &remote, &SyncPolicy::new().force_sync(true));

    assert_eq!(paths(plan.modifications()), vec!["a.txt", "d/b.txt"]);
    assert_eq!(plan.total_items_to_download(), 2);
    assert_eq!(plan.total_symlinks_to_apply(), 1);
    assert!(plan.removals().next().is_none());
}

#[test]
fn test_symlink_retargeted() {
    let local = snapshot(&[Item::Link("cur", "v1"), Item::Link("keep", "x")]);
    let remote = snapshot(&[Item::Link("cur", "v2"), Item::Link("keep", "x")]);

    let plan = compute_sync_plan(&local, &remote, &SyncPolicy::new());

    assert_eq!(paths(plan.symlinks_to_create()), vec!["cur"]);
    assert!(plan.removals().next().is_none());
}

#[test]
fn test_disabled_category_excluded_and_protected() {
    let local = snapshot(&[
        Item::File("old.mp4", 100, t1()),
        Item::File("media/keep.mov", 100, t1()),
        Item::File("media/gone.txt", 1, t1()),
    ]);
    let remote = snapshot(&[Item::File("intro.mp4", 200, t1()), Item::File("doc.txt", 1, t1())]);
    let policy = SyncPolicy::new().disable(Category::video());

    let plan = compute_sync_plan(&local, &remote, &policy);

    assert_eq!(paths(plan.additions()), vec!["doc.txt"]);
    // media/ holds a protected video, so only its other child goes
    assert_eq!(paths(plan.removals()), vec!["media/gone.txt"]);
}

#[test]
fn test_directory_removal_subsumes_children() {
    let local = snapshot(&[Item::File("old/a.txt", 1, t1()), Item::File("old/sub/b.txt", 1, t1())]);
    let remote = snapshot(&[]);

    let plan = compute_sync_plan(&local, &remote, &SyncPolicy::new());

    assert_eq!(paths(plan.removals()), vec!["old"]);
}

#[test]
fn test_kind_change_is_removal_and_modification() {
    let local = snapshot(&[Item::File("x/inner.txt", 1, t1()), Item::File("y", 1, t1())]);
    let remote = snapshot(&[Item::File("x", 1, t1()), Item::File("y/inner.txt", 1, t1())]);

    let plan = compute_sync_plan(&local, &remote, &SyncPolicy::new());

    assert_eq!(paths(plan.removals()), vec!["x", "y"]);
    assert_eq!(paths(plan.modifications()), vec!["x"]);
    assert_eq!(paths(plan.additions()), vec!["y/inner.txt"]);
    assert_eq!(paths(plan.directories_to_create()), vec!["y"]);
}

#[test]
fn test_structure_changed() {
    let local = snapshot(&[Item::Dir("a"), Item::File("a/f", 1, t1())]);
    let same = snapshot(&[Item::Dir("a"), Item::File("a/f", 2, t1())]);
    let moved = snapshot(&[Item::Dir("b"), Item::File("b/f", 1, t1())]);
    let policy = SyncPolicy::new().compare_structure(true);

    assert_eq!(compute_sync_plan(&local, &same, &policy).structure_changed(), Some(false));
    assert_eq!(compute_sync_plan(&local, &moved, &policy).structure_changed(), Some(true));
    assert_eq!(
        compute_sync_plan(&local, &moved, &SyncPolicy::new()).structure_changed(),
        None
    );
}

#[test]
fn test_convergence() {
    let local = snapshot(&[
        Item::File("stale.txt", 1, t1()),
        Item::File("keep.txt", 4, t1()),
        Item::File("changed.txt", 4, t1()),
        Item::File("old/nested/x", 1, t1()),
        Item::Link("cur", "v1"),
    ]);
    let remote = snapshot(&[
        Item::File("keep.txt", 4, t1()),
        Item::File("changed.txt", 5, t2()),
        Item::File("fresh/a.bin", 9, t2()),
        Item::Dir("empty"),
        Item::Link("cur", "v2"),
        Item::Link("fresh/link", "a.bin"),
    ]);
    let policy = SyncPolicy::new().compare_structure(true);

    let after = applied(&local, &remote, &policy);
    let plan = compute_sync_plan(&after, &remote, &policy);

    assert!(plan.is_empty(), "plan after apply was not empty: {plan:?}");
    assert_eq!(plan.structure_changed(), Some(false));
}

#[test]
fn test_convergence_with_disabled_category() {
    let local = snapshot(&[Item::File("old.mp4", 1, t1()), Item::File("a.txt", 1, t1())]);
    let remote = snapshot(&[Item::File("new.mp4", 1, t1()), Item::File("b.txt", 1, t1())]);
    let policy = SyncPolicy::new().disable(Category::video());

    let after = applied(&local, &remote, &policy);

    assert!(after.contains("old.mp4"));
    assert!(!after.contains("new.mp4"));
    assert!(compute_sync_plan(&after, &remote, &policy).is_empty());
}

#[test]
fn test_unsized_remote_file_converges() {
    let mut remote = SnapshotBuilder::new(t2());
    remote
        .add_file_at(
            "a.txt",
            FileMeta::r#unsized().with_modified(t1()).with_download_url("files/a.txt"),
        )
        .unwrap();
    let remote = remote.build();

    // What a download leaves on disk: the real size and the remote date.
    let mut local = SnapshotBuilder::new(t2());
    local
        .add_file_at("a.txt", FileMeta::new(5).with_modified(t1()))
        .unwrap();
    let plan = compute_sync_plan(&local.build(), &remote, &SyncPolicy::new());
    assert!(plan.is_empty(), "{plan:?}");

    let mut outdated = SnapshotBuilder::new(t2());
    outdated
        .add_file_at("a.txt", FileMeta::new(5).with_modified(t2()))
        .unwrap();
    let plan = compute_sync_plan(&outdated.build(), &remote, &SyncPolicy::new());
    assert_eq!(paths(plan.modifications()), vec!["a.txt"]);
}

#[test]
fn test_staged_file_without_remote_date_is_reused() {
    let local = snapshot(&[]);
    let mut remote = SnapshotBuilder::new(t2());
    remote
        .add_file_at("a.txt", FileMeta::new(5).with_download_url("files/a.txt"))
        .unwrap();
    remote
        .add_file_at("b.txt", FileMeta::new(3).with_download_url("files/b.txt"))
        .unwrap();
    let remote = remote.build();

    let mut staged = SnapshotBuilder::new(t2());
    staged
        .add_file_at("a.txt", FileMeta::new(5).with_modified(t1()))
        .unwrap();
    staged
        .add_file_at("b.txt", FileMeta::new(2).with_modified(t1()))
        .unwrap();
    let staged = staged.build();

    let plan = compute_sync_plan_with_staged(&local, &remote, &SyncPolicy::new(), Some(&staged));

    assert_eq!(plan.staged().collect::<Vec<_>>(), vec!["a.txt"]);
    assert_eq!(plan.remaining_downloads().collect::<Vec<_>>(), vec!["b.txt"]);
    assert_eq!(plan.total_items_to_download(), 1);
}
