//! JWalk-based directory scanner.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use jwalk::{Parallelism, WalkDir};

use contentsync_core::{
    CategoryMatcher, FileMeta, NodeId, ScanConfig, ScanError, Snapshot, SnapshotBuilder,
};

/// Builds snapshots of local directories.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalScanner;

impl LocalScanner {
    /// Create a new scanner.
    pub fn new() -> Self {
        Self
    }

    /// Scan `config.root` into a snapshot.
    ///
    /// A missing root is not an error: it yields a snapshot holding only the
    /// root directory, which is what a first run looks like.
    pub fn scan(&self, config: &ScanConfig) -> Result<Snapshot, ScanError> {
        let scanned_at = truncate_to_secs(Utc::now());

        let metadata = match std::fs::metadata(&config.root) {
            Ok(m) => m,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(root = %config.root.display(), "scan root missing, empty snapshot");
                return Ok(Snapshot::empty(scanned_at));
            }
            Err(err) => return Err(ScanError::io(&config.root, err)),
        };
        if !metadata.is_dir() {
            return Err(ScanError::NotADirectory {
                path: config.root.clone(),
            });
        }

        let root_path = config
            .root
            .canonicalize()
            .map_err(|e| ScanError::io(&config.root, e))?;

        let mut entries = self.collect_entries(config, &root_path);

        let root_name = root_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut builder = SnapshotBuilder::new(scanned_at).root_name(root_name);
        build_dir(&mut builder, NodeId::ROOT, &root_path, &mut entries)?;

        let snapshot = builder.build();
        tracing::debug!(
            root = %root_path.display(),
            nodes = snapshot.len(),
            bytes = snapshot.total_size(),
            "scanned local tree"
        );
        Ok(snapshot)
    }

    /// Collect all entries using jwalk, grouped by parent directory.
    fn collect_entries(
        &self,
        config: &ScanConfig,
        root_path: &Path,
    ) -> HashMap<PathBuf, Vec<EntryInfo>> {
        let ignore = config.ignore_matcher();
        let walker = WalkDir::new(root_path)
            .parallelism(Parallelism::Serial)
            .sort(true)
            .skip_hidden(!config.include_hidden)
            .follow_links(config.follow_symlinks)
            .min_depth(1)
            .max_depth(config.max_depth.map(|d| d as usize).unwrap_or(usize::MAX));

        let mut entries_by_parent: HashMap<PathBuf, Vec<EntryInfo>> = HashMap::new();

        for entry_result in walker {
            let entry = match entry_result {
                Ok(e) => e,
                Err(err) => {
                    tracing::warn!(%err, "skipping unreadable entry");
                    continue;
                }
            };

            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if is_ignored(&ignore, root_path, &path, &name) {
                continue;
            }

            let file_type = entry.file_type();
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_symlink() {
                match std::fs::read_link(&path) {
                    Ok(target) => EntryKind::Symlink {
                        target: target.to_string_lossy().to_string(),
                    },
                    Err(err) => {
                        tracing::warn!(path = %path.display(), %err, "cannot read symlink");
                        continue;
                    }
                }
            } else if file_type.is_file() {
                let metadata = match entry.metadata() {
                    Ok(m) => m,
                    Err(err) => {
                        tracing::warn!(path = %path.display(), %err, "cannot read metadata");
                        continue;
                    }
                };
                EntryKind::File {
                    size: metadata.len(),
                    modified: metadata.modified().ok().map(system_time_to_utc),
                }
            } else {
                tracing::debug!(path = %path.display(), "skipping special file");
                continue;
            };

            if let Some(parent) = path.parent() {
                entries_by_parent
                    .entry(parent.to_path_buf())
                    .or_default()
                    .push(EntryInfo { name, path, kind });
            }
        }

        entries_by_parent
    }
}

/// Temporary struct for collecting entry information.
struct EntryInfo {
    name: String,
    path: PathBuf,
    kind: EntryKind,
}

enum EntryKind {
    Directory,
    File {
        size: u64,
        modified: Option<DateTime<Utc>>,
    },
    Symlink {
        target: String,
    },
}

/// Recursively add the children of `path` under `parent`.
fn build_dir(
    builder: &mut SnapshotBuilder,
    parent: NodeId,
    path: &Path,
    entries_by_parent: &mut HashMap<PathBuf, Vec<EntryInfo>>,
) -> Result<(), ScanError> {
    let children = entries_by_parent.remove(path).unwrap_or_default();

    for entry in children {
        match entry.kind {
            EntryKind::Directory => {
                let id = builder.add_directory(parent, &entry.name)?;
                build_dir(builder, id, &entry.path, entries_by_parent)?;
            }
            EntryKind::File { size, modified } => {
                let meta = FileMeta {
                    download_url: None,
                    size: Some(size),
                    modified,
                };
                builder.add_file(parent, &entry.name, meta)?;
            }
            EntryKind::Symlink { target } => {
                builder.add_symlink(parent, &entry.name, &target)?;
            }
        }
    }
    Ok(())
}

fn is_ignored(ignore: &CategoryMatcher, root: &Path, path: &Path, name: &str) -> bool {
    let relative = path
        .strip_prefix(root)
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_else(|_| name.to_string());
    ignore.matches(&relative, name)
}

fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    truncate_to_secs(DateTime::<Utc>::from(time))
}

fn truncate_to_secs(time: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or(time)
}
