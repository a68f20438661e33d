//! Async apply operation with progress reporting.
//!
//! Applies a list of [`ApplyAction`]s to the live content root. Every action
//! is attempted; failures are recorded and do not stop the run.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use crate::operation::{ApplyAction, join_relative};
use crate::progress::{OperationComplete, OperationProgress};
use crate::{OPERATION_CHANNEL_SIZE, OperationError};

/// Result sent through the channel during apply operations.
#[derive(Debug)]
pub enum ApplyResult {
    /// Progress update.
    Progress(OperationProgress),
    /// The operation completed.
    Complete(OperationComplete),
}

/// Everything an apply run needs.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    /// Live content directory.
    pub content_root: PathBuf,
    /// Where staged files are taken from.
    pub staging_root: PathBuf,
    /// Actions in execution order.
    pub actions: Vec<ApplyAction>,
}

/// Start an async apply operation.
///
/// Returns a receiver for progress updates and the final result.
pub fn start_apply(request: ApplyRequest) -> mpsc::Receiver<ApplyResult> {
    let (tx, rx) = mpsc::channel(OPERATION_CHANNEL_SIZE);

    tokio::spawn(async move {
        apply_impl(request, tx).await;
    });

    rx
}

async fn apply_impl(request: ApplyRequest, tx: mpsc::Sender<ApplyResult>) {
    let total = request.actions.len();
    let mut progress = OperationProgress::new(total);
    let mut succeeded = 0;
    let mut failed = 0;

    for action in request.actions {
        let target = join_relative(&request.content_root, action.path());

        let content_root = request.content_root.clone();
        let staging_root = request.staging_root.clone();
        let result = tokio::task::spawn_blocking(move || {
            apply_action(&action, &content_root, &staging_root)
        })
        .await
        .map_err(|e| format!("Task failed: {}", e));

        match result {
            Ok(Ok(bytes)) => {
                progress.complete_file(bytes);
                succeeded += 1;
            }
            Ok(Err(e)) => {
                tracing::warn!(path = %target.display(), err = %e, "apply action failed");
                progress.add_error(OperationError::new(target, e.to_string()));
                failed += 1;
            }
            Err(e) => {
                progress.add_error(OperationError::new(target, e));
                failed += 1;
            }
        }

        let _ = tx.send(ApplyResult::Progress(progress.clone())).await;
    }

    let _ = tx
        .send(ApplyResult::Complete(OperationComplete {
            succeeded,
            failed,
            bytes_processed: progress.bytes_processed,
            errors: progress.errors,
        }))
        .await;
}

/// Execute one action. Returns the bytes moved.
pub fn apply_action(action: &ApplyAction, content_root: &Path, staging_root: &Path) -> io::Result<u64> {
    let target = join_relative(content_root, action.path());
    match action {
        ApplyAction::Remove { .. } => remove_item(&target).map(|_| 0),
        ApplyAction::CreateDirectory { .. } => create_directory(&target).map(|_| 0),
        ApplyAction::MoveStaged { path } => {
            let source = join_relative(staging_root, path);
            move_item(&source, &target)
        }
        ApplyAction::CreateSymlink { target: link_target, .. } => {
            create_symlink(link_target, &target).map(|_| 0)
        }
    }
}

/// Delete a file, symlink or directory tree. Missing paths are fine.
pub fn remove_item(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create a directory, replacing a non-directory in its way.
pub fn create_directory(path: &Path) -> io::Result<()> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.is_dir() {
            return Ok(());
        }
        fs::remove_file(path)?;
    }
    fs::create_dir_all(path)
}

/// Move a single file into place, replacing whatever is there.
pub fn move_item(source: &Path, dest: &Path) -> io::Result<u64> {
    let size = fs::metadata(source)?.len();
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_item(dest)?;

    // Try rename first (fast path for same filesystem)
    if fs::rename(source, dest).is_ok() {
        return Ok(size);
    }

    // Fall back to copy + delete for cross-filesystem moves
    let modified = fs::metadata(source)?.modified().ok();
    fs::copy(source, dest)?;
    if let Some(modified) = modified {
        fs::OpenOptions::new()
            .write(true)
            .open(dest)?
            .set_modified(modified)?;
    }
    fs::remove_file(source)?;
    Ok(size)
}

/// Create or retarget a symlink at `link`.
pub fn create_symlink(target: &str, link: &Path) -> io::Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_item(link)?;
    symlink(target, link)
}

#[cfg(unix)]
fn symlink(target: &str, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &str, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(not(any(unix, windows)))]
fn symlink(_target: &str, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks are not supported"))
}

/// Remove everything inside `dir`, keeping `dir` itself.
pub fn clear_directory(dir: &Path, keep: &[&str]) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if keep.iter().any(|k| entry.file_name() == **k) {
            continue;
        }
        remove_item(&entry.path())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf, PathBuf) {
        let temp = TempDir::new().unwrap();
        let content = temp.path().join("content");
        let staging = temp.path().join("staging");
        fs::create_dir_all(&content).unwrap();
        fs::create_dir_all(&staging).unwrap();
        (temp, content, staging)
    }

    async fn run(request: ApplyRequest) -> OperationComplete {
        let mut rx = start_apply(request);
        let mut last_completed = 0;
        while let Some(result) = rx.recv().await {
            match result {
                ApplyResult::Progress(p) => {
                    assert!(p.files_completed >= last_completed);
                    last_completed = p.files_completed;
                }
                ApplyResult::Complete(c) => return c,
            }
        }
        panic!("apply channel closed without completion");
    }

    #[tokio::test]
    async fn test_apply_in_order() {
        let (_temp, content, staging) = setup();
        fs::create_dir_all(content.join("old")).unwrap();
        fs::write(content.join("old/x.txt"), "x").unwrap();
        fs::create_dir_all(staging.join("new")).unwrap();
        fs::write(staging.join("new/a.txt"), "alpha").unwrap();

        let complete = run(ApplyRequest {
            content_root: content.clone(),
            staging_root: staging.clone(),
            actions: vec![
                ApplyAction::remove("old"),
                ApplyAction::create_directory("new"),
                ApplyAction::create_directory("empty"),
                ApplyAction::move_staged("new/a.txt"),
            ],
        })
        .await;

        assert!(complete.is_success(), "{:?}", complete.errors);
        assert_eq!(complete.succeeded, 4);
        assert_eq!(complete.bytes_processed, 5);
        assert!(!content.join("old").exists());
        assert!(content.join("empty").is_dir());
        assert_eq!(fs::read_to_string(content.join("new/a.txt")).unwrap(), "alpha");
        assert!(!staging.join("new/a.txt").exists());
    }

    #[tokio::test]
    async fn test_missing_staged_file_is_recorded() {
        let (_temp, content, staging) = setup();

        let complete = run(ApplyRequest {
            content_root: content.clone(),
            staging_root: staging,
            actions: vec![
                ApplyAction::move_staged("ghost.txt"),
                ApplyAction::create_directory("d"),
            ],
        })
        .await;

        assert_eq!(complete.failed, 1);
        assert_eq!(complete.succeeded, 1);
        assert_eq!(complete.errors[0].path, content.join("ghost.txt"));
        assert!(content.join("d").is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_retarget() {
        let (_temp, content, staging) = setup();
        std::os::unix::fs::symlink("v1", content.join("cur")).unwrap();

        let complete = run(ApplyRequest {
            content_root: content.clone(),
            staging_root: staging,
            actions: vec![ApplyAction::create_symlink("cur", "v2")],
        })
        .await;

        assert!(complete.is_success());
        assert_eq!(fs::read_link(content.join("cur")).unwrap(), PathBuf::from("v2"));
    }

    #[test]
    fn test_move_replaces_directory() {
        let (_temp, content, staging) = setup();
        fs::create_dir_all(content.join("x/inner")).unwrap();
        fs::write(staging.join("x"), "file now").unwrap();

        move_item(&staging.join("x"), &content.join("x")).unwrap();
        assert!(content.join("x").is_file());
    }

    #[test]
    fn test_clear_directory_keeps_listed() {
        let (_temp, _content, staging) = setup();
        fs::write(staging.join("state.json"), "{}").unwrap();
        fs::create_dir_all(staging.join("d")).unwrap();
        fs::write(staging.join("d/f"), "f").unwrap();

        clear_directory(&staging, &["state.json"]).unwrap();

        assert!(staging.join("state.json").exists());
        assert!(!staging.join("d").exists());
        clear_directory(&staging.join("absent"), &[]).unwrap();
    }
}
