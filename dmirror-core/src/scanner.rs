//! Initial-sync walk: seeds a worker's queue with the events that make its
//! target equal to the source.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::event::ChangeEvent;
use crate::paths;
use crate::worker::TargetWorker;

/// Depth-first walk of the worker's source root.
pub async fn scan(worker: &TargetWorker, cancel: &CancellationToken) -> Result<()> {
    scan_subtree(worker.source_root(), worker, cancel).await
}

/// The same walk rooted at an arbitrary subtree of the worker's source. Used
/// for directory renames, where children arrive with the rename and get no
/// notifications of their own.
///
/// Emission order is a topological order of the tree: a directory's
/// `EnsureDir` precedes every event under it. Symlinks are emitted with
/// their link target rewritten against the worker's roots and are never
/// descended into.
pub async fn scan_subtree(
    root: &Path,
    worker: &TargetWorker,
    cancel: &CancellationToken,
) -> Result<()> {
    for entry in WalkDir::new(root).min_depth(1) {
        if cancel.is_cancelled() {
            bail!("scan of {} cancelled", root.display());
        }
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        let rel = match paths::relative_to(entry.path(), worker.source_root()) {
            Some(rel) => rel,
            None => continue,
        };
        let event = if entry.path_is_symlink() {
            let link = std::fs::read_link(entry.path())
                .with_context(|| format!("readlink {}", entry.path().display()))?;
            // Follows the link: a dangling target simply becomes a file link.
            let dir_link = std::fs::metadata(entry.path())
                .map(|m| m.is_dir())
                .unwrap_or(false);
            ChangeEvent::CreateSymlink {
                rel,
                target: paths::rewrite_link_target(
                    &link,
                    worker.source_root(),
                    worker.target_root(),
                ),
                dir_link,
            }
        } else if entry.file_type().is_dir() {
            ChangeEvent::EnsureDir(rel)
        } else {
            ChangeEvent::CopyFile(rel, entry.path().to_path_buf())
        };
        worker.push(event).await?;
    }
    Ok(())
}
