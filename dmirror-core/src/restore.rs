//! Reverse mirror: make a source identical to one of its targets.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use filetime::FileTime;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::fsops;
use crate::paths;

/// Copy `target_root` over `source_root`, then delete everything under the
/// source with no counterpart in the target.
///
/// Files are skipped when length and modification time already match.
/// Symlinks are recreated with their literal target rewritten from the
/// target tree back into the source tree. Must only run once the session
/// for `source_root` has been stopped.
pub async fn restore(
    source_root: &Path,
    target_root: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    match tokio::fs::metadata(target_root).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => bail!("restore target {} is not a directory", target_root.display()),
        Err(e) => {
            return Err(e).with_context(|| format!("restore target {}", target_root.display()))
        }
    }
    tokio::fs::create_dir_all(source_root)
        .await
        .with_context(|| format!("create {}", source_root.display()))?;

    let mut present: HashSet<PathBuf> = HashSet::new();
    for entry in WalkDir::new(target_root).min_depth(1) {
        if cancel.is_cancelled() {
            bail!("restore of {} cancelled", source_root.display());
        }
        let entry = entry.with_context(|| format!("walk {}", target_root.display()))?;
        let rel = match paths::relative_to(entry.path(), target_root) {
            Some(rel) => rel,
            None => continue,
        };
        let dst = source_root.join(&rel);
        present.insert(rel);
        if entry.path_is_symlink() {
            let link = std::fs::read_link(entry.path())
                .with_context(|| format!("readlink {}", entry.path().display()))?;
            let rewritten = paths::rewrite_link_target(&link, target_root, source_root);
            let dir_link = std::fs::metadata(entry.path())
                .map(|m| m.is_dir())
                .unwrap_or(false);
            fsops::remove_any(&dst).await?;
            fsops::make_symlink(&rewritten, &dst, dir_link).await?;
        } else if entry.file_type().is_dir() {
            restore_dir(&dst).await?;
        } else {
            restore_file(entry.path(), &dst).await?;
        }
    }

    // Anything the target does not know about goes away. Symlinked
    // directories are removed as links, never walked into.
    let mut walk = WalkDir::new(source_root).min_depth(1).into_iter();
    while let Some(entry) = walk.next() {
        if cancel.is_cancelled() {
            bail!("restore of {} cancelled", source_root.display());
        }
        let entry = entry.with_context(|| format!("walk {}", source_root.display()))?;
        let rel = match paths::relative_to(entry.path(), source_root) {
            Some(rel) => rel,
            None => continue,
        };
        if present.contains(&rel) {
            continue;
        }
        let pruned_dir = entry.file_type().is_dir() && !entry.path_is_symlink();
        fsops::remove_any(entry.path()).await?;
        if pruned_dir {
            walk.skip_current_dir();
        }
    }
    Ok(())
}

async fn restore_dir(dst: &Path) -> Result<()> {
    match tokio::fs::symlink_metadata(dst).await {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => fsops::remove_any(dst).await?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("stat {}", dst.display())),
    }
    tokio::fs::create_dir_all(dst)
        .await
        .with_context(|| format!("create {}", dst.display()))
}

/// Copy `src` to `dst` unless an existing regular file already matches by
/// `(length, mtime)`; stamp the source's mtime after copying.
async fn restore_file(src: &Path, dst: &Path) -> Result<()> {
    let src_meta = tokio::fs::metadata(src)
        .await
        .with_context(|| format!("stat {}", src.display()))?;
    if let Ok(meta) = tokio::fs::symlink_metadata(dst).await {
        if meta.is_file()
            && meta.len() == src_meta.len()
            && FileTime::from_last_modification_time(&meta)
                == FileTime::from_last_modification_time(&src_meta)
        {
            return Ok(());
        }
    }
    fsops::ensure_parent(dst).await?;
    fsops::remove_any(dst).await?;
    fsops::copy_contents(src, dst).await?;
    fsops::copy_mtime(&src_meta, dst)
}
