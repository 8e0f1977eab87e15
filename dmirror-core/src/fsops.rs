//! Filesystem primitives shared by the worker and the restore engine.

use anyhow::{Context, Result};
use filetime::FileTime;
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufReader};

pub(crate) const COPY_BUFFER: usize = 128 * 1024;

/// Remove whatever sits at `path`: files and symlinks are unlinked,
/// directories removed recursively. A missing entry is success, which keeps
/// repeated or out-of-order delete notifications idempotent.
pub(crate) async fn remove_any(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
    };
    let removed = if meta.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };
    match removed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

/// Create the parent directory of `path` if it is missing.
pub(crate) async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    Ok(())
}

/// Byte-for-byte streamed copy through a fixed buffer. The destination must
/// not exist; callers remove it first.
pub(crate) async fn copy_contents(src: &Path, dst: &Path) -> Result<u64> {
    let reader = fs::File::open(src)
        .await
        .with_context(|| format!("open {}", src.display()))?;
    let mut reader = BufReader::with_capacity(COPY_BUFFER, reader);
    let mut writer = fs::File::create(dst)
        .await
        .with_context(|| format!("create {}", dst.display()))?;
    let bytes = tokio::io::copy_buf(&mut reader, &mut writer)
        .await
        .with_context(|| format!("copy {} -> {}", src.display(), dst.display()))?;
    writer
        .flush()
        .await
        .with_context(|| format!("flush {}", dst.display()))?;
    Ok(bytes)
}

/// Stamp `dst` with the last-modification time recorded in `src_meta`.
pub(crate) fn copy_mtime(src_meta: &std::fs::Metadata, dst: &Path) -> Result<()> {
    let mtime = FileTime::from_last_modification_time(src_meta);
    filetime::set_file_mtime(dst, mtime).with_context(|| format!("set mtime on {}", dst.display()))
}

/// Create a symlink at `path` pointing at `target` verbatim.
#[cfg(unix)]
pub(crate) async fn make_symlink(target: &Path, path: &Path, _dir_link: bool) -> Result<()> {
    fs::symlink(target, path)
        .await
        .with_context(|| format!("symlink {}", path.display()))
}

#[cfg(windows)]
pub(crate) async fn make_symlink(target: &Path, path: &Path, dir_link: bool) -> Result<()> {
    let created = if dir_link {
        fs::symlink_dir(target, path).await
    } else {
        fs::symlink_file(target, path).await
    };
    created.with_context(|| format!("symlink {}", path.display()))
}
