#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Poll `cond` until it holds or a 10 s deadline passes. Background scans
/// and watcher deliveries have no completion signal, so tests converge on
/// observable filesystem state.
pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn write(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

pub fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

pub fn mtime(path: &Path) -> filetime::FileTime {
    filetime::FileTime::from_last_modification_time(&std::fs::metadata(path).unwrap())
}

pub fn file_equals(src: &Path, dst: &Path) -> bool {
    let (Ok(a), Ok(b)) = (std::fs::read(src), std::fs::read(dst)) else {
        return false;
    };
    a == b && mtime(src) == mtime(dst)
}

/// Shape + content of a tree, for whole-tree equality assertions.
pub fn tree_snapshot(root: &Path) -> BTreeMap<PathBuf, String> {
    let mut out = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry = entry.unwrap();
        let rel = entry.path().strip_prefix(root).unwrap().to_path_buf();
        let describe = if entry.path_is_symlink() {
            format!(
                "link -> {}",
                std::fs::read_link(entry.path()).unwrap().display()
            )
        } else if entry.file_type().is_dir() {
            "dir".to_string()
        } else {
            format!("file {:?}", std::fs::read(entry.path()).unwrap())
        };
        out.insert(rel, describe);
    }
    out
}
