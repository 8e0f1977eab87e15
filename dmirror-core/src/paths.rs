use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};

/// Absolute, lexically normalized form of `p`: no `.`/`..` components and no
/// trailing separator. Relative inputs are resolved against the current
/// directory; the path itself does not have to exist.
pub fn normalize(p: &Path) -> Result<PathBuf> {
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("resolve current directory")?
            .join(p)
    };
    Ok(normalize_lexical(&abs))
}

/// `.`/`..` resolution on an already absolute path, without touching the
/// filesystem. `..` at the root stays at the root.
pub(crate) fn normalize_lexical(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// True when `candidate` equals `base` or lies beneath it. Both paths must
/// already be normalized; comparison is by components.
pub fn is_subpath(candidate: &Path, base: &Path) -> bool {
    candidate.starts_with(base)
}

/// Relative path of `full` under `root`, or `None` when `full` escapes the
/// root. `Some("")` means the root itself.
pub(crate) fn relative_to(full: &Path, root: &Path) -> Option<PathBuf> {
    normalize_lexical(full)
        .strip_prefix(root)
        .ok()
        .map(Path::to_path_buf)
}

/// Maps an absolute symlink target under `from_root` to the corresponding
/// path under `to_root`. Relative targets and absolute targets outside
/// `from_root` pass through verbatim, so links pointing out of the mirrored
/// tree keep their meaning.
pub fn rewrite_link_target(link: &Path, from_root: &Path, to_root: &Path) -> PathBuf {
    if !link.is_absolute() {
        return link.to_path_buf();
    }
    let canon = normalize_lexical(link);
    if canon == from_root {
        return to_root.to_path_buf();
    }
    match canon.strip_prefix(from_root) {
        Ok(rel) => to_root.join(rel),
        Err(_) => link.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lexical_basic() {
        assert_eq!(
            normalize_lexical(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_lexical(Path::new("/a/b/")), PathBuf::from("/a/b"));
        assert_eq!(normalize_lexical(Path::new("/../a")), PathBuf::from("/a"));
    }

    #[test]
    fn test_is_subpath_basic() {
        assert!(is_subpath(Path::new("/a/b"), Path::new("/a/b")));
        assert!(is_subpath(Path::new("/a/b/c"), Path::new("/a/b")));
        assert!(!is_subpath(Path::new("/a/bc"), Path::new("/a/b")));
        assert!(!is_subpath(Path::new("/a"), Path::new("/a/b")));
    }

    #[test]
    fn test_relative_to_basic() {
        assert_eq!(
            relative_to(Path::new("/src/d/f"), Path::new("/src")),
            Some(PathBuf::from("d/f"))
        );
        assert_eq!(
            relative_to(Path::new("/src"), Path::new("/src")),
            Some(PathBuf::from(""))
        );
        assert_eq!(relative_to(Path::new("/other/f"), Path::new("/src")), None);
        // A dotted path escaping the root is dropped, not misclassified.
        assert_eq!(relative_to(Path::new("/src/../etc"), Path::new("/src")), None);
    }

    #[test]
    fn test_rewrite_link_target_basic() {
        let from = Path::new("/abs/source");
        let to = Path::new("/abs/target");
        assert_eq!(
            rewrite_link_target(Path::new("data.txt"), from, to),
            PathBuf::from("data.txt")
        );
        assert_eq!(
            rewrite_link_target(Path::new("/abs/source/data.txt"), from, to),
            PathBuf::from("/abs/target/data.txt")
        );
        assert_eq!(rewrite_link_target(from, from, to), to.to_path_buf());
        assert_eq!(
            rewrite_link_target(Path::new("/etc/hosts"), from, to),
            PathBuf::from("/etc/hosts")
        );
        // Dotted components resolve before the containment check.
        assert_eq!(
            rewrite_link_target(Path::new("/abs/source/sub/../f"), from, to),
            PathBuf::from("/abs/target/f")
        );
        // A sibling sharing the prefix string is not inside the root.
        assert_eq!(
            rewrite_link_target(Path::new("/abs/sourceX/f"), from, to),
            PathBuf::from("/abs/sourceX/f")
        );
    }
}
