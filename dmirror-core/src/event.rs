use std::path::{Path, PathBuf};

/// One mirror operation to apply against a worker's target tree.
///
/// Relative paths are expressed against the session's source root; the
/// `CopyFile` source is the absolute path the bytes are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// Ensure `target/rel` exists as a directory, replacing any non-directory.
    EnsureDir(PathBuf),
    /// Copy the absolute source path to `target/rel`, replacing whatever is there.
    CopyFile(PathBuf, PathBuf),
    /// Remove the entry at `target/rel`; a missing entry is not an error.
    DeleteFile(PathBuf),
    /// Same removal semantics as `DeleteFile`; emitted when the vanished
    /// entry was (or may have been) a directory.
    DeleteDir(PathBuf),
    /// Create a symlink at `target/rel` with the literal `target`, replacing
    /// any existing entry. `dir_link` selects the flavor on platforms that
    /// distinguish file and directory links.
    CreateSymlink {
        rel: PathBuf,
        target: PathBuf,
        dir_link: bool,
    },
}

impl ChangeEvent {
    /// The path this event acts on, relative to the target root.
    pub fn rel(&self) -> &Path {
        match self {
            ChangeEvent::EnsureDir(rel)
            | ChangeEvent::CopyFile(rel, _)
            | ChangeEvent::DeleteFile(rel)
            | ChangeEvent::DeleteDir(rel) => rel,
            ChangeEvent::CreateSymlink { rel, .. } => rel,
        }
    }
}
