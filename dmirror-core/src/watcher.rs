//! Live change feed: a notify subscription on one source root, translated
//! into change events and broadcast to every worker of the session.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::ChangeEvent;
use crate::manager::SyncManager;
use crate::paths;
use crate::scanner;
use crate::worker::TargetWorker;

/// What one notify event asks of the mirror, independent of any target tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WatchAction {
    /// A path was created or its content/metadata changed.
    Upsert(PathBuf),
    /// A path is gone; its former kind is unknown.
    Remove(PathBuf),
    Rename { from: PathBuf, to: PathBuf },
}

/// Translate a raw notify event into actions.
///
/// Rename halves that arrive unpaired degrade to `Remove`/`Upsert`; the
/// worker's unified removal and replace-on-copy keep the overlap with a
/// later cookie-matched pair harmless.
pub(crate) fn actions_for(event: &notify::Event) -> Vec<WatchAction> {
    let upserts = |event: &notify::Event| {
        event
            .paths
            .iter()
            .cloned()
            .map(WatchAction::Upsert)
            .collect()
    };
    match &event.kind {
        EventKind::Create(_) | EventKind::Any => upserts(event),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both if event.paths.len() == 2 => vec![WatchAction::Rename {
                from: event.paths[0].clone(),
                to: event.paths[1].clone(),
            }],
            RenameMode::From => event
                .paths
                .iter()
                .cloned()
                .map(WatchAction::Remove)
                .collect(),
            RenameMode::To => upserts(event),
            // The backend lost track of which side this is; removing then
            // restating the live kind covers both.
            _ => event
                .paths
                .iter()
                .flat_map(|p| [WatchAction::Remove(p.clone()), WatchAction::Upsert(p.clone())])
                .collect(),
        },
        EventKind::Modify(_) => upserts(event),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .cloned()
            .map(WatchAction::Remove)
            .collect(),
        // Access and the catch-all kinds carry no mirrored state.
        _ => Vec::new(),
    }
}

/// Armed watcher for one source root.
///
/// Holds only a weak reference back to the registry and looks the session up
/// by source path on every event, so a stopped session cannot be kept alive
/// by its own watcher.
pub(crate) struct SourceWatcher {
    _watcher: RecommendedWatcher,
    cancel: CancellationToken,
    dispatch: JoinHandle<()>,
}

impl SourceWatcher {
    /// Subscribe to `source_root` recursively and start the dispatch task.
    pub(crate) fn arm(source_root: PathBuf, manager: Weak<SyncManager>) -> Result<Self> {
        let (tx, rx) = mpsc::channel(1024);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // Keep the OS callback short: hand the event to the dispatch task.
            let _ = tx.blocking_send(res);
        })
        .context("create filesystem watcher")?;
        watcher
            .watch(&source_root, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", source_root.display()))?;
        let cancel = CancellationToken::new();
        let dispatch = tokio::spawn(dispatch_loop(
            source_root,
            manager,
            rx,
            cancel.clone(),
        ));
        Ok(Self {
            _watcher: watcher,
            cancel,
            dispatch,
        })
    }

    /// Stop the notify subscription and wait for the dispatch task.
    pub(crate) async fn dispose(self) {
        let Self {
            _watcher,
            cancel,
            dispatch,
        } = self;
        cancel.cancel();
        drop(_watcher);
        let _ = dispatch.await;
    }
}

async fn dispatch_loop(
    source_root: PathBuf,
    manager: Weak<SyncManager>,
    mut rx: mpsc::Receiver<notify::Result<notify::Event>>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = rx.recv() => match received {
                Some(received) => received,
                None => return,
            },
        };
        let event = match received {
            Ok(event) => event,
            Err(e) => {
                warn!("watch error on {}: {e}", source_root.display());
                continue;
            }
        };
        for action in actions_for(&event) {
            let Some(manager) = manager.upgrade() else { return };
            dispatch(&manager, &source_root, action, &cancel).await;
        }
    }
}

async fn dispatch(
    manager: &Arc<SyncManager>,
    source_root: &Path,
    action: WatchAction,
    cancel: &CancellationToken,
) {
    match action {
        WatchAction::Upsert(full) => {
            if tokio::fs::symlink_metadata(source_root).await.is_err() {
                // The source itself is gone; the whole session stops. Runs in
                // its own task so this loop stays joinable.
                let manager = manager.clone();
                let source = source_root.to_path_buf();
                tokio::spawn(async move { manager.stop_session(&source).await });
                return;
            }
            let Some(rel) = rel_in_root(&full, source_root) else {
                return;
            };
            // Raced deletes are dropped here; the Remove event follows.
            let Ok(meta) = tokio::fs::symlink_metadata(&full).await else {
                return;
            };
            let workers = manager.snapshot_workers(source_root);
            if meta.is_symlink() {
                broadcast_symlink(&workers, source_root, &full, rel).await;
            } else if meta.is_dir() {
                broadcast(&workers, ChangeEvent::EnsureDir(rel)).await;
            } else {
                broadcast(&workers, ChangeEvent::CopyFile(rel, full)).await;
            }
        }
        WatchAction::Remove(full) => {
            let Some(rel) = rel_in_root(&full, source_root) else {
                return;
            };
            let workers = manager.snapshot_workers(source_root);
            broadcast(&workers, ChangeEvent::DeleteFile(rel.clone())).await;
            broadcast(&workers, ChangeEvent::DeleteDir(rel)).await;
        }
        WatchAction::Rename { from, to } => {
            let (Some(old_rel), Some(new_rel)) =
                (rel_in_root(&from, source_root), rel_in_root(&to, source_root))
            else {
                return;
            };
            let workers = manager.snapshot_workers(source_root);
            broadcast(&workers, ChangeEvent::DeleteFile(old_rel.clone())).await;
            broadcast(&workers, ChangeEvent::DeleteDir(old_rel)).await;
            let Ok(meta) = tokio::fs::symlink_metadata(&to).await else {
                return;
            };
            if meta.is_symlink() {
                broadcast_symlink(&workers, source_root, &to, new_rel).await;
            } else if meta.is_dir() {
                broadcast(&workers, ChangeEvent::EnsureDir(new_rel)).await;
                // Children moved in with the rename; restate the subtree.
                for worker in &workers {
                    if let Err(e) = scanner::scan_subtree(&to, worker, cancel).await {
                        warn!("rescan of {} failed: {e:#}", to.display());
                    }
                }
            } else {
                broadcast(&workers, ChangeEvent::CopyFile(new_rel, to)).await;
            }
        }
    }
}

/// Relative path under `root`, dropping escapes and the root itself.
fn rel_in_root(full: &Path, root: &Path) -> Option<PathBuf> {
    match paths::relative_to(full, root) {
        Some(rel) if !rel.as_os_str().is_empty() => Some(rel),
        _ => None,
    }
}

async fn broadcast_symlink(
    workers: &[Arc<TargetWorker>],
    source_root: &Path,
    full: &Path,
    rel: PathBuf,
) {
    let Ok(link) = tokio::fs::read_link(full).await else {
        return;
    };
    let dir_link = tokio::fs::metadata(full)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    for worker in workers {
        let event = ChangeEvent::CreateSymlink {
            rel: rel.clone(),
            target: paths::rewrite_link_target(&link, source_root, worker.target_root()),
            dir_link,
        };
        push_live(worker, event).await;
    }
}

async fn broadcast(workers: &[Arc<TargetWorker>], event: ChangeEvent) {
    for worker in workers {
        push_live(worker, event.clone()).await;
    }
}

async fn push_live(worker: &Arc<TargetWorker>, event: ChangeEvent) {
    if let Err(e) = worker.push(event).await {
        debug!("dropped live event for stopped worker: {e}");
    }
}
