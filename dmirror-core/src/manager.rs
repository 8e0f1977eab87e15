//! Session registry: binds sources to targets, owns the workers and
//! watchers, and coordinates initial scans with live-watch arming.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SyncOptions;
use crate::paths;
use crate::restore;
use crate::scanner;
use crate::watcher::SourceWatcher;
use crate::worker::TargetWorker;

/// One live source with its mirrors. Mutated only under the registry lock.
struct Session {
    workers: HashMap<PathBuf, Arc<TargetWorker>>,
    watcher: Option<SourceWatcher>,
    pending_scans: usize,
    scan_cancel: CancellationToken,
    scan_tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn new() -> Self {
        Self {
            workers: HashMap::new(),
            watcher: None,
            pending_scans: 0,
            scan_cancel: CancellationToken::new(),
            scan_tasks: Vec::new(),
        }
    }
}

/// Snapshot of one session, as reported by [`SyncManager::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub source: PathBuf,
    pub targets: Vec<PathBuf>,
    /// Initial scans still running; the watcher arms once this reaches zero.
    pub pending_scans: usize,
    pub watching: bool,
}

/// Process-wide registry of mirror sessions.
///
/// All session state sits behind one mutex. The lock is only ever held to
/// mutate the maps or snapshot references, never across I/O, queue pushes,
/// worker teardown, or any await point.
pub struct SyncManager {
    sessions: Mutex<HashMap<PathBuf, Session>>,
    options: SyncOptions,
}

impl SyncManager {
    pub fn new(options: SyncOptions) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            options,
        })
    }

    /// Register `targets` as mirrors of `source`.
    ///
    /// A target equal to or inside the source rejects the whole call.
    /// Targets that are unusable (non-empty, not a directory, creation
    /// failed) or already mirroring this source are skipped with a warning;
    /// the rest each get a worker and a background initial scan. The live
    /// watcher arms once every scan of the session has finished.
    pub async fn add(self: &Arc<Self>, source: &Path, targets: &[PathBuf]) -> Result<()> {
        let source = paths::normalize(source)?;
        let meta = tokio::fs::metadata(&source)
            .await
            .with_context(|| format!("source {}", source.display()))?;
        if !meta.is_dir() {
            bail!("source {} is not a directory", source.display());
        }

        let mut requested: Vec<PathBuf> = Vec::new();
        for target in targets {
            let target = paths::normalize(target)?;
            if paths::is_subpath(&target, &source) {
                bail!(
                    "target {} is inside source {}",
                    target.display(),
                    source.display()
                );
            }
            if !requested.contains(&target) {
                requested.push(target);
            }
        }

        let existing: Vec<PathBuf> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .get(&source)
                .map(|s| s.workers.keys().cloned().collect())
                .unwrap_or_default()
        };

        let mut accepted = Vec::new();
        for target in requested {
            if existing.contains(&target) {
                warn!("{} already mirrors {}", target.display(), source.display());
                continue;
            }
            match prepare_target(&target).await {
                Ok(()) => accepted.push(target),
                Err(e) => warn!("skipping target {}: {e:#}", target.display()),
            }
        }
        if accepted.is_empty() {
            return Ok(());
        }

        let mut spawned = Vec::new();
        {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions.entry(source.clone()).or_insert_with(Session::new);
            for target in accepted {
                if session.workers.contains_key(&target) {
                    continue;
                }
                let worker = TargetWorker::spawn(source.clone(), target.clone(), &self.options);
                session.workers.insert(target.clone(), worker.clone());
                session.pending_scans += 1;
                spawned.push((target, worker, session.scan_cancel.clone()));
            }
        }

        let mut scan_tasks = Vec::new();
        for (target, worker, cancel) in spawned {
            let manager = self.clone();
            let source = source.clone();
            scan_tasks.push(tokio::spawn(async move {
                info!("initial sync {} -> {}", source.display(), target.display());
                let result = scanner::scan(&worker, &cancel).await;
                manager.scan_finished(&source, &target, result).await;
            }));
        }
        if let Some(session) = self.sessions.lock().unwrap().get_mut(&source) {
            session.scan_tasks.extend(scan_tasks);
        }
        Ok(())
    }

    /// Detach `targets` from `source`'s session and drain their workers. The
    /// session (and its watcher) goes away when no target remains.
    pub async fn end(&self, source: &Path, targets: &[PathBuf]) -> Result<()> {
        let source = paths::normalize(source)?;
        let targets: Vec<PathBuf> = targets
            .iter()
            .map(|t| paths::normalize(t))
            .collect::<Result<_>>()?;

        let mut removed = Vec::new();
        let mut collapsed = None;
        {
            let mut sessions = self.sessions.lock().unwrap();
            let Some(session) = sessions.get_mut(&source) else {
                bail!("no session for {}", source.display());
            };
            for target in &targets {
                match session.workers.remove(target) {
                    Some(worker) => removed.push(worker),
                    None => warn!("{} does not mirror {}", target.display(), source.display()),
                }
            }
            if session.workers.is_empty() {
                collapsed = sessions.remove(&source);
            }
        }

        for worker in &removed {
            worker.complete();
        }
        if let Some(session) = collapsed {
            session.scan_cancel.cancel();
            teardown_session(&source, session).await;
        }
        for worker in &removed {
            worker.stop().await;
            info!("ended mirror into {}", worker.target_root().display());
        }
        Ok(())
    }

    /// Stop the session for `source` (if any), then make `source` identical
    /// to `target`.
    pub async fn restore(&self, source: &Path, target: &Path) -> Result<()> {
        let source = paths::normalize(source)?;
        let target = paths::normalize(target)?;
        self.stop_session(&source).await;
        info!("restoring {} from {}", source.display(), target.display());
        restore::restore(&source, &target, &CancellationToken::new()).await
    }

    /// Lexicographically sorted snapshot of the registry.
    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().unwrap();
        let mut out: Vec<SessionInfo> = sessions
            .iter()
            .map(|(source, session)| {
                let mut targets: Vec<PathBuf> = session.workers.keys().cloned().collect();
                targets.sort();
                SessionInfo {
                    source: source.clone(),
                    targets,
                    pending_scans: session.pending_scans,
                    watching: session.watcher.is_some(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.source.cmp(&b.source));
        out
    }

    /// Stop every session; returns once no scan, watcher, or apply task of
    /// any session is left running.
    pub async fn stop_all(&self) {
        let sessions: Vec<(PathBuf, Session)> = {
            let mut map = self.sessions.lock().unwrap();
            map.drain().collect()
        };
        // Close every queue first so the drains overlap.
        for (_, session) in &sessions {
            session.scan_cancel.cancel();
            for worker in session.workers.values() {
                worker.complete();
            }
        }
        for (source, session) in sessions {
            teardown_session(&source, session).await;
        }
    }

    /// Tear down the session for `source`: cancel in-flight scans, dispose
    /// the watcher, drain and stop every worker. No-op without a session.
    pub(crate) async fn stop_session(&self, source: &Path) {
        let session = self.sessions.lock().unwrap().remove(source);
        let Some(session) = session else { return };
        session.scan_cancel.cancel();
        for worker in session.workers.values() {
            worker.complete();
        }
        teardown_session(source, session).await;
    }

    /// Worker list of a session, snapshotted under the lock for broadcasting
    /// outside it.
    pub(crate) fn snapshot_workers(&self, source: &Path) -> Vec<Arc<TargetWorker>> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(source)
            .map(|s| s.workers.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn scan_finished(self: &Arc<Self>, source: &Path, target: &Path, result: Result<()>) {
        let mut failed_worker = None;
        let mut emptied = None;
        let mut arm = false;
        {
            let mut sessions = self.sessions.lock().unwrap();
            let Some(session) = sessions.get_mut(source) else {
                // Session ended while the scan ran; nothing left to update.
                return;
            };
            session.pending_scans = session.pending_scans.saturating_sub(1);
            if result.is_err() {
                failed_worker = session.workers.remove(target);
                if session.workers.is_empty() {
                    if let Some(session) = sessions.remove(source) {
                        emptied = Some((session.watcher, session.scan_cancel));
                    }
                }
            }
            if let Some(session) = sessions.get(source) {
                arm = session.pending_scans == 0
                    && !session.workers.is_empty()
                    && session.watcher.is_none();
            }
        }

        match result {
            Ok(()) => info!("initial sync into {} complete", target.display()),
            Err(e) => error!("initial sync into {} failed: {e:#}", target.display()),
        }
        if let Some(worker) = failed_worker {
            worker.stop().await;
        }
        if let Some((watcher, scan_cancel)) = emptied {
            scan_cancel.cancel();
            if let Some(watcher) = watcher {
                watcher.dispose().await;
            }
        }
        if arm {
            self.arm_watcher(source).await;
        }
    }

    /// Build the notify watcher outside the lock, then install it if the
    /// session still qualifies; a session stopped in the meantime gets the
    /// fresh watcher disposed instead.
    async fn arm_watcher(self: &Arc<Self>, source: &Path) {
        let watcher = match SourceWatcher::arm(source.to_path_buf(), Arc::downgrade(self)) {
            Ok(watcher) => watcher,
            Err(e) => {
                error!("cannot watch {}: {e:#}", source.display());
                return;
            }
        };
        let stale = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get_mut(source) {
                Some(session)
                    if session.pending_scans == 0
                        && !session.workers.is_empty()
                        && session.watcher.is_none() =>
                {
                    session.watcher = Some(watcher);
                    info!("watching {}", source.display());
                    None
                }
                _ => Some(watcher),
            }
        };
        if let Some(watcher) = stale {
            watcher.dispose().await;
        }
    }
}

/// Finish an operator-driven stop: scans cancelled and queues closed by the
/// caller, this waits the machinery out. Never runs inside a scan task.
async fn teardown_session(source: &Path, session: Session) {
    for task in session.scan_tasks {
        let _ = task.await;
    }
    if let Some(watcher) = session.watcher {
        watcher.dispose().await;
    }
    for worker in session.workers.values() {
        worker.stop().await;
    }
    info!("stopped session for {}", source.display());
}

/// A target must be an empty directory; missing ones are created.
async fn prepare_target(target: &Path) -> Result<()> {
    match tokio::fs::symlink_metadata(target).await {
        Ok(meta) if meta.is_dir() => {
            let mut entries = tokio::fs::read_dir(target)
                .await
                .with_context(|| format!("read {}", target.display()))?;
            if entries.next_entry().await?.is_some() {
                bail!("{} is not empty", target.display());
            }
            Ok(())
        }
        Ok(_) => bail!("{} is not a directory", target.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => tokio::fs::create_dir_all(target)
            .await
            .with_context(|| format!("create {}", target.display())),
        Err(e) => Err(e).with_context(|| format!("stat {}", target.display())),
    }
}
