//! Per-target apply pipeline: a bounded event queue drained by one task.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::SyncOptions;
use crate::event::ChangeEvent;
use crate::fsops;

/// Consumer of one target's change events.
///
/// Events are applied strictly in enqueue order. An I/O failure while
/// applying one event is logged and the loop moves on; closing the queue is
/// the only termination signal.
pub struct TargetWorker {
    source_root: PathBuf,
    target_root: PathBuf,
    tx: mpsc::Sender<ChangeEvent>,
    closed: CancellationToken,
    copy_limiter: Semaphore,
    apply_task: Mutex<Option<JoinHandle<()>>>,
}

impl TargetWorker {
    /// Opens the queue and starts the apply task.
    pub fn spawn(source_root: PathBuf, target_root: PathBuf, options: &SyncOptions) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let worker = Arc::new(Self {
            source_root,
            target_root,
            tx,
            closed: CancellationToken::new(),
            copy_limiter: Semaphore::new(options.copy_permits.max(1)),
            apply_task: Mutex::new(None),
        });
        let task = tokio::spawn({
            let worker = worker.clone();
            async move { worker.apply_loop(rx).await }
        });
        *worker.apply_task.lock().unwrap() = Some(task);
        worker
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn target_root(&self) -> &Path {
        &self.target_root
    }

    /// Enqueue one event, waiting while the queue is full. Fails once the
    /// queue has been closed.
    pub async fn push(&self, event: ChangeEvent) -> Result<()> {
        let stopped = || anyhow!("worker for {} is stopped", self.target_root.display());
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(stopped()),
            sent = self.tx.send(event) => sent.map_err(|_| stopped()),
        }
    }

    /// Close the queue. Further `push` calls fail; events already enqueued
    /// are still applied.
    pub fn complete(&self) {
        self.closed.cancel();
    }

    /// Close the queue and wait until every buffered event has been applied.
    pub async fn stop(&self) {
        self.complete();
        let task = self.apply_task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("apply task for {} aborted: {e}", self.target_root.display());
            }
        }
    }

    async fn apply_loop(self: Arc<Self>, mut rx: mpsc::Receiver<ChangeEvent>) {
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => {
                    rx.close();
                    break;
                }
                event = rx.recv() => match event {
                    Some(event) => self.apply(event).await,
                    None => return,
                },
            }
        }
        // Drain what was buffered before the close.
        while let Some(event) = rx.recv().await {
            self.apply(event).await;
        }
    }

    async fn apply(&self, event: ChangeEvent) {
        debug!("apply {:?} in {}", event, self.target_root.display());
        let applied = match event {
            ChangeEvent::EnsureDir(rel) => self.ensure_dir(&rel).await,
            ChangeEvent::CopyFile(rel, src) => self.copy_file(&rel, &src).await,
            ChangeEvent::DeleteFile(rel) | ChangeEvent::DeleteDir(rel) => {
                fsops::remove_any(&self.target_root.join(rel)).await
            }
            ChangeEvent::CreateSymlink {
                rel,
                target,
                dir_link,
            } => self.create_symlink(&rel, &target, dir_link).await,
        };
        if let Err(e) = applied {
            error!("apply failed in {}: {e:#}", self.target_root.display());
        }
    }

    async fn ensure_dir(&self, rel: &Path) -> Result<()> {
        let dst = self.target_root.join(rel);
        match tokio::fs::symlink_metadata(&dst).await {
            Ok(meta) if meta.is_dir() => return Ok(()),
            Ok(_) => fsops::remove_any(&dst).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("stat {}", dst.display())),
        }
        tokio::fs::create_dir_all(&dst)
            .await
            .with_context(|| format!("create {}", dst.display()))
    }

    async fn copy_file(&self, rel: &Path, src: &Path) -> Result<()> {
        let dst = self.target_root.join(rel);
        fsops::ensure_parent(&dst).await?;
        fsops::remove_any(&dst).await?;
        let _permit = self
            .copy_limiter
            .acquire()
            .await
            .context("copy limiter closed")?;
        fsops::copy_contents(src, &dst).await?;
        let src_meta = tokio::fs::metadata(src)
            .await
            .with_context(|| format!("stat {}", src.display()))?;
        fsops::copy_mtime(&src_meta, &dst)
    }

    async fn create_symlink(&self, rel: &Path, link_target: &Path, dir_link: bool) -> Result<()> {
        let dst = self.target_root.join(rel);
        fsops::ensure_parent(&dst).await?;
        fsops::remove_any(&dst).await?;
        fsops::make_symlink(link_target, &dst, dir_link).await
    }
}
