//! Manager-level mirroring: initial sync, registration guards, live
//! propagation, detachment, and shutdown.

mod common;

use std::path::PathBuf;
use std::time::Duration;

use dmirror_core::{ChangeEvent, SyncManager, SyncOptions, TargetWorker};
use filetime::FileTime;

#[tokio::test]
async fn initial_sync_mirrors_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    let target = tmp.path().join("target");
    common::write(&source.join("a.txt"), "hello");
    common::write(&source.join("sub/b.txt"), "world");
    filetime::set_file_mtime(source.join("a.txt"), FileTime::from_unix_time(1_000_000_000, 0))
        .unwrap();

    let manager = SyncManager::new(SyncOptions::default());
    manager.add(&source, &[target.clone()]).await.unwrap();

    common::wait_until("both files mirrored", || {
        common::file_equals(&source.join("a.txt"), &target.join("a.txt"))
            && common::file_equals(&source.join("sub/b.txt"), &target.join("sub/b.txt"))
    })
    .await;
    assert_eq!(common::read(&target.join("a.txt")), "hello");
    assert_eq!(
        common::mtime(&target.join("a.txt")),
        FileTime::from_unix_time(1_000_000_000, 0)
    );
    manager.stop_all().await;
}

#[tokio::test]
async fn add_rejects_target_inside_source() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    std::fs::create_dir_all(&source).unwrap();

    let manager = SyncManager::new(SyncOptions::default());
    assert!(manager
        .add(&source, &[source.join("inner")])
        .await
        .is_err());
    assert!(manager.add(&source, &[source.clone()]).await.is_err());
    assert!(manager.list().is_empty());
}

#[tokio::test]
async fn add_skips_nonempty_target() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    let target = tmp.path().join("target");
    common::write(&source.join("a.txt"), "hello");
    common::write(&target.join("junk.txt"), "keep me");

    let manager = SyncManager::new(SyncOptions::default());
    manager.add(&source, &[target.clone()]).await.unwrap();

    // No worker was created, and the junk survived.
    assert!(manager.list().is_empty());
    assert_eq!(common::read(&target.join("junk.txt")), "keep me");
    assert!(!target.join("a.txt").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn symlink_targets_rewritten_into_target_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    let target = tmp.path().join("target");
    let outside = tmp.path().join("outside.txt");
    common::write(&source.join("data.txt"), "payload");
    common::write(&outside, "elsewhere");
    std::os::unix::fs::symlink(source.join("data.txt"), source.join("link_abs")).unwrap();
    std::os::unix::fs::symlink(&outside, source.join("link_out")).unwrap();
    std::os::unix::fs::symlink("data.txt", source.join("link_rel")).unwrap();

    let manager = SyncManager::new(SyncOptions::default());
    manager.add(&source, &[target.clone()]).await.unwrap();

    common::wait_until("links mirrored", || {
        target.join("link_abs").is_symlink()
            && target.join("link_out").is_symlink()
            && target.join("link_rel").is_symlink()
    })
    .await;
    // Absolute link inside the source points into the target tree now.
    assert_eq!(
        std::fs::read_link(target.join("link_abs")).unwrap(),
        target.join("data.txt")
    );
    // Out-of-tree and relative literals are preserved verbatim.
    assert_eq!(std::fs::read_link(target.join("link_out")).unwrap(), outside);
    assert_eq!(
        std::fs::read_link(target.join("link_rel")).unwrap(),
        PathBuf::from("data.txt")
    );
    manager.stop_all().await;
}

#[tokio::test]
async fn live_create_modify_and_rename_propagate() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    let target = tmp.path().join("target");
    common::write(&source.join("seed.txt"), "seed");

    let manager = SyncManager::new(SyncOptions::default());
    manager.add(&source, &[target.clone()]).await.unwrap();
    common::wait_until("watcher armed", || {
        manager.list().first().map(|s| s.watching).unwrap_or(false)
    })
    .await;

    common::write(&source.join("dir/x"), "first");
    common::wait_until("create propagated", || {
        common::file_equals(&source.join("dir/x"), &target.join("dir/x"))
    })
    .await;

    common::write(&source.join("dir/x"), "second");
    common::wait_until("modify propagated", || {
        std::fs::read(target.join("dir/x")).ok() == Some(b"second".to_vec())
    })
    .await;

    std::fs::rename(source.join("dir/x"), source.join("dir/y")).unwrap();
    common::wait_until("rename propagated", || {
        target.join("dir/y").exists() && !target.join("dir/x").exists()
    })
    .await;
    manager.stop_all().await;
}

#[tokio::test]
async fn end_detaches_single_target() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    let t1 = tmp.path().join("t1");
    let t2 = tmp.path().join("t2");
    common::write(&source.join("a.txt"), "hello");

    let manager = SyncManager::new(SyncOptions::default());
    manager.add(&source, &[t1.clone(), t2.clone()]).await.unwrap();
    common::wait_until("both targets seeded and watched", || {
        t1.join("a.txt").exists()
            && t2.join("a.txt").exists()
            && manager.list().first().map(|s| s.watching).unwrap_or(false)
    })
    .await;

    manager.end(&source, &[t1.clone()]).await.unwrap();
    let sessions = manager.list();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].targets, vec![t2.clone()]);
    assert!(sessions[0].watching);

    common::write(&source.join("late.txt"), "late");
    common::wait_until("change reaches the remaining target", || {
        t2.join("late.txt").exists()
    })
    .await;
    assert!(!t1.join("late.txt").exists());
    manager.stop_all().await;
}

#[tokio::test]
async fn stop_all_quiesces() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    let target = tmp.path().join("target");
    common::write(&source.join("a.txt"), "hello");

    let manager = SyncManager::new(SyncOptions::default());
    manager.add(&source, &[target.clone()]).await.unwrap();
    common::wait_until("seeded", || target.join("a.txt").exists()).await;

    manager.stop_all().await;
    assert!(manager.list().is_empty());

    common::write(&source.join("after.txt"), "ignored");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!target.join("after.txt").exists());
}

#[tokio::test]
async fn worker_replays_are_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    common::write(&source.join("f.txt"), "contents");
    common::write(&source.join("g.txt"), "gone soon");

    let events = vec![
        ChangeEvent::EnsureDir(PathBuf::from("d")),
        ChangeEvent::CopyFile(PathBuf::from("d/f.txt"), source.join("f.txt")),
        ChangeEvent::CopyFile(PathBuf::from("g.txt"), source.join("g.txt")),
        ChangeEvent::DeleteFile(PathBuf::from("g.txt")),
        ChangeEvent::EnsureDir(PathBuf::from("e")),
    ];

    // Full stream alone.
    let plain = tmp.path().join("plain");
    std::fs::create_dir_all(&plain).unwrap();
    let worker = TargetWorker::spawn(source.clone(), plain.clone(), &SyncOptions::default());
    for event in &events {
        worker.push(event.clone()).await.unwrap();
    }
    worker.stop().await;

    // A replayed prefix, then the full stream.
    let replayed = tmp.path().join("replayed");
    std::fs::create_dir_all(&replayed).unwrap();
    let worker = TargetWorker::spawn(source.clone(), replayed.clone(), &SyncOptions::default());
    for event in events.iter().take(3).chain(events.iter()) {
        worker.push(event.clone()).await.unwrap();
    }
    worker.stop().await;

    assert_eq!(common::tree_snapshot(&plain), common::tree_snapshot(&replayed));
    assert!(worker.push(events[0].clone()).await.is_err());
}
