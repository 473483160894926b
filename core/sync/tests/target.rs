//! End-to-end behavior of a sync target over an in-memory server.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use remotesync_common::{Error, RemotePath, Result};
use remotesync_remote::{MemoryServer, RemoteClient};
use remotesync_sync::{
    AdmissionConfig, AdmissionController, ChangeEvent, ChangeKind, ClientFactory, ConnectionHealth,
    SyncEvent, SyncTarget, TargetConfig,
};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

fn factory(server: &MemoryServer) -> ClientFactory {
    let server = server.clone();
    Arc::new(move || -> Result<Arc<dyn RemoteClient>> { Ok(Arc::new(server.client())) })
}

fn config(root: &Path) -> TargetConfig {
    let mut config = TargetConfig::new("site", root, "/www", "memory");
    config.watch = false;
    config.debounce_ms = 50;
    config
}

fn build(config: TargetConfig, server: &MemoryServer, admission: Arc<AdmissionController>) -> SyncTarget {
    SyncTarget::with_factory(config, factory(server), admission).unwrap()
}

fn remote(path: &str) -> RemotePath {
    RemotePath::parse(path).unwrap()
}

/// Canonical root so paths match what the target and the watcher report.
fn root(temp: &TempDir) -> PathBuf {
    temp.path().canonicalize().unwrap()
}

async fn next_matching<F>(rx: &mut broadcast::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("no matching event within 10s")
}

#[tokio::test]
async fn test_burst_of_saves_uploads_once() {
    let temp = TempDir::new().unwrap();
    let root = root(&temp);
    let server = MemoryServer::new();
    let target = build(config(&root), &server, Arc::new(AdmissionController::default()));
    let mut events = target.subscribe();

    let file = root.join("index.html");
    std::fs::write(&file, b"<h1>v10</h1>").unwrap();
    target
        .coalescer()
        .handle_event(ChangeEvent::new(file.clone(), ChangeKind::Created));
    for _ in 0..9 {
        target
            .coalescer()
            .handle_event(ChangeEvent::new(file.clone(), ChangeKind::Changed));
    }

    next_matching(&mut events, |e| matches!(e, SyncEvent::Uploaded { .. })).await;
    sleep(Duration::from_millis(200)).await;

    let stats = target.stats();
    assert_eq!(stats.uploads_succeeded, 1);
    assert_eq!(stats.queue_length, 0);
    assert!(stats.connected);
    assert_eq!(server.read_file(&remote("/www/index.html")).unwrap(), b"<h1>v10</h1>");
    target.stop().await;
}

#[tokio::test]
async fn test_manual_upload_suppresses_its_own_change() {
    let temp = TempDir::new().unwrap();
    let root = root(&temp);
    let server = MemoryServer::new();
    let target = build(config(&root), &server, Arc::new(AdmissionController::default()));

    let file = root.join("app.js");
    std::fs::write(&file, b"console.log(1)").unwrap();
    target.upload_file(&file).await.unwrap();
    target
        .coalescer()
        .handle_event(ChangeEvent::new(file.clone(), ChangeKind::Changed));

    sleep(Duration::from_millis(300)).await;
    assert_eq!(target.coalescer().pending_kind(&file), None);
    assert_eq!(target.stats().uploads_succeeded, 1);

    // Past the release delay the path is watched again.
    sleep(Duration::from_millis(1000)).await;
    let mut events = target.subscribe();
    target
        .coalescer()
        .handle_event(ChangeEvent::new(file.clone(), ChangeKind::Changed));
    next_matching(&mut events, |e| matches!(e, SyncEvent::Uploaded { .. })).await;
    assert_eq!(target.stats().uploads_succeeded, 2);
    target.stop().await;
}

#[tokio::test]
async fn test_delete_event_removes_remote_file() {
    let temp = TempDir::new().unwrap();
    let root = root(&temp);
    let server = MemoryServer::new();
    server.put_file(&remote("/www/old.css"), b"body{}");
    let target = build(config(&root), &server, Arc::new(AdmissionController::default()));
    let mut events = target.subscribe();

    target
        .coalescer()
        .handle_event(ChangeEvent::new(root.join("old.css"), ChangeKind::Deleted));

    let event = next_matching(&mut events, |e| matches!(e, SyncEvent::Deleted { .. })).await;
    assert_eq!(
        event,
        SyncEvent::Deleted {
            remote_path: remote("/www/old.css")
        }
    );
    assert!(!server.contains(&remote("/www/old.css")));
    target.stop().await;
}

#[tokio::test]
async fn test_reconnects_after_transport_death() {
    let temp = TempDir::new().unwrap();
    let root = root(&temp);
    let server = MemoryServer::new();
    let target = build(config(&root), &server, Arc::new(AdmissionController::default()));
    let file = root.join("a.txt");
    std::fs::write(&file, b"a").unwrap();

    target.upload_file(&file).await.unwrap();
    assert_eq!(target.pool().health(), ConnectionHealth::Healthy);

    server.kill_sessions();
    assert_eq!(server.live_sessions(), 0);

    target.upload_file(&file).await.unwrap();
    assert_eq!(server.connects(), 2);
    assert_eq!(target.pool().health(), ConnectionHealth::Healthy);
    assert!(target.stats().connected);
    target.stop().await;
}

#[tokio::test]
async fn test_application_error_is_not_retried() {
    let temp = TempDir::new().unwrap();
    let root = root(&temp);
    let server = MemoryServer::new();
    let target = build(config(&root), &server, Arc::new(AdmissionController::default()));
    let mut events = target.subscribe();
    let file = root.join("locked.txt");
    std::fs::write(&file, b"x").unwrap();

    server.fail_operations(1, "550 Permission denied");
    let err = target.upload_file(&file).await.unwrap_err();
    assert!(matches!(err, Error::Remote(_)));
    assert_eq!(server.operations(), 1);

    let failed = next_matching(&mut events, |e| matches!(e, SyncEvent::Failed { .. })).await;
    assert!(matches!(failed, SyncEvent::Failed { error, .. } if error.contains("550")));
    assert_eq!(target.stats().uploads_failed, 1);
    target.stop().await;
}

#[tokio::test]
async fn test_slots_are_shared_across_targets() {
    let server = MemoryServer::new();
    let admission = Arc::new(AdmissionController::new(AdmissionConfig {
        max_slots: 1,
        slot_timeout: Duration::from_millis(500),
        ..AdmissionConfig::default()
    }));
    let temp_a = TempDir::new().unwrap();
    let temp_b = TempDir::new().unwrap();
    let (root_a, root_b) = (root(&temp_a), root(&temp_b));
    let a = build(config(&root_a), &server, admission.clone());
    let mut config_b = config(&root_b);
    config_b.name = "blog".to_string();
    let b = build(config_b, &server, admission.clone());

    std::fs::write(root_a.join("a.txt"), b"a").unwrap();
    std::fs::write(root_b.join("b.txt"), b"b").unwrap();

    a.upload_file(&root_a.join("a.txt")).await.unwrap();
    assert_eq!(admission.held_slots(), 1);

    let err = b.upload_file(&root_b.join("b.txt")).await.unwrap_err();
    assert!(matches!(err, Error::SlotTimeout(_)));

    a.stop().await;
    assert_eq!(admission.held_slots(), 0);
    b.upload_file(&root_b.join("b.txt")).await.unwrap();
    assert_eq!(admission.held_slots(), 1);
    b.stop().await;
    assert_eq!(admission.held_slots(), 0);
}

#[tokio::test]
async fn test_stop_clears_queued_work() {
    let temp = TempDir::new().unwrap();
    let root = root(&temp);
    let server = MemoryServer::new();
    let target = build(config(&root), &server, Arc::new(AdmissionController::default()));
    target.pause();

    for name in ["a.txt", "b.txt", "c.txt"] {
        let path = root.join(name);
        std::fs::write(&path, name).unwrap();
        target
            .coalescer()
            .handle_event(ChangeEvent::new(path, ChangeKind::Created));
    }
    sleep(Duration::from_millis(300)).await;
    assert_eq!(target.stats().queue_length, 3);

    target.stop().await;
    target.stop().await;
    sleep(Duration::from_millis(50)).await;

    let stats = target.stats();
    assert_eq!(stats.queue_length, 0);
    assert_eq!(stats.uploads_succeeded + stats.uploads_failed, 0);
    assert_eq!(target.coalescer().in_flight_count(), 0);
    assert_eq!(server.connects(), 0);
}

#[tokio::test]
async fn test_stop_abandons_upload_waiting_to_retry() {
    let temp = TempDir::new().unwrap();
    let root = root(&temp);
    let server = MemoryServer::new();
    let admission = Arc::new(AdmissionController::default());
    let target = build(config(&root), &server, admission.clone());
    let file = root.join("flaky.txt");
    std::fs::write(&file, b"retry me").unwrap();

    // Every attempt of the first round fails, so the queue schedules a retry.
    server.fail_operations(3, "read ECONNRESET");
    target
        .coalescer()
        .handle_event(ChangeEvent::new(file.clone(), ChangeKind::Changed));

    timeout(Duration::from_secs(10), async {
        loop {
            let status = target.queue().status();
            if server.operations() >= 3 && status.active == 0 && status.pending == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("upload never reached its retry delay");
    assert_eq!(target.stats().queue_length, 1);

    target.stop().await;
    assert_eq!(admission.held_slots(), 0);
    assert_eq!(server.live_sessions(), 0);

    // Well past the queue's retry delay.
    sleep(Duration::from_secs(3)).await;
    let stats = target.stats();
    assert_eq!(stats.queue_length, 0);
    assert_eq!(stats.uploads_succeeded + stats.uploads_failed, 0);
    assert_eq!(server.operations(), 3);
    assert!(!server.contains(&remote("/www/flaky.txt")));
    assert_eq!(admission.held_slots(), 0);
    assert_eq!(server.live_sessions(), 0);
}

#[tokio::test]
async fn test_folder_roundtrip() {
    let temp = TempDir::new().unwrap();
    let root = root(&temp);
    std::fs::create_dir_all(root.join("img")).unwrap();
    std::fs::write(root.join("index.html"), b"<html>").unwrap();
    std::fs::write(root.join("img/logo.svg"), b"<svg/>").unwrap();
    let server = MemoryServer::new();
    let target = build(config(&root), &server, Arc::new(AdmissionController::default()));

    let up = target.upload_folder(&root).await.unwrap();
    assert_eq!(up.files, 2);
    assert!(server.is_dir(&remote("/www/img")));

    let restore = root.join("restore");
    let down = target
        .download_folder(&remote("/www/img"), &restore)
        .await
        .unwrap();
    assert_eq!(down.files, 1);
    assert_eq!(std::fs::read(restore.join("logo.svg")).unwrap(), b"<svg/>");
    assert_eq!(target.stats().downloads_succeeded, 1);
    target.stop().await;
}

#[tokio::test]
async fn test_watcher_drives_uploads() {
    let temp = TempDir::new().unwrap();
    let root = root(&temp);
    let server = MemoryServer::new();
    let mut config = config(&root);
    config.watch = true;
    let target = build(config, &server, Arc::new(AdmissionController::default()));
    let mut events = target.subscribe();
    target.start().unwrap();
    target.start().unwrap();
    assert!(target.is_running());

    std::fs::write(root.join("notes.md"), b"# notes").unwrap();
    next_matching(&mut events, |e| {
        matches!(e, SyncEvent::Uploaded { remote_path, .. } if remote_path.to_string() == "/www/notes.md")
    })
    .await;
    assert_eq!(server.read_file(&remote("/www/notes.md")).unwrap(), b"# notes");

    target.stop().await;
    assert!(!target.is_running());
    assert_eq!(target.pool().health(), ConnectionHealth::Disconnected);
}
