//! One local tree kept in sync with one remote directory.
//!
//! A [`SyncTarget`] wires the pieces together: watcher events feed the
//! [`ChangeCoalescer`], coalesced changes go through the [`OperationQueue`],
//! and every remote call runs on the target's [`ConnectionPool`].

use async_trait::async_trait;
use notify::RecommendedWatcher;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionController;
use crate::coalescer::{ChangeCoalescer, ChangeSink};
use crate::config::TargetConfig;
use crate::ignore::IgnorePredicate;
use crate::pool::{ClientFactory, ConnectionPool};
use crate::queue::{EnqueueOptions, OperationQueue};
use crate::state::{StatsRecorder, SyncEvent, SyncStats, TransferKind};
use crate::watcher::{start_watcher, ChangeKind};
use remotesync_common::{Error, RemotePath, Result, TargetId};
use remotesync_remote::{ClientRegistry, EntryType, RemoteClient, RemoteEntry};

/// Outcome of a folder transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSummary {
    /// Files transferred.
    pub files: usize,
    /// Directories created.
    pub directories: usize,
    /// Entries left out by the ignore predicate.
    pub skipped: usize,
    /// Files that failed, with their error.
    pub failed: Vec<(String, String)>,
}

impl FolderSummary {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Remote work shared by the facade and the queued change handler.
struct Transfers {
    id: TargetId,
    local_root: PathBuf,
    remote_root: RemotePath,
    delete_remote: bool,
    pool: Arc<ConnectionPool>,
    stats: Arc<StatsRecorder>,
}

impl Transfers {
    fn remote_for(&self, local: &Path) -> Result<RemotePath> {
        RemotePath::from_local(&self.local_root, &self.remote_root, local)
    }

    async fn upload(&self, local: &Path) -> Result<RemotePath> {
        let remote = self.remote_for(local)?;
        let label = format!("upload {}", remote);
        self.pool
            .execute_with_retry(&label, |client| {
                let local = local.to_path_buf();
                let remote = remote.clone();
                async move { client.upload_file(&local, &remote).await.into_result() }
            })
            .await?;
        Ok(remote)
    }

    async fn ensure_remote_dir(&self, remote: &RemotePath) -> Result<()> {
        let label = format!("mkdir {}", remote);
        self.pool
            .execute_with_retry(&label, |client| {
                let remote = remote.clone();
                async move { client.ensure_directory(&remote).await }
            })
            .await
    }

    async fn download(&self, remote: &RemotePath, local: &Path) -> Result<()> {
        let label = format!("download {}", remote);
        self.pool
            .execute_with_retry(&label, |client| {
                let local = local.to_path_buf();
                let remote = remote.clone();
                async move { client.download_file(&remote, &local).await.into_result() }
            })
            .await
            .map(|_| ())
    }

    async fn list(&self, remote: &RemotePath) -> Result<Vec<RemoteEntry>> {
        let label = format!("list {}", remote);
        self.pool
            .execute_with_retry(&label, |client| {
                let remote = remote.clone();
                async move { client.list_directory(&remote).await }
            })
            .await
    }

    /// Delete the remote counterpart of `local`, falling back to a
    /// directory delete when the file delete is refused.
    async fn delete(&self, local: &Path) -> Result<RemotePath> {
        let remote = self.remote_for(local)?;
        if remote.is_root() {
            return Err(Error::InvalidInput("Refusing to delete the remote root".to_string()));
        }
        let label = format!("delete {}", remote);
        self.pool
            .execute_with_retry(&label, |client| {
                let remote = remote.clone();
                async move { delete_file_or_directory(client, &remote).await }
            })
            .await?;
        Ok(remote)
    }

    /// Apply one coalesced change. Runs inside the queue.
    async fn apply(&self, path: &Path, kind: ChangeKind) -> Result<()> {
        match kind {
            ChangeKind::Deleted => {
                if !self.delete_remote {
                    debug!(target_id = %self.id, path = %path.display(), "Remote delete disabled, skipping");
                    return Ok(());
                }
                self.delete(path).await.map(|_| ())
            }
            ChangeKind::Created | ChangeKind::Changed => {
                match tokio::fs::metadata(path).await {
                    Ok(meta) if meta.is_dir() => self.ensure_remote_dir(&self.remote_for(path)?).await,
                    Ok(_) => self.upload(path).await.map(|_| ()),
                    // Gone again before the upload ran. A delete event follows.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn record(&self, kind: TransferKind, local: &Path, outcome: std::result::Result<&RemotePath, &Error>) {
        let event = match outcome {
            Ok(remote) => match kind {
                TransferKind::Upload => SyncEvent::Uploaded {
                    local_path: local.to_path_buf(),
                    remote_path: remote.clone(),
                },
                TransferKind::Download => SyncEvent::Downloaded {
                    remote_path: remote.clone(),
                    local_path: local.to_path_buf(),
                },
                TransferKind::Delete => SyncEvent::Deleted {
                    remote_path: remote.clone(),
                },
            },
            Err(e) => {
                error!(target_id = %self.id, path = %local.display(), %kind, "Transfer failed: {}", e);
                SyncEvent::Failed {
                    kind,
                    path: local.display().to_string(),
                    error: e.to_string(),
                }
            }
        };
        self.stats.record(event);
    }
}

async fn delete_file_or_directory(client: Arc<dyn RemoteClient>, remote: &RemotePath) -> Result<()> {
    match client.delete_file(remote).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_connection_error() => Err(e),
        Err(file_err) => match client.delete_directory(remote).await {
            Ok(()) => Ok(()),
            Err(dir_err) if dir_err.is_connection_error() => Err(dir_err),
            Err(_) => Err(file_err),
        },
    }
}

/// Coalesced changes become queued transfers.
struct QueueSink {
    queue: Arc<OperationQueue>,
    transfers: Arc<Transfers>,
}

#[async_trait]
impl ChangeSink for QueueSink {
    async fn submit(&self, path: PathBuf, kind: ChangeKind, priority: i32) -> Result<()> {
        let label = format!("{} {}", kind, path.display());
        let transfers = self.transfers.clone();
        let work_path = path.clone();
        let handle = self.queue.enqueue(label, EnqueueOptions::priority(priority), move || {
            let transfers = transfers.clone();
            let path = work_path.clone();
            async move { transfers.apply(&path, kind).await }
        })?;
        let outcome = handle.wait().await;

        let transfer = match kind {
            ChangeKind::Deleted if !self.transfers.delete_remote => return outcome,
            ChangeKind::Deleted => TransferKind::Delete,
            ChangeKind::Created | ChangeKind::Changed => TransferKind::Upload,
        };
        match &outcome {
            // Abandoned by `stop`, not failed.
            Err(Error::QueueCleared | Error::Disposed(_)) => {}
            Ok(()) => {
                if let Ok(remote) = self.transfers.remote_for(&path) {
                    self.transfers.record(transfer, &path, Ok(&remote));
                }
            }
            Err(e) => self.transfers.record(transfer, &path, Err(e)),
        }
        outcome
    }
}

#[derive(Default)]
struct Running {
    watcher: Option<RecommendedWatcher>,
    tasks: Vec<JoinHandle<()>>,
}

type BoxedWalk<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A running sync between a local root and a remote root.
pub struct SyncTarget {
    config: TargetConfig,
    transfers: Arc<Transfers>,
    queue: Arc<OperationQueue>,
    coalescer: ChangeCoalescer,
    ignore: Arc<dyn IgnorePredicate>,
    running: Mutex<Running>,
}

impl SyncTarget {
    /// Build a target whose clients come from `registry`.
    ///
    /// Must be called inside a Tokio runtime. Nothing connects until the
    /// first remote operation.
    ///
    /// # Errors
    /// - `InvalidInput` for an invalid config
    /// - `NotFound` when the protocol is not registered
    pub fn new(
        config: TargetConfig,
        registry: Arc<ClientRegistry>,
        admission: Arc<AdmissionController>,
    ) -> Result<Self> {
        if !registry.has_protocol(&config.protocol) {
            return Err(Error::NotFound(format!(
                "Protocol '{}' is not available (known: {})",
                config.protocol,
                registry.protocols().join(", ")
            )));
        }
        let protocol = config.protocol.clone();
        let settings = config.connection.clone();
        let factory: ClientFactory = Arc::new(move || registry.resolve(&protocol, &settings));
        Self::with_factory(config, factory, admission)
    }

    /// Build a target over an explicit client factory.
    pub fn with_factory(
        config: TargetConfig,
        factory: ClientFactory,
        admission: Arc<AdmissionController>,
    ) -> Result<Self> {
        config.validate()?;
        let id = TargetId::new(config.name.clone())?;
        let remote_root = config.remote_root()?;
        let local_root = std::fs::canonicalize(&config.local_root)
            .unwrap_or_else(|_| config.local_root.clone());
        let ignore: Arc<dyn IgnorePredicate> = Arc::new(config.ignore_predicate()?);

        let pool = ConnectionPool::new(
            id.clone(),
            remote_root.clone(),
            config.pool_config(),
            factory,
            admission,
        );
        let queue = Arc::new(OperationQueue::new(config.queue_config()));
        let transfers = Arc::new(Transfers {
            id,
            local_root: local_root.clone(),
            remote_root,
            delete_remote: config.delete_remote,
            pool,
            stats: Arc::new(StatsRecorder::new()),
        });
        let sink = Arc::new(QueueSink {
            queue: queue.clone(),
            transfers: transfers.clone(),
        });
        let coalescer = ChangeCoalescer::new(local_root, config.coalescer_config(), ignore.clone(), sink);

        Ok(Self {
            config,
            transfers,
            queue,
            coalescer,
            ignore,
            running: Mutex::new(Running::default()),
        })
    }

    fn running(&self) -> MutexGuard<'_, Running> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn id(&self) -> &TargetId {
        &self.transfers.id
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// Canonical local root.
    pub fn local_root(&self) -> &Path {
        &self.transfers.local_root
    }

    pub fn remote_root(&self) -> &RemotePath {
        &self.transfers.remote_root
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.transfers.pool
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn coalescer(&self) -> &ChangeCoalescer {
        &self.coalescer
    }

    pub fn is_running(&self) -> bool {
        !self.running().tasks.is_empty()
    }

    /// Forward health changes and, when configured, start watching the
    /// local root. Reopens a pool closed by [`stop`](Self::stop). Calling it
    /// again while running does nothing.
    ///
    /// # Errors
    /// - Whatever the platform watcher reports for the local root
    pub fn start(&self) -> Result<()> {
        let mut running = self.running();
        if !running.tasks.is_empty() {
            return Ok(());
        }
        self.transfers.pool.reopen();

        let mut tasks = Vec::new();
        if self.config.watch {
            let (watcher, mut events) = start_watcher(&self.transfers.local_root)?;
            let coalescer = self.coalescer.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    coalescer.handle_event(event);
                }
            }));
            running.watcher = Some(watcher);
        }

        let mut health = self.transfers.pool.subscribe_health();
        let stats = self.transfers.stats.clone();
        tasks.push(tokio::spawn(async move {
            while health.changed().await.is_ok() {
                let current = *health.borrow_and_update();
                stats.record(SyncEvent::HealthChanged { health: current });
            }
        }));
        running.tasks = tasks;

        info!(
            target_id = %self.transfers.id,
            local = %self.transfers.local_root.display(),
            remote = %self.transfers.remote_root,
            watch = self.config.watch,
            "Sync target started"
        );
        Ok(())
    }

    /// Stop watching, drop pending changes and queued work, disconnect.
    ///
    /// Work waiting in the queue or sitting out a retry delay is rejected
    /// with `QueueCleared`. A transfer attempt already talking to the server
    /// finishes or times out before the connection closes; a transfer
    /// waiting on a reconnect ends with `Disposed`. Afterwards the target
    /// holds no slot and refuses transfers until [`start`](Self::start).
    /// Idempotent.
    pub async fn stop(&self) {
        let (watcher, tasks) = {
            let mut running = self.running();
            (running.watcher.take(), std::mem::take(&mut running.tasks))
        };
        drop(watcher);
        for task in tasks {
            task.abort();
        }
        let cancelled = self.coalescer.cancel_pending();
        let cleared = self.queue.clear();
        self.transfers.pool.dispose().await;
        info!(target_id = %self.transfers.id, cancelled, cleared, "Sync target stopped");
    }

    /// Upload one local file right away, muting its change events.
    ///
    /// # Errors
    /// - `InvalidInput` when `local` is outside the local root
    /// - The transfer error once retries are spent
    pub async fn upload_file(&self, local: &Path) -> Result<RemotePath> {
        let local = self.absolute(local);
        let outcome = self
            .coalescer
            .run_manual(&local, self.transfers.upload(&local))
            .await;
        self.transfers.record(TransferKind::Upload, &local, outcome.as_ref());
        outcome
    }

    /// Download `remote` to `local`, muting change events for `local`.
    pub async fn download_file(&self, remote: &RemotePath, local: &Path) -> Result<()> {
        let local = self.absolute(local);
        let outcome = self
            .coalescer
            .run_manual(&local, self.transfers.download(remote, &local))
            .await
            .map(|_| remote.clone());
        self.transfers.record(TransferKind::Download, &local, outcome.as_ref());
        outcome.map(|_| ())
    }

    /// Delete the remote counterpart of `local`.
    ///
    /// Returns `None` when remote deletes are disabled for this target.
    pub async fn delete_remote(&self, local: &Path) -> Result<Option<RemotePath>> {
        if !self.config.delete_remote {
            debug!(target_id = %self.transfers.id, path = %local.display(), "Remote delete disabled");
            return Ok(None);
        }
        let local = self.absolute(local);
        let outcome = self.transfers.delete(&local).await;
        self.transfers.record(TransferKind::Delete, &local, outcome.as_ref());
        outcome.map(Some)
    }

    /// Upload everything under `local_dir`, creating remote directories.
    ///
    /// A failed file is recorded and the walk goes on. Errors that end the
    /// pool's usefulness stop the walk.
    pub async fn upload_folder(&self, local_dir: &Path) -> Result<FolderSummary> {
        let local_dir = self.absolute(local_dir);
        let mut summary = FolderSummary::default();
        self.transfers
            .ensure_remote_dir(&self.transfers.remote_for(&local_dir)?)
            .await?;
        summary.directories += 1;
        self.upload_tree(local_dir, &mut summary).await?;
        info!(
            target_id = %self.transfers.id,
            files = summary.files,
            failed = summary.failed.len(),
            "Folder upload finished"
        );
        Ok(summary)
    }

    fn upload_tree<'a>(&'a self, dir: PathBuf, summary: &'a mut FolderSummary) -> BoxedWalk<'a> {
        Box::pin(async move {
            let mut entries = Vec::new();
            let mut reader = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = reader.next_entry().await? {
                entries.push(entry.path());
            }
            entries.sort();

            for path in entries {
                if self.is_ignored(&path) {
                    summary.skipped += 1;
                    continue;
                }
                let meta = tokio::fs::symlink_metadata(&path).await?;
                if meta.is_dir() {
                    self.transfers
                        .ensure_remote_dir(&self.transfers.remote_for(&path)?)
                        .await?;
                    summary.directories += 1;
                    self.upload_tree(path, summary).await?;
                } else if meta.is_file() {
                    match self.upload_file(&path).await {
                        Ok(_) => summary.files += 1,
                        Err(e) if is_fatal(&e) => return Err(e),
                        Err(e) => summary.failed.push((path.display().to_string(), e.to_string())),
                    }
                } else {
                    summary.skipped += 1;
                }
            }
            Ok(())
        })
    }

    /// Download everything under `remote_dir` into `local_dir`.
    pub async fn download_folder(&self, remote_dir: &RemotePath, local_dir: &Path) -> Result<FolderSummary> {
        let local_dir = self.absolute(local_dir);
        let mut summary = FolderSummary::default();
        tokio::fs::create_dir_all(&local_dir).await?;
        summary.directories += 1;
        self.download_tree(remote_dir.clone(), local_dir, &mut summary).await?;
        info!(
            target_id = %self.transfers.id,
            files = summary.files,
            failed = summary.failed.len(),
            "Folder download finished"
        );
        Ok(summary)
    }

    fn download_tree<'a>(
        &'a self,
        remote_dir: RemotePath,
        local_dir: PathBuf,
        summary: &'a mut FolderSummary,
    ) -> BoxedWalk<'a> {
        Box::pin(async move {
            let mut entries = self.transfers.list(&remote_dir).await?;
            entries.sort_by(|a, b| a.name.cmp(&b.name));

            for entry in entries {
                let local = local_dir.join(&entry.name);
                if self.is_ignored(&local) {
                    summary.skipped += 1;
                    continue;
                }
                match entry.entry_type {
                    EntryType::Directory => {
                        tokio::fs::create_dir_all(&local).await?;
                        summary.directories += 1;
                        self.download_tree(entry.path, local, summary).await?;
                    }
                    EntryType::File => match self.download_file(&entry.path, &local).await {
                        Ok(()) => summary.files += 1,
                        Err(e) if is_fatal(&e) => return Err(e),
                        Err(e) => summary.failed.push((entry.path.to_string(), e.to_string())),
                    },
                    EntryType::Link => summary.skipped += 1,
                }
            }
            Ok(())
        })
    }

    /// Drop the connection and connect again with a fresh reconnect budget.
    pub async fn force_reconnect(&self) -> Result<()> {
        info!(target_id = %self.transfers.id, "Forcing reconnect");
        self.transfers.pool.force_reconnect().await
    }

    pub fn pause(&self) {
        self.queue.pause();
    }

    pub fn resume(&self) {
        self.queue.resume();
    }

    pub fn stats(&self) -> SyncStats {
        self.transfers
            .stats
            .snapshot(self.transfers.pool.is_connected(), self.queue.status().pending)
    }

    /// Transfer and health events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.transfers.stats.subscribe()
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            if path.starts_with(&self.transfers.local_root) {
                return path.to_path_buf();
            }
            // Watcher paths are canonical; make caller paths match.
            if let Ok(canonical) = std::fs::canonicalize(path) {
                return canonical;
            }
            if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
                if let Ok(parent) = std::fs::canonicalize(parent) {
                    return parent.join(name);
                }
            }
            path.to_path_buf()
        } else {
            self.transfers.local_root.join(path)
        }
    }

    fn is_ignored(&self, path: &Path) -> bool {
        match path.strip_prefix(&self.transfers.local_root) {
            Ok(relative) => self.ignore.is_ignored(relative),
            Err(_) => false,
        }
    }
}

impl Drop for SyncTarget {
    fn drop(&mut self) {
        let running = self.running.get_mut().unwrap_or_else(|p| p.into_inner());
        if running.watcher.take().is_some() {
            warn!(target_id = %self.transfers.id, "Sync target dropped without stop");
        }
        for task in running.tasks.drain(..) {
            task.abort();
        }
        self.coalescer.cancel_pending();
        self.queue.shutdown();
    }
}

/// Errors after which further transfers on the target cannot succeed.
fn is_fatal(err: &Error) -> bool {
    matches!(
        err,
        Error::MaxReconnectAttemptsExceeded(_) | Error::SlotTimeout(_) | Error::Disposed(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use remotesync_remote::MemoryServer;

    fn memory_factory(server: &MemoryServer) -> ClientFactory {
        let server = server.clone();
        Arc::new(move || -> Result<Arc<dyn RemoteClient>> { Ok(Arc::new(server.client())) })
    }

    fn target(root: &Path, server: &MemoryServer) -> SyncTarget {
        let mut config = TargetConfig::new("site", root, "/www", "memory");
        config.watch = false;
        config.ignore = vec!["*.tmp".to_string()];
        SyncTarget::with_factory(config, memory_factory(server), Arc::new(AdmissionController::default()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_delete_falls_back_to_directory() {
        let temp = tempfile::TempDir::new().unwrap();
        let server = MemoryServer::new();
        let target = target(temp.path(), &server);
        server.put_file(&RemotePath::parse("/www/assets/logo.png").unwrap(), b"png");

        let removed = target.delete_remote(&temp.path().join("assets")).await.unwrap();
        assert_eq!(removed.unwrap().to_string(), "/www/assets");
        assert!(!server.contains(&RemotePath::parse("/www/assets/logo.png").unwrap()));
        assert!(server.contains(&RemotePath::parse("/www").unwrap()));
        assert_eq!(target.stats().deletes_succeeded, 1);
    }

    #[tokio::test]
    async fn test_delete_disabled_skips() {
        let temp = tempfile::TempDir::new().unwrap();
        let server = MemoryServer::new();
        let mut config = TargetConfig::new("site", temp.path(), "/www", "memory");
        config.watch = false;
        config.delete_remote = false;
        let target =
            SyncTarget::with_factory(config, memory_factory(&server), Arc::new(AdmissionController::default()))
                .unwrap();
        server.put_file(&RemotePath::parse("/www/keep.txt").unwrap(), b"keep");

        assert_eq!(target.delete_remote(&temp.path().join("keep.txt")).await.unwrap(), None);
        assert!(server.contains(&RemotePath::parse("/www/keep.txt").unwrap()));
        assert_eq!(server.connects(), 0);
    }

    #[tokio::test]
    async fn test_refuses_paths_outside_root() {
        let temp = tempfile::TempDir::new().unwrap();
        let other = tempfile::TempDir::new().unwrap();
        std::fs::write(other.path().join("x.txt"), b"x").unwrap();
        let server = MemoryServer::new();
        let target = target(temp.path(), &server);

        let err = target.upload_file(&other.path().join("x.txt")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(target.stats().uploads_failed, 1);
    }

    #[tokio::test]
    async fn test_upload_folder_skips_ignored() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("css")).unwrap();
        std::fs::write(temp.path().join("index.html"), b"<html>").unwrap();
        std::fs::write(temp.path().join("css/site.css"), b"body{}").unwrap();
        std::fs::write(temp.path().join("draft.tmp"), b"scratch").unwrap();
        let server = MemoryServer::new();
        let target = target(temp.path(), &server);

        let summary = target.upload_folder(temp.path()).await.unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(summary.skipped, 1);
        assert!(summary.is_complete());
        assert_eq!(
            server.read_file(&RemotePath::parse("/www/css/site.css").unwrap()).unwrap(),
            b"body{}"
        );
        assert!(!server.contains(&RemotePath::parse("/www/draft.tmp").unwrap()));
    }

    #[tokio::test]
    async fn test_stopped_target_refuses_transfers_until_started() {
        let temp = tempfile::TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        let server = MemoryServer::new();
        let target = target(&root, &server);

        target.stop().await;
        let err = target.upload_file(&root.join("a.txt")).await.unwrap_err();
        assert!(matches!(err, Error::Disposed(_)));
        assert_eq!(server.connects(), 0);

        target.start().unwrap();
        target.upload_file(&root.join("a.txt")).await.unwrap();
        assert!(server.contains(&RemotePath::parse("/www/a.txt").unwrap()));
        target.stop().await;
        assert_eq!(server.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_unknown_protocol() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = TargetConfig::new("site", temp.path(), "/", "gopher");
        let registry = Arc::new(ClientRegistry::new());
        let result = SyncTarget::new(config, registry, Arc::new(AdmissionController::default()));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
