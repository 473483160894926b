//! In-memory remote server for testing.
//!
//! A [`MemoryServer`] plays the part of one remote host. Every
//! [`MemoryClient`] it hands out shares its file tree, so a client created
//! after a reconnect sees what an earlier one uploaded. Faults can be
//! scripted to exercise reconnection and rate-limit handling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::client::{EntryType, RemoteClient, RemoteEntry, TransferResult};
use remotesync_common::{Error, RemotePath, Result};

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, modified: DateTime<Utc> },
    Directory { modified: DateTime<Utc> },
}

impl Node {
    fn is_directory(&self) -> bool {
        matches!(self, Node::Directory { .. })
    }
}

#[derive(Debug, Default)]
struct ServerState {
    nodes: BTreeMap<RemotePath, Node>,
    connect_failures: VecDeque<String>,
    operation_failures: VecDeque<String>,
    latency: Duration,
    max_sessions: Option<usize>,
    epoch: u64,
    connects: usize,
    live_sessions: usize,
    operations: usize,
}

/// Shared in-process remote host.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    /// Create an empty server with only a root directory.
    pub fn new() -> Self {
        let server = Self::default();
        server.lock().nodes.insert(
            RemotePath::root(),
            Node::Directory {
                modified: Utc::now(),
            },
        );
        server
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a new, not yet connected client for this server.
    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            id: Uuid::new_v4(),
            server: self.clone(),
            session: Mutex::new(None),
        }
    }

    /// Fail the next `count` connect attempts with `message`.
    pub fn fail_connects(&self, count: usize, message: &str) {
        let mut state = self.lock();
        state
            .connect_failures
            .extend(std::iter::repeat(message.to_string()).take(count));
    }

    /// Fail the next `count` operations with `message`.
    pub fn fail_operations(&self, count: usize, message: &str) {
        let mut state = self.lock();
        state
            .operation_failures
            .extend(std::iter::repeat(message.to_string()).take(count));
    }

    /// Drop scripted faults that have not fired yet.
    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.connect_failures.clear();
        state.operation_failures.clear();
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Reject connects beyond `max` live sessions with a 530 response.
    pub fn set_max_sessions(&self, max: Option<usize>) {
        self.lock().max_sessions = max;
    }

    /// Silently kill every live session, as a dropped network would.
    pub fn kill_sessions(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        state.live_sessions = 0;
    }

    /// Total successful connects.
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Sessions currently open.
    pub fn live_sessions(&self) -> usize {
        self.lock().live_sessions
    }

    /// Operations served, including failed ones.
    pub fn operations(&self) -> usize {
        self.lock().operations
    }

    /// Place a file directly on the server, creating parents.
    pub fn put_file(&self, path: &RemotePath, data: &[u8]) {
        let mut state = self.lock();
        insert_parents(&mut state, path);
        state.nodes.insert(
            path.clone(),
            Node::File {
                data: data.to_vec(),
                modified: Utc::now(),
            },
        );
    }

    /// Read a file directly from the server.
    pub fn read_file(&self, path: &RemotePath) -> Option<Vec<u8>> {
        match self.lock().nodes.get(path) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Whether anything exists at the path.
    pub fn contains(&self, path: &RemotePath) -> bool {
        self.lock().nodes.contains_key(path)
    }

    /// Whether a directory exists at the path.
    pub fn is_dir(&self, path: &RemotePath) -> bool {
        self.lock().nodes.get(path).map(Node::is_directory) == Some(true)
    }
}

fn insert_parents(state: &mut ServerState, path: &RemotePath) {
    let mut parent = path.parent();
    while let Some(dir) = parent {
        parent = dir.parent();
        state.nodes.entry(dir).or_insert(Node::Directory {
            modified: Utc::now(),
        });
    }
}

fn entry_for(path: &RemotePath, node: &Node) -> RemoteEntry {
    let (entry_type, size, modified) = match node {
        Node::File { data, modified } => (EntryType::File, data.len() as u64, *modified),
        Node::Directory { modified } => (EntryType::Directory, 0, *modified),
    };
    RemoteEntry {
        name: path.name().unwrap_or("/").to_string(),
        path: path.clone(),
        entry_type,
        size,
        modified_time: Some(modified),
    }
}

/// Client session against a [`MemoryServer`].
pub struct MemoryClient {
    id: Uuid,
    server: MemoryServer,
    session: Mutex<Option<u64>>,
}

impl MemoryClient {
    fn session(&self) -> MutexGuard<'_, Option<u64>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Common preamble of every operation: liveness, latency, scripted faults.
    async fn begin(&self, op: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Connection("Client is closed".to_string()));
        }
        let latency = self.server.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.server.lock();
        state.operations += 1;
        if let Some(message) = state.operation_failures.pop_front() {
            debug!(client = %self.id, op, "Injected failure: {}", message);
            return Err(Error::from_remote(message));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for MemoryClient {
    fn protocol(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<()> {
        let latency = self.server.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.server.lock();
        if let Some(message) = state.connect_failures.pop_front() {
            return Err(Error::from_remote(message));
        }
        if let Some(max) = state.max_sessions {
            if state.live_sessions >= max {
                return Err(Error::from_remote(format!(
                    "530 Sorry, the maximum number of clients ({}) for this user are already connected.",
                    max
                )));
            }
        }
        state.connects += 1;
        state.live_sessions += 1;
        let epoch = state.epoch;
        drop(state);

        *self.session() = Some(epoch);
        debug!(client = %self.id, "Connected");
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(epoch) = self.session().take() else {
            return;
        };
        let mut state = self.server.lock();
        if state.epoch == epoch {
            state.live_sessions = state.live_sessions.saturating_sub(1);
        }
    }

    fn is_connected(&self) -> bool {
        match *self.session() {
            Some(epoch) => epoch == self.server.lock().epoch,
            None => false,
        }
    }

    async fn upload_file(&self, local: &Path, remote: &RemotePath) -> TransferResult {
        if let Err(e) = self.begin("upload").await {
            return TransferResult::failed(local, remote.clone(), e);
        }
        let data = match fs::read(local).await {
            Ok(data) => data,
            Err(e) => return TransferResult::failed(local, remote.clone(), e),
        };

        let mut state = self.server.lock();
        if state.nodes.get(remote).map(Node::is_directory) == Some(true) {
            return TransferResult::failed(local, remote.clone(), "550 Target is a directory");
        }
        insert_parents(&mut state, remote);
        state.nodes.insert(
            remote.clone(),
            Node::File {
                data,
                modified: Utc::now(),
            },
        );
        TransferResult::ok(local, remote.clone())
    }

    async fn download_file(&self, remote: &RemotePath, local: &Path) -> TransferResult {
        if let Err(e) = self.begin("download").await {
            return TransferResult::failed(local, remote.clone(), e);
        }
        let data = match self.server.lock().nodes.get(remote) {
            Some(Node::File { data, .. }) => data.clone(),
            Some(Node::Directory { .. }) => {
                return TransferResult::failed(local, remote.clone(), "550 Not a regular file")
            }
            None => {
                return TransferResult::failed(local, remote.clone(), "550 No such file or directory")
            }
        };

        if let Some(parent) = local.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return TransferResult::failed(local, remote.clone(), e);
            }
        }
        match fs::write(local, data).await {
            Ok(()) => TransferResult::ok(local, remote.clone()),
            Err(e) => TransferResult::failed(local, remote.clone(), e),
        }
    }

    async fn delete_file(&self, remote: &RemotePath) -> Result<()> {
        self.begin("delete_file").await?;
        let mut state = self.server.lock();
        match state.nodes.get(remote).map(Node::is_directory) {
            Some(false) => {
                state.nodes.remove(remote);
                Ok(())
            }
            Some(true) => Err(Error::Remote(format!("550 {}: Is a directory", remote))),
            None => Err(Error::NotFound(remote.to_string())),
        }
    }

    async fn delete_directory(&self, remote: &RemotePath) -> Result<()> {
        self.begin("delete_directory").await?;
        if remote.is_root() {
            return Err(Error::Remote("550 Cannot remove root".to_string()));
        }
        let mut state = self.server.lock();
        match state.nodes.get(remote).map(Node::is_directory) {
            Some(true) => {
                state.nodes.retain(|path, _| path.strip_prefix(remote).is_none());
                Ok(())
            }
            Some(false) => Err(Error::Remote(format!("550 {}: Not a directory", remote))),
            None => Err(Error::NotFound(remote.to_string())),
        }
    }

    async fn create_directory(&self, remote: &RemotePath) -> Result<()> {
        self.begin("create_directory").await?;
        let mut state = self.server.lock();
        if let Some(parent) = remote.parent() {
            if state.nodes.get(&parent).map(Node::is_directory) != Some(true) {
                return Err(Error::Remote(format!("550 {}: No such directory", parent)));
            }
        }
        match state.nodes.get(remote).map(Node::is_directory) {
            Some(true) => Ok(()),
            Some(false) => Err(Error::Remote(format!("550 {}: File exists", remote))),
            None => {
                state.nodes.insert(
                    remote.clone(),
                    Node::Directory {
                        modified: Utc::now(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn list_directory(&self, remote: &RemotePath) -> Result<Vec<RemoteEntry>> {
        self.begin("list_directory").await?;
        let state = self.server.lock();
        if state.nodes.get(remote).map(Node::is_directory) != Some(true) {
            return Err(Error::NotFound(remote.to_string()));
        }
        Ok(state
            .nodes
            .iter()
            .filter(|(path, _)| path.parent().as_ref() == Some(remote))
            .map(|(path, node)| entry_for(path, node))
            .collect())
    }

    async fn get_file_info(&self, remote: &RemotePath) -> Option<RemoteEntry> {
        self.begin("stat").await.ok()?;
        let state = self.server.lock();
        state.nodes.get(remote).map(|node| entry_for(remote, node))
    }
}
