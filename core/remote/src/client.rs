//! Remote client trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use remotesync_common::{Error, RemotePath, Result};

/// Kind of a remote directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Directory,
    Link,
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Final path component.
    pub name: String,
    /// Full remote path.
    pub path: RemotePath,
    /// File, directory or link.
    pub entry_type: EntryType,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Last modification time, when the server reports one.
    pub modified_time: Option<DateTime<Utc>>,
}

impl RemoteEntry {
    /// Whether this entry is a directory.
    pub fn is_directory(&self) -> bool {
        self.entry_type == EntryType::Directory
    }
}

/// Outcome of an upload or download.
///
/// Transfers report failure in the record rather than as an `Err`, so a
/// caller always learns which paths were involved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub success: bool,
    pub local_path: PathBuf,
    pub remote_path: RemotePath,
    pub error: Option<String>,
}

impl TransferResult {
    /// A successful transfer.
    pub fn ok(local_path: impl Into<PathBuf>, remote_path: RemotePath) -> Self {
        Self {
            success: true,
            local_path: local_path.into(),
            remote_path,
            error: None,
        }
    }

    /// A failed transfer carrying the error message.
    pub fn failed(
        local_path: impl Into<PathBuf>,
        remote_path: RemotePath,
        error: impl fmt::Display,
    ) -> Self {
        Self {
            success: false,
            local_path: local_path.into(),
            remote_path,
            error: Some(error.to_string()),
        }
    }

    /// Convert a failed record into a classified error.
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            let message = self
                .error
                .clone()
                .unwrap_or_else(|| format!("Transfer of {} failed", self.remote_path));
            Err(Error::from_remote(message))
        }
    }
}

/// Where and how to reach a remote server.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub host: String,
    /// Protocol default port when absent.
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Private key file (SFTP only).
    pub private_key: Option<PathBuf>,
    pub passphrase: Option<String>,
}

impl ConnectionSettings {
    /// Settings for `host` with everything else defaulted.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Host and port, using `default_port` when none is configured.
    pub fn address(&self, default_port: u16) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(default_port))
    }
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("private_key", &self.private_key)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Capability set every protocol variant provides.
///
/// One client holds at most one session. Implementations do not need to be
/// safe for concurrent operations on that session; the connection pool
/// serializes all calls.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Protocol name (e.g., "ftp", "sftp", "local").
    fn protocol(&self) -> &str;

    /// Establish a session.
    ///
    /// # Errors
    /// - Classified transport error; its message is kept intact so
    ///   rate-limit and connection signatures remain detectable
    async fn connect(&self) -> Result<()>;

    /// Best-effort teardown. Never fails.
    async fn disconnect(&self);

    /// Whether the transport is actually alive, not merely "connect was called".
    fn is_connected(&self) -> bool;

    /// Upload a local file, creating missing remote parent directories.
    async fn upload_file(&self, local: &Path, remote: &RemotePath) -> TransferResult;

    /// Download a remote file, creating missing local parent directories.
    async fn download_file(&self, remote: &RemotePath, local: &Path) -> TransferResult;

    /// Delete a file.
    async fn delete_file(&self, remote: &RemotePath) -> Result<()>;

    /// Delete a directory and everything below it.
    async fn delete_directory(&self, remote: &RemotePath) -> Result<()>;

    /// Create a single directory; the parent must exist.
    async fn create_directory(&self, remote: &RemotePath) -> Result<()>;

    /// Create a directory and any missing ancestors.
    async fn ensure_directory(&self, remote: &RemotePath) -> Result<()> {
        for dir in remote.ancestors_inclusive() {
            if !self.is_directory(&dir).await {
                self.create_directory(&dir).await?;
            }
        }
        Ok(())
    }

    /// List a directory. Order is whatever the server returns.
    async fn list_directory(&self, remote: &RemotePath) -> Result<Vec<RemoteEntry>>;

    /// Metadata for a path, `None` when absent or unreachable.
    async fn get_file_info(&self, remote: &RemotePath) -> Option<RemoteEntry>;

    /// Whether anything exists at the path.
    async fn exists(&self, remote: &RemotePath) -> bool {
        remote.is_root() || self.get_file_info(remote).await.is_some()
    }

    /// Whether the path is a directory.
    async fn is_directory(&self, remote: &RemotePath) -> bool {
        if remote.is_root() {
            return true;
        }
        self.get_file_info(remote)
            .await
            .map(|entry| entry.is_directory())
            .unwrap_or(false)
    }
}
