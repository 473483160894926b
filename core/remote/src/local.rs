//! Local filesystem remote client.
//!
//! Treats a directory on this machine as the remote root. Useful for
//! mounted network shares and for exercising a full sync without a server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;

use crate::client::{EntryType, RemoteClient, RemoteEntry, TransferResult};
use remotesync_common::{Error, RemotePath, Result};

/// Remote client backed by a local directory.
pub struct LocalClient {
    base: PathBuf,
    connected: AtomicBool,
}

impl LocalClient {
    /// Create a client rooted at `base`. Remote `/` maps to `base`.
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
            connected: AtomicBool::new(false),
        }
    }

    /// Convert a RemotePath to a filesystem path.
    fn to_fs_path(&self, path: &RemotePath) -> PathBuf {
        let mut fs_path = self.base.clone();
        for component in path.components() {
            fs_path.push(component);
        }
        fs_path
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::Connection("Client is closed".to_string()))
        }
    }

    fn create_entry(path: &RemotePath, fs_meta: &std::fs::Metadata) -> RemoteEntry {
        let modified: Option<DateTime<Utc>> = fs_meta.modified().ok().map(|t| t.into());
        let entry_type = if fs_meta.file_type().is_symlink() {
            EntryType::Link
        } else if fs_meta.is_dir() {
            EntryType::Directory
        } else {
            EntryType::File
        };

        RemoteEntry {
            name: path.name().unwrap_or("/").to_string(),
            path: path.clone(),
            entry_type,
            size: if fs_meta.is_file() { fs_meta.len() } else { 0 },
            modified_time: modified,
        }
    }

    async fn copy_into(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(from, to).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for LocalClient {
    fn protocol(&self) -> &str {
        "local"
    }

    async fn connect(&self) -> Result<()> {
        let meta = fs::metadata(&self.base).await.map_err(|e| {
            Error::Connection(format!("Cannot open {}: {}", self.base.display(), e))
        })?;
        if !meta.is_dir() {
            return Err(Error::InvalidInput(format!(
                "{} is not a directory",
                self.base.display()
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn upload_file(&self, local: &Path, remote: &RemotePath) -> TransferResult {
        if let Err(e) = self.ensure_connected() {
            return TransferResult::failed(local, remote.clone(), e);
        }
        match self.copy_into(local, &self.to_fs_path(remote)).await {
            Ok(()) => TransferResult::ok(local, remote.clone()),
            Err(e) => TransferResult::failed(local, remote.clone(), e),
        }
    }

    async fn download_file(&self, remote: &RemotePath, local: &Path) -> TransferResult {
        if let Err(e) = self.ensure_connected() {
            return TransferResult::failed(local, remote.clone(), e);
        }
        match self.copy_into(&self.to_fs_path(remote), local).await {
            Ok(()) => TransferResult::ok(local, remote.clone()),
            Err(e) => TransferResult::failed(local, remote.clone(), e),
        }
    }

    async fn delete_file(&self, remote: &RemotePath) -> Result<()> {
        self.ensure_connected()?;
        let fs_path = self.to_fs_path(remote);
        if fs::metadata(&fs_path).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(Error::Remote(format!("{}: Is a directory", remote)));
        }
        fs::remove_file(&fs_path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(remote.to_string()),
            _ => Error::Io(e),
        })
    }

    async fn delete_directory(&self, remote: &RemotePath) -> Result<()> {
        self.ensure_connected()?;
        if remote.is_root() {
            return Err(Error::Remote("Cannot remove root".to_string()));
        }
        fs::remove_dir_all(self.to_fs_path(remote))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::NotFound(remote.to_string()),
                _ => Error::Io(e),
            })
    }

    async fn create_directory(&self, remote: &RemotePath) -> Result<()> {
        self.ensure_connected()?;
        match fs::create_dir(self.to_fs_path(remote)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if self.is_directory(remote).await {
                    Ok(())
                } else {
                    Err(Error::Remote(format!("{}: File exists", remote)))
                }
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn ensure_directory(&self, remote: &RemotePath) -> Result<()> {
        self.ensure_connected()?;
        fs::create_dir_all(self.to_fs_path(remote)).await?;
        Ok(())
    }

    async fn list_directory(&self, remote: &RemotePath) -> Result<Vec<RemoteEntry>> {
        self.ensure_connected()?;
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(self.to_fs_path(remote)).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(remote.to_string()),
            _ => Error::Io(e),
        })?;

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let child = remote.join(&name)?;
            let fs_meta = fs::symlink_metadata(entry.path()).await?;
            entries.push(Self::create_entry(&child, &fs_meta));
        }

        Ok(entries)
    }

    async fn get_file_info(&self, remote: &RemotePath) -> Option<RemoteEntry> {
        self.ensure_connected().ok()?;
        let fs_meta = fs::symlink_metadata(self.to_fs_path(remote)).await.ok()?;
        Some(Self::create_entry(remote, &fs_meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_connect_requires_existing_directory() {
        let temp = TempDir::new().unwrap();
        let client = LocalClient::new(temp.path().join("missing"));
        assert!(client.connect().await.is_err());
        assert!(!client.is_connected());

        let client = LocalClient::new(temp.path());
        client.connect().await.unwrap();
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_upload_list_delete() {
        let remote_dir = TempDir::new().unwrap();
        let local_dir = TempDir::new().unwrap();
        let local = local_dir.path().join("page.html");
        std::fs::write(&local, b"<html/>").unwrap();

        let client = LocalClient::new(remote_dir.path());
        client.connect().await.unwrap();

        let target = RemotePath::parse("/www/page.html").unwrap();
        let result = client.upload_file(&local, &target).await;
        assert!(result.success, "{:?}", result.error);

        let www = RemotePath::parse("/www").unwrap();
        let entries = client.list_directory(&www).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, EntryType::File);
        assert_eq!(entries[0].size, 7);

        assert!(client.delete_file(&www).await.is_err());
        client.delete_file(&target).await.unwrap();
        assert!(!client.exists(&target).await);
    }

    #[tokio::test]
    async fn test_disconnected_client_fails_fast() {
        let temp = TempDir::new().unwrap();
        let client = LocalClient::new(temp.path());
        let err = client
            .create_directory(&RemotePath::parse("/x").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
    }
}
