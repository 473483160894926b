//! FTP client built on `suppaftp`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::io::Cursor;
use std::path::Path;
use suppaftp::list::File as ListEntry;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tokio::fs;
use tracing::{debug, warn};

use crate::blocking::BlockingSession;
use crate::client::{ConnectionSettings, EntryType, RemoteClient, RemoteEntry, TransferResult};
use remotesync_common::{Error, RemotePath, Result};

const DEFAULT_PORT: u16 = 21;

fn ftp_err(err: FtpError) -> Error {
    Error::from_remote(err.to_string())
}

/// Remote client speaking plain FTP.
pub struct FtpClient {
    settings: ConnectionSettings,
    session: BlockingSession<FtpStream>,
}

impl FtpClient {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            session: BlockingSession::new(),
        }
    }

    fn parse_listing(dir: &RemotePath, lines: Vec<String>) -> Vec<RemoteEntry> {
        lines
            .iter()
            .filter_map(|line| match line.parse::<ListEntry>() {
                Ok(file) => Some(file),
                Err(_) => {
                    debug!("Skipping unparsable LIST line: {}", line);
                    None
                }
            })
            .filter(|file| file.name() != "." && file.name() != "..")
            .filter_map(|file| {
                let path = dir.join(file.name()).ok()?;
                let entry_type = if file.is_directory() {
                    EntryType::Directory
                } else if file.is_symlink() {
                    EntryType::Link
                } else {
                    EntryType::File
                };
                let modified: DateTime<Utc> = file.modified().into();
                Some(RemoteEntry {
                    name: file.name().to_string(),
                    path,
                    entry_type,
                    size: file.size() as u64,
                    modified_time: Some(modified),
                })
            })
            .collect()
    }

    fn delete_tree<'a>(&'a self, dir: &'a RemotePath) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for entry in self.list_directory(dir).await? {
                if entry.is_directory() {
                    self.delete_tree(&entry.path).await?;
                } else {
                    self.delete_file(&entry.path).await?;
                }
            }
            let target = dir.to_string_path();
            self.session
                .run(move |ftp| ftp.rmdir(&target).map_err(ftp_err))
                .await
        })
    }
}

#[async_trait]
impl RemoteClient for FtpClient {
    fn protocol(&self) -> &str {
        "ftp"
    }

    async fn connect(&self) -> Result<()> {
        let address = self.settings.address(DEFAULT_PORT);
        let username = self
            .settings
            .username
            .clone()
            .unwrap_or_else(|| "anonymous".to_string());
        let password = self.settings.password.clone().unwrap_or_default();

        debug!(address = %address, "Opening FTP session");
        self.session
            .open(move || {
                let mut ftp = FtpStream::connect(address.as_str()).map_err(ftp_err)?;
                ftp.login(username.as_str(), password.as_str())
                    .map_err(ftp_err)?;
                ftp.transfer_type(FileType::Binary).map_err(ftp_err)?;
                Ok(ftp)
            })
            .await
    }

    async fn disconnect(&self) {
        self.session
            .close(|mut ftp| {
                if let Err(e) = ftp.quit() {
                    debug!("FTP quit failed: {}", e);
                }
            })
            .await;
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    async fn upload_file(&self, local: &Path, remote: &RemotePath) -> TransferResult {
        let data = match fs::read(local).await {
            Ok(data) => data,
            Err(e) => return TransferResult::failed(local, remote.clone(), e),
        };
        if let Some(parent) = remote.parent() {
            if let Err(e) = self.ensure_directory(&parent).await {
                return TransferResult::failed(local, remote.clone(), e);
            }
        }

        let target = remote.to_string_path();
        let result = self
            .session
            .run(move |ftp| {
                ftp.put_file(&target, &mut Cursor::new(data))
                    .map_err(ftp_err)
            })
            .await;
        match result {
            Ok(_) => TransferResult::ok(local, remote.clone()),
            Err(e) => TransferResult::failed(local, remote.clone(), e),
        }
    }

    async fn download_file(&self, remote: &RemotePath, local: &Path) -> TransferResult {
        let source = remote.to_string_path();
        let data = match self
            .session
            .run(move |ftp| {
                ftp.retr_as_buffer(&source)
                    .map(Cursor::into_inner)
                    .map_err(ftp_err)
            })
            .await
        {
            Ok(data) => data,
            Err(e) => return TransferResult::failed(local, remote.clone(), e),
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
        let target = remote.to_string_path();
        self.session
            .run(move |ftp| ftp.rm(&target).map_err(ftp_err))
            .await
    }

    async fn delete_directory(&self, remote: &RemotePath) -> Result<()> {
        self.delete_tree(remote).await
    }

    async fn create_directory(&self, remote: &RemotePath) -> Result<()> {
        let target = remote.to_string_path();
        self.session
            .run(move |ftp| ftp.mkdir(&target).map_err(ftp_err))
            .await
    }

    async fn ensure_directory(&self, remote: &RemotePath) -> Result<()> {
        for dir in remote.ancestors_inclusive() {
            if let Err(e) = self.create_directory(&dir).await {
                // 550 for an existing directory is expected; only a broken
                // session is worth surfacing here.
                if e.is_connection_error() {
                    return Err(e);
                }
            }
        }
        if self.is_directory(remote).await {
            Ok(())
        } else {
            warn!(path = %remote, "Directory still missing after MKD");
            Err(Error::Remote(format!("Cannot create directory {}", remote)))
        }
    }

    async fn list_directory(&self, remote: &RemotePath) -> Result<Vec<RemoteEntry>> {
        let target = remote.to_string_path();
        let lines = self
            .session
            .run(move |ftp| ftp.list(Some(target.as_str())).map_err(ftp_err))
            .await?;
        Ok(Self::parse_listing(remote, lines))
    }

    async fn get_file_info(&self, remote: &RemotePath) -> Option<RemoteEntry> {
        let parent = remote.parent()?;
        let name = remote.name()?.to_string();
        self.list_directory(&parent)
            .await
            .ok()?
            .into_iter()
            .find(|entry| entry.name == name)
    }

    async fn is_directory(&self, remote: &RemotePath) -> bool {
        if remote.is_root() {
            return true;
        }
        let target = remote.to_string_path();
        self.session
            .run(move |ftp| {
                let previous = ftp.pwd().map_err(ftp_err)?;
                let entered = ftp.cwd(&target).is_ok();
                ftp.cwd(&previous).map_err(ftp_err)?;
                Ok(entered)
            })
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix_listing() {
        let dir = RemotePath::parse("/srv").unwrap();
        let lines = vec![
            "drwxr-xr-x    2 ftp      ftp          4096 Mar 03 12:00 assets".to_string(),
            "-rw-r--r--    1 ftp      ftp          1024 Mar 03 12:00 index.html".to_string(),
            "lrwxrwxrwx    1 ftp      ftp             9 Mar 03 12:00 latest -> index.html".to_string(),
            "total 3".to_string(),
        ];
        let entries = FtpClient::parse_listing(&dir, lines);
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].name, "assets");
        assert_eq!(entries[0].entry_type, EntryType::Directory);
        assert_eq!(entries[1].path.to_string(), "/srv/index.html");
        assert_eq!(entries[1].size, 1024);
        assert_eq!(entries[2].entry_type, EntryType::Link);
    }

    #[tokio::test]
    async fn test_new_client_is_disconnected() {
        let client = FtpClient::new(ConnectionSettings::new("127.0.0.1"));
        assert!(!client.is_connected());
        let err = client.delete_file(&RemotePath::parse("/a").unwrap()).await.unwrap_err();
        assert!(err.is_connection_error());
    }
}
