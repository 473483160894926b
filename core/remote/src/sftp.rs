//! SFTP client built on `ssh2`.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use ssh2::{FileStat, Session, Sftp};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::blocking::BlockingSession;
use crate::client::{ConnectionSettings, EntryType, RemoteClient, RemoteEntry, TransferResult};
use remotesync_common::{Error, RemotePath, Result};

const DEFAULT_PORT: u16 = 22;

fn ssh_err(err: ssh2::Error) -> Error {
    Error::from_remote(err.to_string())
}

struct SftpSession {
    session: Session,
    sftp: Sftp,
}

fn entry_from_stat(path: RemotePath, stat: &FileStat) -> RemoteEntry {
    let file_type = stat.file_type();
    let entry_type = if file_type.is_symlink() {
        EntryType::Link
    } else if file_type.is_dir() {
        EntryType::Directory
    } else {
        EntryType::File
    };
    let modified_time: Option<DateTime<Utc>> = stat
        .mtime
        .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single());
    RemoteEntry {
        name: path.name().unwrap_or("/").to_string(),
        path,
        entry_type,
        size: stat.size.unwrap_or(0),
        modified_time,
    }
}

/// Remote client speaking SFTP over SSH.
pub struct SftpClient {
    settings: ConnectionSettings,
    session: BlockingSession<SftpSession>,
}

impl SftpClient {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            session: BlockingSession::new(),
        }
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
            let target = PathBuf::from(dir.to_string_path());
            self.session
                .run(move |s| s.sftp.rmdir(&target).map_err(ssh_err))
                .await
        })
    }
}

#[async_trait]
impl RemoteClient for SftpClient {
    fn protocol(&self) -> &str {
        "sftp"
    }

    async fn connect(&self) -> Result<()> {
        let settings = self.settings.clone();
        let address = settings.address(DEFAULT_PORT);
        debug!(address = %address, "Opening SFTP session");

        self.session
            .open(move || {
                let tcp = TcpStream::connect(address.as_str())?;
                let mut session = Session::new().map_err(ssh_err)?;
                session.set_tcp_stream(tcp);
                session.handshake().map_err(ssh_err)?;

                let username = settings.username.as_deref().unwrap_or("root");
                match (&settings.private_key, &settings.password) {
                    (Some(key), _) => session
                        .userauth_pubkey_file(username, None, key, settings.passphrase.as_deref())
                        .map_err(ssh_err)?,
                    (None, Some(password)) => session
                        .userauth_password(username, password)
                        .map_err(ssh_err)?,
                    (None, None) => {
                        return Err(Error::InvalidInput(
                            "SFTP requires a password or private key".to_string(),
                        ))
                    }
                }
                if !session.authenticated() {
                    return Err(Error::Remote("SFTP authentication failed".to_string()));
                }

                let sftp = session.sftp().map_err(ssh_err)?;
                Ok(SftpSession { session, sftp })
            })
            .await
    }

    async fn disconnect(&self) {
        self.session
            .close(|s| {
                if let Err(e) = s.session.disconnect(None, "closing", None) {
                    debug!("SSH disconnect failed: {}", e);
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

        let target = PathBuf::from(remote.to_string_path());
        let result = self
            .session
            .run(move |s| {
                let mut file = s.sftp.create(&target).map_err(ssh_err)?;
                file.write_all(&data)?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => TransferResult::ok(local, remote.clone()),
            Err(e) => TransferResult::failed(local, remote.clone(), e),
        }
    }

    async fn download_file(&self, remote: &RemotePath, local: &Path) -> TransferResult {
        let source = PathBuf::from(remote.to_string_path());
        let data = match self
            .session
            .run(move |s| {
                let mut file = s.sftp.open(&source).map_err(ssh_err)?;
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                Ok(data)
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
        let target = PathBuf::from(remote.to_string_path());
        self.session
            .run(move |s| s.sftp.unlink(&target).map_err(ssh_err))
            .await
    }

    async fn delete_directory(&self, remote: &RemotePath) -> Result<()> {
        self.delete_tree(remote).await
    }

    async fn create_directory(&self, remote: &RemotePath) -> Result<()> {
        let target = PathBuf::from(remote.to_string_path());
        self.session
            .run(move |s| s.sftp.mkdir(&target, 0o755).map_err(ssh_err))
            .await
    }

    async fn list_directory(&self, remote: &RemotePath) -> Result<Vec<RemoteEntry>> {
        let target = PathBuf::from(remote.to_string_path());
        let listing = self
            .session
            .run(move |s| s.sftp.readdir(&target).map_err(ssh_err))
            .await?;

        Ok(listing
            .into_iter()
            .filter_map(|(path, stat)| {
                let name = path.file_name()?.to_str()?.to_string();
                let child = remote.join(&name).ok()?;
                Some(entry_from_stat(child, &stat))
            })
            .collect())
    }

    async fn get_file_info(&self, remote: &RemotePath) -> Option<RemoteEntry> {
        let target = PathBuf::from(remote.to_string_path());
        let stat = self
            .session
            .run(move |s| s.sftp.lstat(&target).map_err(ssh_err))
            .await
            .ok()?;
        Some(entry_from_stat(remote.clone(), &stat))
    }
}
