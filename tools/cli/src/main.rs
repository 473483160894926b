//! remotesync CLI - keep local folders mirrored on FTP/SFTP servers.
//!
//! Targets come from a JSON config file; each command works on one target
//! except `watch`, which runs every selected target until Ctrl-C.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use remotesync_common::RemotePath;
use remotesync_remote::create_default_registry;
use remotesync_sync::{
    AdmissionController, FolderSummary, SyncConfigFile, SyncEvent, SyncTarget, TargetConfig,
};

#[derive(Parser)]
#[command(name = "remotesync")]
#[command(about = "remotesync - Mirror local folders onto FTP/SFTP servers")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: <config dir>/remotesync/config.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Prompt for the server password when the config has none.
    #[arg(long, global = true)]
    ask_password: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured targets.
    Targets,

    /// Watch targets and upload changes until interrupted.
    Watch {
        /// Targets to watch (default: all).
        #[arg(short, long)]
        target: Vec<String>,
    },

    /// Upload one file.
    Upload {
        #[arg(short, long)]
        target: String,

        /// Local file inside the target's local root.
        file: PathBuf,
    },

    /// Upload a directory tree.
    UploadFolder {
        #[arg(short, long)]
        target: String,

        /// Local directory (default: the local root).
        dir: Option<PathBuf>,
    },

    /// Download one file.
    Download {
        #[arg(short, long)]
        target: String,

        /// Remote file path.
        remote: String,

        /// Local destination.
        local: PathBuf,
    },

    /// Download a remote directory tree.
    DownloadFolder {
        #[arg(short, long)]
        target: String,

        /// Remote directory (default: the remote root).
        remote: Option<String>,

        /// Local destination (default: the local root).
        local: Option<PathBuf>,
    },

    /// Delete the remote counterpart of a local path.
    Delete {
        #[arg(short, long)]
        target: String,

        file: PathBuf,
    },

    /// Connect to a target and report its health.
    Check {
        #[arg(short, long)]
        target: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref()).await?;
    let session = Session {
        config,
        registry: Arc::new(create_default_registry()),
        admission: Arc::new(AdmissionController::default()),
        ask_password: cli.ask_password,
    };

    match cli.command {
        Commands::Targets => cmd_targets(&session),

        Commands::Watch { target } => cmd_watch(&session, &target).await,

        Commands::Upload { target, file } => cmd_upload(&session, &target, &file).await,

        Commands::UploadFolder { target, dir } => {
            cmd_upload_folder(&session, &target, dir.as_deref()).await
        }

        Commands::Download {
            target,
            remote,
            local,
        } => cmd_download(&session, &target, &remote, &local).await,

        Commands::DownloadFolder {
            target,
            remote,
            local,
        } => cmd_download_folder(&session, &target, remote.as_deref(), local.as_deref()).await,

        Commands::Delete { target, file } => cmd_delete(&session, &target, &file).await,

        Commands::Check { target } => cmd_check(&session, &target).await,
    }
}

/// Everything commands share: the config and one admission controller
/// for all targets of this process.
struct Session {
    config: SyncConfigFile,
    registry: Arc<remotesync_remote::ClientRegistry>,
    admission: Arc<AdmissionController>,
    ask_password: bool,
}

impl Session {
    fn target_config(&self, name: &str) -> Result<TargetConfig> {
        let mut config = self
            .config
            .target(name)
            .cloned()
            .with_context(|| format!("No target named '{}' in the config", name))?;
        if self.ask_password && config.connection.password.is_none() {
            let prompt = format!("Password for {}: ", name);
            let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
            config.connection.password = Some(password);
        }
        Ok(config)
    }

    fn open(&self, name: &str) -> Result<SyncTarget> {
        let config = self.target_config(name)?;
        SyncTarget::new(config, self.registry.clone(), self.admission.clone())
            .with_context(|| format!("Failed to set up target '{}'", name))
    }
}

async fn load_config(path: Option<&Path>) -> Result<SyncConfigFile> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => SyncConfigFile::default_path().context("No config directory on this platform")?,
    };
    SyncConfigFile::load(&path)
        .await
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

fn cmd_targets(session: &Session) -> Result<()> {
    if session.config.targets.is_empty() {
        println!("(no targets configured)");
        return Ok(());
    }
    for target in &session.config.targets {
        println!(
            "{:<16} {} -> {}://{}{}",
            target.name,
            target.local_root.display(),
            target.protocol,
            target.connection.host,
            target.remote_root
        );
    }
    Ok(())
}

async fn cmd_watch(session: &Session, names: &[String]) -> Result<()> {
    let names: Vec<String> = if names.is_empty() {
        session.config.targets.iter().map(|t| t.name.clone()).collect()
    } else {
        names.to_vec()
    };
    if names.is_empty() {
        anyhow::bail!("No targets to watch");
    }

    let mut targets = Vec::new();
    for name in &names {
        let target = session.open(name)?;
        target.start().with_context(|| format!("Failed to start '{}'", name))?;
        let mut events = target.subscribe();
        let label = name.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => print_event(&label, &event),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event output fell behind"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
        targets.push(target);
    }

    info!("Watching {} target(s), press Ctrl-C to stop", targets.len());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    for target in &targets {
        target.stop().await;
        let stats = target.stats();
        println!(
            "{}: {} uploaded, {} deleted, {} failed",
            target.id(),
            stats.uploads_succeeded,
            stats.deletes_succeeded,
            stats.uploads_failed + stats.deletes_failed
        );
    }
    Ok(())
}

fn print_event(target: &str, event: &SyncEvent) {
    match event {
        SyncEvent::Uploaded { remote_path, .. } => println!("[{}] uploaded {}", target, remote_path),
        SyncEvent::Downloaded { local_path, .. } => {
            println!("[{}] downloaded {}", target, local_path.display())
        }
        SyncEvent::Deleted { remote_path } => println!("[{}] deleted {}", target, remote_path),
        SyncEvent::Failed { kind, path, error } => {
            eprintln!("[{}] {} of {} failed: {}", target, kind, path, error)
        }
        SyncEvent::HealthChanged { health } => info!(target_name = target, %health, "Connection health"),
    }
}

/// Command-line paths are relative to the working directory.
fn from_cwd(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read the working directory")?;
    Ok(cwd.join(path))
}

async fn cmd_upload(session: &Session, name: &str, file: &Path) -> Result<()> {
    let target = session.open(name)?;
    let file = from_cwd(file)?;
    let file = file.as_path();
    let result = target.upload_file(file).await;
    target.stop().await;
    let remote = result.with_context(|| format!("Failed to upload {}", file.display()))?;
    println!("Uploaded {} -> {}", file.display(), remote);
    Ok(())
}

async fn cmd_upload_folder(session: &Session, name: &str, dir: Option<&Path>) -> Result<()> {
    let target = session.open(name)?;
    let dir = match dir {
        Some(dir) => from_cwd(dir)?,
        None => target.local_root().to_path_buf(),
    };
    let result = target.upload_folder(&dir).await;
    target.stop().await;
    let summary = result.with_context(|| format!("Failed to upload {}", dir.display()))?;
    print_summary("Uploaded", &summary)
}

async fn cmd_download(session: &Session, name: &str, remote: &str, local: &Path) -> Result<()> {
    let target = session.open(name)?;
    let remote = RemotePath::parse(remote).context("Invalid remote path")?;
    let local = from_cwd(local)?;
    let result = target.download_file(&remote, &local).await;
    target.stop().await;
    result.with_context(|| format!("Failed to download {}", remote))?;
    println!("Downloaded {} -> {}", remote, local.display());
    Ok(())
}

async fn cmd_download_folder(
    session: &Session,
    name: &str,
    remote: Option<&str>,
    local: Option<&Path>,
) -> Result<()> {
    let target = session.open(name)?;
    let remote = match remote {
        Some(remote) => RemotePath::parse(remote).context("Invalid remote path")?,
        None => target.remote_root().clone(),
    };
    let local = match local {
        Some(local) => from_cwd(local)?,
        None => target.local_root().to_path_buf(),
    };
    let result = target.download_folder(&remote, &local).await;
    target.stop().await;
    let summary = result.with_context(|| format!("Failed to download {}", remote))?;
    print_summary("Downloaded", &summary)
}

async fn cmd_delete(session: &Session, name: &str, file: &Path) -> Result<()> {
    let target = session.open(name)?;
    let file = from_cwd(file)?;
    let result = target.delete_remote(&file).await;
    target.stop().await;
    match result.with_context(|| format!("Failed to delete {}", file.display()))? {
        Some(remote) => println!("Deleted {}", remote),
        None => warn!("Remote deletes are disabled for '{}'", name),
    }
    Ok(())
}

async fn cmd_check(session: &Session, name: &str) -> Result<()> {
    let target = session.open(name)?;
    let result = target.force_reconnect().await;
    let health = target.pool().health();
    let stats = target.stats();
    target.stop().await;
    result.with_context(|| format!("Cannot connect to '{}'", name))?;

    println!("Target: {}", target.id());
    println!("  Protocol: {}", target.config().protocol);
    println!("  Remote root: {}", target.remote_root());
    println!("  Health: {}", health);
    println!("  Connected: {}", stats.connected);
    Ok(())
}

fn print_summary(verb: &str, summary: &FolderSummary) -> Result<()> {
    println!(
        "{} {} file(s), {} directory(ies), skipped {}",
        verb,
        summary.files,
        summary.directories,
        summary.skipped
    );
    for (path, error) in &summary.failed {
        eprintln!("  failed: {}: {}", path, error);
    }
    if !summary.is_complete() {
        anyhow::bail!("{} file(s) failed", summary.failed.len());
    }
    Ok(())
}
