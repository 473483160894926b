//! Sync target configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::coalescer::CoalescerConfig;
use crate::ignore::GlobIgnore;
use crate::pool::PoolConfig;
use crate::queue::QueueConfig;
use remotesync_common::{Error, RemotePath, Result};
use remotesync_remote::ConnectionSettings;

fn default_protocol() -> String {
    "ftp".to_string()
}

fn default_remote_root() -> String {
    "/".to_string()
}

fn default_operation_timeout_secs() -> u64 {
    30
}

fn default_queue_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

/// One local tree mirrored to one remote directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Unique name, used in logs and on the command line.
    pub name: String,
    /// Absolute local directory.
    pub local_root: PathBuf,
    /// Remote directory the local root maps onto.
    #[serde(default = "default_remote_root")]
    pub remote_root: String,
    /// `ftp`, `sftp`, `local` or `memory`.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub connection: ConnectionSettings,
    /// Connect and per-attempt deadline.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Deadline for a queued operation, which covers its own retries.
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Watch the local root for changes.
    #[serde(default = "default_true")]
    pub watch: bool,
    /// Propagate local deletes to the server.
    #[serde(default = "default_true")]
    pub delete_remote: bool,
    /// Globs matched against paths relative to the local root.
    #[serde(default)]
    pub ignore: Vec<String>,
}

impl TargetConfig {
    /// Config with defaults for everything but the name and roots.
    pub fn new(
        name: impl Into<String>,
        local_root: impl Into<PathBuf>,
        remote_root: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            local_root: local_root.into(),
            remote_root: remote_root.into(),
            protocol: protocol.into(),
            connection: ConnectionSettings::default(),
            operation_timeout_secs: default_operation_timeout_secs(),
            queue_timeout_secs: default_queue_timeout_secs(),
            max_retries: default_max_retries(),
            debounce_ms: default_debounce_ms(),
            watch: true,
            delete_remote: true,
            ignore: Vec::new(),
        }
    }

    /// Check the config on its own.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty name, a relative local root, an
    ///   unparsable remote root, a bad ignore glob or a zero timeout
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("Target name cannot be empty".to_string()));
        }
        if !self.local_root.is_absolute() {
            return Err(Error::InvalidInput(format!(
                "Target '{}': local_root must be absolute, got {}",
                self.name,
                self.local_root.display()
            )));
        }
        self.remote_root()?;
        self.ignore_predicate()?;
        if self.operation_timeout_secs == 0 || self.queue_timeout_secs == 0 {
            return Err(Error::InvalidInput(format!(
                "Target '{}': timeouts must be positive",
                self.name
            )));
        }
        Ok(())
    }

    /// Parsed remote root.
    pub fn remote_root(&self) -> Result<RemotePath> {
        RemotePath::parse(&self.remote_root)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .with_operation_timeout(self.operation_timeout())
            .with_max_retries(self.max_retries)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            default_timeout: self.queue_timeout(),
            default_max_retries: self.max_retries.max(1),
            ..QueueConfig::default()
        }
    }

    pub fn ignore_predicate(&self) -> Result<GlobIgnore> {
        GlobIgnore::new(&self.ignore)
    }

    pub fn coalescer_config(&self) -> CoalescerConfig {
        CoalescerConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            ..CoalescerConfig::default()
        }
    }
}

/// Contents of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfigFile {
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl SyncConfigFile {
    /// `<config dir>/remotesync/config.json`, when the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("remotesync").join("config.json"))
    }

    /// Parse and validate JSON.
    ///
    /// # Errors
    /// - `Serialization` for malformed JSON
    /// - `InvalidInput` for an invalid target or a duplicate name
    pub fn from_json(json: &str) -> Result<Self> {
        let file: Self = serde_json::from_str(json)?;
        file.validate()?;
        Ok(file)
    }

    /// Read, parse and validate a config file.
    pub async fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading configuration");
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for target in &self.targets {
            target.validate()?;
            if !names.insert(target.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "Duplicate target name '{}'",
                    target.name
                )));
            }
        }
        Ok(())
    }

    /// Find a target by name.
    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }
}
