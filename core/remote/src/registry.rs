//! Client registry for per-protocol client construction.

use std::collections::HashMap;
use std::sync::Arc;

use crate::client::{ConnectionSettings, RemoteClient};
use crate::local::LocalClient;
use crate::memory::MemoryServer;
use remotesync_common::{Error, Result};

/// Factory function type for creating clients.
///
/// Called on every (re)connect, so each call must return a fresh,
/// not yet connected client.
pub type ClientFactory =
    Box<dyn Fn(&ConnectionSettings) -> Result<Arc<dyn RemoteClient>> + Send + Sync>;

/// Registry of remote client factories keyed by protocol name.
pub struct ClientRegistry {
    factories: HashMap<String, ClientFactory>,
}

impl ClientRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a client factory.
    ///
    /// # Errors
    /// - `InvalidInput` if `protocol` is already registered
    pub fn register(&mut self, protocol: impl Into<String>, factory: ClientFactory) -> Result<()> {
        let protocol = protocol.into();
        if self.factories.contains_key(&protocol) {
            return Err(Error::InvalidInput(format!(
                "Protocol '{}' is already registered",
                protocol
            )));
        }
        self.factories.insert(protocol, factory);
        Ok(())
    }

    /// Build a new client for `protocol`.
    ///
    /// # Errors
    /// - `NotFound` if the protocol is not registered
    /// - Whatever the factory reports for unusable settings
    pub fn resolve(
        &self,
        protocol: &str,
        settings: &ConnectionSettings,
    ) -> Result<Arc<dyn RemoteClient>> {
        let factory = self.factories.get(protocol).ok_or_else(|| {
            Error::NotFound(format!("Protocol '{}' is not registered", protocol))
        })?;
        factory(settings)
    }

    /// Registered protocol names, sorted.
    pub fn protocols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a protocol is registered.
    pub fn has_protocol(&self, protocol: &str) -> bool {
        self.factories.contains_key(protocol)
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with every protocol compiled into this build.
///
/// `local` treats the configured remote root as an absolute local path.
/// `memory` clients all share one in-process server per registry.
pub fn create_default_registry() -> ClientRegistry {
    let mut factories: HashMap<String, ClientFactory> = HashMap::new();

    #[cfg(feature = "ftp")]
    factories.insert(
        "ftp".to_string(),
        Box::new(|settings: &ConnectionSettings| -> Result<Arc<dyn RemoteClient>> {
            require_host(settings)?;
            Ok(Arc::new(crate::ftp::FtpClient::new(settings.clone())))
        }),
    );

    #[cfg(feature = "sftp")]
    factories.insert(
        "sftp".to_string(),
        Box::new(|settings: &ConnectionSettings| -> Result<Arc<dyn RemoteClient>> {
            require_host(settings)?;
            Ok(Arc::new(crate::sftp::SftpClient::new(settings.clone())))
        }),
    );

    factories.insert(
        "local".to_string(),
        Box::new(|_: &ConnectionSettings| -> Result<Arc<dyn RemoteClient>> {
            Ok(Arc::new(LocalClient::new("/")))
        }),
    );

    let server = MemoryServer::new();
    factories.insert(
        "memory".to_string(),
        Box::new(move |_: &ConnectionSettings| -> Result<Arc<dyn RemoteClient>> {
            Ok(Arc::new(server.client()))
        }),
    );

    ClientRegistry { factories }
}

#[cfg(any(feature = "ftp", feature = "sftp"))]
fn require_host(settings: &ConnectionSettings) -> Result<()> {
    if settings.host.trim().is_empty() {
        return Err(Error::InvalidInput("Connection host is required".to_string()));
    }
    Ok(())
}
