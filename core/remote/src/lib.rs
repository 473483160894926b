//! Remote client abstraction for remotesync.
//!
//! This module provides the capability set the sync core consumes from a
//! remote server, and the protocol variants that implement it. Clients are
//! built through a [`ClientRegistry`] so a connection pool can create a fresh
//! one on every reconnect.
//!
//! # Design Principles
//! - One session per client; callers serialize operations
//! - Transfers report failure in a result record, other operations by `Err`
//! - Transport failures enter the error taxonomy through `Error::from_remote`

pub mod client;
pub mod local;
pub mod memory;
pub mod registry;

#[cfg(any(feature = "ftp", feature = "sftp"))]
mod blocking;
#[cfg(feature = "ftp")]
pub mod ftp;
#[cfg(feature = "sftp")]
pub mod sftp;

pub use client::{ConnectionSettings, EntryType, RemoteClient, RemoteEntry, TransferResult};
pub use local::LocalClient;
pub use memory::{MemoryClient, MemoryServer};
pub use registry::{create_default_registry, ClientFactory, ClientRegistry};

#[cfg(feature = "ftp")]
pub use ftp::FtpClient;
#[cfg(feature = "sftp")]
pub use sftp::SftpClient;
