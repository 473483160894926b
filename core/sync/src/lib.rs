//! remotesync sync engine
//!
//! Keeps a local tree mirrored onto a remote server over connections that
//! drop, stall and get refused:
//! - Process-wide admission control of connection slots with a rate-limit cooldown
//! - A per-target connection pool with health tracking and reconnect backoff
//! - A prioritized, single-worker operation queue with timeout, retry and expiry
//! - Debounced, deduplicated change handling fed by a filesystem watcher
//! - The [`SyncTarget`] facade tying them together

pub mod admission;
pub mod coalescer;
pub mod config;
pub mod ignore;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod state;
pub mod target;
pub mod watcher;

pub use admission::{AdmissionConfig, AdmissionController};
pub use coalescer::{ChangeCoalescer, ChangeSink, CoalescerConfig, DELETE_PRIORITY, UPLOAD_PRIORITY};
pub use config::{SyncConfigFile, TargetConfig};
pub use ignore::{GlobIgnore, IgnorePredicate, NoIgnore};
pub use pool::{ClientFactory, ConnectionHealth, ConnectionPool, PoolConfig};
pub use queue::{EnqueueOptions, OperationHandle, OperationQueue, QueueConfig, QueueSnapshot, QueueStatus};
pub use retry::{Growth, RetryConfig};
pub use state::{SyncEvent, SyncStats, TransferKind};
pub use target::{FolderSummary, SyncTarget};
pub use watcher::{start_watcher, ChangeEvent, ChangeKind};
