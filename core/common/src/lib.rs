//! Common utilities and types shared across remotesync crates.
//!
//! This module provides the error taxonomy every layer reports through and
//! the path types used to map a local tree onto a remote one.

pub mod error;
pub mod types;

pub use error::{is_connection_message, is_rate_limit_message, Error, Result};
pub use types::{RemotePath, TargetId};
