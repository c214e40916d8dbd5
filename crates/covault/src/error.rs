//! Error types for the node API.

use covault_core::{CoId, CoreError};
use covault_perms::PermsError;
use covault_store::StoreError;
use covault_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("permission error: {0}")]
    Perms(#[from] PermsError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Neither storage nor any server peer has the CoValue.
    #[error("CoValue not found: {0}")]
    NotFound(CoId),

    #[error("CoValue is deleted: {0}")]
    Deleted(CoId),

    #[error("timed out waiting for {0}")]
    Timeout(CoId),

    /// The content has the wrong kind, or an index is out of range.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
