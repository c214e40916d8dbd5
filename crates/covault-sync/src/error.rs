//! Error types for the sync module.

use thiserror::Error;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer connection is gone.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// A frame or message could not be decoded.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Peer is not connected.
    #[error("peer not connected: {0}")]
    PeerNotConnected(String),

    /// Timed out waiting for a CoValue or a peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] covault_store::StoreError),

    /// Building or reading a CoValue failed.
    #[error("core error: {0}")]
    Core(#[from] covault_core::CoreError),

    /// A local write was not permitted.
    #[error("permission error: {0}")]
    Perms(#[from] covault_perms::PermsError),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::InvalidMessage(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
