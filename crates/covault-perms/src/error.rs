//! Error types for the permissions module.

use covault_core::{AgentId, CoId, KeyId};
use thiserror::Error;

/// Errors returned to local callers.
///
/// Transactions from peers that break the rules never produce these; they
/// end up as invalid transactions of the CoValue instead.
#[derive(Debug, Error)]
pub enum PermsError {
    /// The requested change would make the group graph inconsistent.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// The local agent lacks the role needed for the change.
    #[error("{agent} is not authorized to {action} in {group}")]
    NotAuthorized {
        agent: AgentId,
        group: CoId,
        action: &'static str,
    },

    /// A group needed to resolve roles or keys is not loaded.
    #[error("group not loaded: {0}")]
    MissingGroup(CoId),

    /// No read key available, or not revealed to the local agent.
    #[error("key {key} of {group} is not available")]
    MissingKey { group: CoId, key: KeyId },

    /// A revelation could not be decoded.
    #[error("invalid key revelation: {0}")]
    InvalidRevelation(String),

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] covault_core::CoreError),
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
