//! Error types for Covault core.

use thiserror::Error;

use crate::ids::{AgentId, CoId, SessionId};

/// Core errors that can occur while building or reading CoValues.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    /// Attempted to append to a session owned by another agent.
    #[error("session {session} is not owned by {agent}")]
    NotOwner { session: SessionId, agent: AgentId },

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("CoValue {0} is deleted")]
    Deleted(CoId),

    #[error("malformed id: {0}")]
    MalformedId(String),

    #[error("encryption error: {0}")]
    EncryptionError(String),

    #[error("decryption error: {0}")]
    DecryptionError(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::EncodingError(e.to_string())
    }
}

/// Why a batch of transactions received from a peer was not appended.
///
/// Rejections affect only the offending session; the rest of the log is
/// left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionReason {
    #[error("signature does not cover the claimed transactions")]
    SignatureInvalid,

    /// `from_index` did not line up with the session's current length.
    #[error("gap in log: expected index {expected}, got {got}")]
    GapInLog { expected: u32, got: u32 },

    #[error("header does not hash to {0}")]
    HeaderMismatch(CoId),

    #[error("CoValue is deleted, only deletion sessions are accepted")]
    Deleted,

    #[error("session id {0} does not name an agent")]
    InvalidSession(String),
}

impl RejectionReason {
    /// Whether the peer should be told our real position in the log.
    pub fn needs_correction(&self) -> bool {
        matches!(self, RejectionReason::GapInLog { .. })
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
