//! Strong identifier types.
//!
//! All identifiers are newtypes to prevent misuse at compile time. Their
//! string forms are what travels on the wire and what groups use as map keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::crypto::{Ed25519PublicKey, X25519PublicKey};
use crate::error::CoreError;

/// A 32-byte CoValue identifier, the hash of the CoValue's header.
///
/// Two CoValues with the same header have the same CoId.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CoId(pub [u8; 32]);

impl CoId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "co_{}", self.to_hex())
    }
}

impl FromStr for CoId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s
            .strip_prefix("co_")
            .ok_or_else(|| CoreError::MalformedId(s.to_string()))?;
        let bytes = hex::decode(hex_part).map_err(|e| CoreError::MalformedId(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::MalformedId(s.to_string()))?;
        Ok(Self(arr))
    }
}

impl From<CoId> for String {
    fn from(id: CoId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for CoId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// The public identity of an agent: a signing key and a sealing key.
///
/// Rendered as `agent_<signer hex>_<sealer hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId {
    pub signer: Ed25519PublicKey,
    pub sealer: X25519PublicKey,
}

impl AgentId {
    pub const fn new(signer: Ed25519PublicKey, sealer: X25519PublicKey) -> Self {
        Self { signer, sealer }
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", &self.signer.to_hex()[..16])
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent_{}_{}", self.signer.to_hex(), self.sealer.to_hex())
    }
}

impl FromStr for AgentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CoreError::MalformedId(s.to_string());
        let rest = s.strip_prefix("agent_").ok_or_else(malformed)?;
        let (signer, sealer) = rest.split_once('_').ok_or_else(malformed)?;
        Ok(Self {
            signer: Ed25519PublicKey::from_hex(signer).map_err(|_| malformed())?,
            sealer: X25519PublicKey::from_hex(sealer).map_err(|_| malformed())?,
        })
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for AgentId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

const SESSION_MARKER: &str = "_session_";
const DELETE_MARKER: char = 'd';
const DELETE_SUFFIX: char = '$';

/// One agent's exclusive append-only stream within a CoValue.
///
/// Regular sessions look like `<agent>_session_z<hex>`; deletion sessions
/// look like `<agent>_session_d<hex>$`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// A fresh regular session for `agent`.
    pub fn new(agent: &AgentId, random: &[u8]) -> Self {
        Self(format!("{}{}z{}", agent, SESSION_MARKER, hex::encode(random)))
    }

    /// A fresh deletion session for `agent`.
    pub fn new_delete(agent: &AgentId, random: &[u8]) -> Self {
        Self(format!(
            "{}{}{}{}{}",
            agent,
            SESSION_MARKER,
            DELETE_MARKER,
            hex::encode(random),
            DELETE_SUFFIX
        ))
    }

    /// Wrap a session id received from elsewhere without validating it.
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The agent that owns (and signs) this session.
    pub fn agent(&self) -> Result<AgentId, CoreError> {
        let (agent, _) = self
            .0
            .split_once(SESSION_MARKER)
            .ok_or_else(|| CoreError::MalformedId(self.0.clone()))?;
        agent.parse()
    }

    pub fn is_delete(&self) -> bool {
        match self.0.split_once(SESSION_MARKER) {
            Some((_, tail)) => tail.starts_with(DELETE_MARKER) && tail.ends_with(DELETE_SUFFIX),
            None => false,
        }
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tail = self
            .0
            .split_once(SESSION_MARKER)
            .map(|(_, tail)| tail)
            .unwrap_or(&self.0);
        write!(f, "SessionId(..{})", tail)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of a transaction: its session and index within that session.
///
/// The derived ordering (session, then index) is the deterministic
/// tie-break used wherever two transactions share a `madeAt`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    #[serde(rename = "sessionID")]
    pub session: SessionId,
    #[serde(rename = "txIndex")]
    pub index: u32,
}

impl TransactionId {
    pub fn new(session: SessionId, index: u32) -> Self {
        Self { session, index }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session, self.index)
    }
}

/// Identifier of a group read key, `key_<16 hex>`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyId([u8; 8]);

impl KeyId {
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", hex::encode(self.0))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key_{}", hex::encode(self.0))
    }
}

impl FromStr for KeyId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s
            .strip_prefix("key_")
            .ok_or_else(|| CoreError::MalformedId(s.to_string()))?;
        let bytes = hex::decode(hex_part).map_err(|e| CoreError::MalformedId(e.to_string()))?;
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| CoreError::MalformedId(s.to_string()))?;
        Ok(Self(arr))
    }
}

impl From<KeyId> for String {
    fn from(id: KeyId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for KeyId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
