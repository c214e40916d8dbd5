//! CoValue headers: the immutable part that a CoValue's identity is derived from.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::canonical_bytes;
use crate::crypto::CryptoProvider;
use crate::error::Result;
use crate::ids::{AgentId, CoId};

const CO_ID_CONTEXT: &str = "covault 2024-06 covalue id";

/// The kind of content a CoValue holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoValueKind {
    #[serde(rename = "comap")]
    Map,
    #[serde(rename = "colist")]
    List,
    #[serde(rename = "coplaintext")]
    PlainText,
    #[serde(rename = "costream")]
    Stream,
}

/// Who may write to a CoValue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Ruleset {
    /// The CoValue is itself a group; its own transactions assign roles.
    #[serde(rename = "group")]
    Group {
        #[serde(rename = "initialAdmin")]
        initial_admin: AgentId,
    },

    /// Writes are gated by the roles of `group`.
    #[serde(rename = "ownedByGroup")]
    OwnedByGroup { group: CoId },

    /// Any correctly signed transaction is valid.
    #[serde(rename = "unsafeAllowAll")]
    UnsafeAllowAll,
}

/// Sync priority tiers. Lower numbers are sent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    High = 0,
    Medium = 3,
    Low = 6,
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::High),
            3 => Ok(Priority::Medium),
            6 => Ok(Priority::Low),
            other => Err(format!("unknown priority {}", other)),
        }
    }
}

/// The immutable header of a CoValue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoValueHeader {
    #[serde(rename = "type")]
    pub kind: CoValueKind,
    pub ruleset: Ruleset,
    #[serde(default)]
    pub meta: Option<Value>,
    /// Salt that keeps otherwise identical headers apart.
    pub uniqueness: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl CoValueHeader {
    /// A header for a new group administered by `admin`.
    pub fn group(admin: AgentId, uniqueness: Value, created_at: i64) -> Self {
        Self {
            kind: CoValueKind::Map,
            ruleset: Ruleset::Group {
                initial_admin: admin,
            },
            meta: None,
            uniqueness,
            created_at: Some(created_at),
        }
    }

    /// A header for content owned by `group`.
    pub fn owned_by(kind: CoValueKind, group: CoId, uniqueness: Value, created_at: i64) -> Self {
        Self {
            kind,
            ruleset: Ruleset::OwnedByGroup { group },
            meta: None,
            uniqueness,
            created_at: Some(created_at),
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Derive the content address of this header.
    pub fn id(&self, crypto: &dyn CryptoProvider) -> Result<CoId> {
        let bytes = canonical_bytes(self)?;
        Ok(CoId(crypto.hash(&bytes, Some(CO_ID_CONTEXT)).0))
    }

    pub fn is_group(&self) -> bool {
        matches!(self.ruleset, Ruleset::Group { .. })
    }

    /// The group this CoValue's permissions come from, if any.
    pub fn owner_group(&self) -> Option<CoId> {
        match self.ruleset {
            Ruleset::OwnedByGroup { group } => Some(group),
            _ => None,
        }
    }

    /// Groups go first so dependents never arrive ahead of their permissions;
    /// streams (often large binary payloads) go last.
    pub fn priority(&self) -> Priority {
        match (&self.ruleset, self.kind) {
            (Ruleset::Group { .. }, _) => Priority::High,
            (_, CoValueKind::Stream) => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AgentSecret, NativeCrypto};
    use serde_json::json;

    #[test]
    fn test_id_is_deterministic() {
        let crypto = NativeCrypto::new();
        let admin = AgentSecret::from_seed(&[1; 32]).id();
        let h1 = CoValueHeader::group(admin, json!("salt"), 1000);
        let h2 = CoValueHeader::group(admin, json!("salt"), 1000);
        assert_eq!(h1.id(&crypto).unwrap(), h2.id(&crypto).unwrap());

        let h3 = CoValueHeader::group(admin, json!("other"), 1000);
        assert_ne!(h1.id(&crypto).unwrap(), h3.id(&crypto).unwrap());
    }

    #[test]
    fn test_header_json_shape() {
        let group = CoId::from_bytes([9; 32]);
        let header = CoValueHeader::owned_by(CoValueKind::List, group, json!(null), 5);
        let value = serde_json::to_value(&header).unwrap();
        assert_eq!(value["type"], "colist");
        assert_eq!(value["ruleset"]["type"], "ownedByGroup");
        assert_eq!(value["ruleset"]["group"], group.to_string());
        assert_eq!(value["createdAt"], 5);

        let back: CoValueHeader = serde_json::from_value(value).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn test_priority_by_kind() {
        let admin = AgentSecret::from_seed(&[1; 32]).id();
        let group = CoId::from_bytes([9; 32]);
        assert_eq!(
            CoValueHeader::group(admin, json!(1), 0).priority(),
            Priority::High
        );
        assert_eq!(
            CoValueHeader::owned_by(CoValueKind::Map, group, json!(1), 0).priority(),
            Priority::Medium
        );
        assert_eq!(
            CoValueHeader::owned_by(CoValueKind::Stream, group, json!(1), 0).priority(),
            Priority::Low
        );
    }
}
