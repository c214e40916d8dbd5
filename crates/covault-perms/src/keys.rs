//! Read-key sharing and group change builders.
//!
//! A group's read key is never written in the clear unless the group is
//! public. It is sealed to each member with X25519 key agreement, or
//! encrypted with another read key so that holders of that key (members
//! of a parent group, or holders of a newer key of the same group) can
//! recover it.
//!
//! Group transactions carry exactly one change each, so every builder here
//! returns a list of changes to be appended one per transaction.

use covault_core::canonical::canonical_bytes;
use covault_core::{AgentId, AgentSecret, CoId, CoMap, CryptoProvider, KeyId, KeySecret};
use serde_json::{json, Value};

use crate::error::{PermsError, Result};
use crate::group::{GroupKey, Member, RevealTarget};
use crate::role::{ParentRole, Role};

const SEALED_PREFIX: &str = "sealed_";
const ENCRYPTED_PREFIX: &str = "encrypted_";

/// A fresh random read key.
pub fn new_read_key(crypto: &dyn CryptoProvider) -> (KeyId, KeySecret) {
    let mut id = [0u8; 8];
    id.copy_from_slice(&crypto.random_bytes(8));
    (KeyId::from_bytes(id), crypto.new_key_secret())
}

fn nonce_material(group: &CoId, key: &KeyId, target: &RevealTarget) -> Result<Vec<u8>> {
    let material = json!({
        "in": group.to_string(),
        "key": key.to_string(),
        "for": target.to_string(),
    });
    Ok(canonical_bytes(&material)?)
}

fn strip_hex(value: &str, prefix: &str) -> Result<Vec<u8>> {
    let hex_part = value
        .strip_prefix(prefix)
        .ok_or_else(|| PermsError::InvalidRevelation(format!("expected {}...", prefix)))?;
    hex::decode(hex_part).map_err(|e| PermsError::InvalidRevelation(e.to_string()))
}

fn key_secret_from(bytes: Vec<u8>) -> Result<KeySecret> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| PermsError::InvalidRevelation("key secret must be 32 bytes".into()))?;
    Ok(KeySecret::from_bytes(bytes))
}

/// Seal `secret` so that only `agent` can open it.
pub fn seal_key_for(
    crypto: &dyn CryptoProvider,
    group: &CoId,
    key: &KeyId,
    secret: &KeySecret,
    agent: &AgentId,
) -> Result<String> {
    let nonce = nonce_material(group, key, &RevealTarget::Agent(*agent))?;
    let sealed = crypto.seal(secret.as_bytes(), &agent.sealer, &nonce)?;
    Ok(format!("{}{}", SEALED_PREFIX, hex::encode(sealed)))
}

pub fn unseal_key(
    crypto: &dyn CryptoProvider,
    group: &CoId,
    key: &KeyId,
    sealed: &str,
    agent: &AgentSecret,
) -> Result<KeySecret> {
    let nonce = nonce_material(group, key, &RevealTarget::Agent(agent.id()))?;
    let bytes = crypto.unseal(&strip_hex(sealed, SEALED_PREFIX)?, &agent.sealer, &nonce)?;
    key_secret_from(bytes)
}

/// Encrypt `secret` with the key `with`.
pub fn encrypt_key_for_key(
    crypto: &dyn CryptoProvider,
    group: &CoId,
    key: &KeyId,
    secret: &KeySecret,
    with: (&KeyId, &KeySecret),
) -> Result<String> {
    let nonce = nonce_material(group, key, &RevealTarget::Key(with.0.clone()))?;
    let encrypted = crypto.encrypt(secret.as_bytes(), with.1, &nonce)?;
    Ok(format!("{}{}", ENCRYPTED_PREFIX, hex::encode(encrypted)))
}

pub fn decrypt_key_for_key(
    crypto: &dyn CryptoProvider,
    group: &CoId,
    key: &KeyId,
    encrypted: &str,
    with: (&KeyId, &KeySecret),
) -> Result<KeySecret> {
    let nonce = nonce_material(group, key, &RevealTarget::Key(with.0.clone()))?;
    let bytes = crypto.decrypt(&strip_hex(encrypted, ENCRYPTED_PREFIX)?, with.1, &nonce)?;
    key_secret_from(bytes)
}

// ─────────────────────────────────────────────────────────────────────────
// Change builders
// ─────────────────────────────────────────────────────────────────────────

pub fn set_role_change(member: &Member, role: Role) -> Value {
    CoMap::set_change(member.to_string(), role.as_str())
}

pub fn read_key_change(key: &KeyId) -> Value {
    CoMap::set_change(GroupKey::ReadKey.to_string(), key.to_string())
}

/// A revelation of `key` to `member`: sealed for an agent, plaintext for
/// everyone.
pub fn reveal_change(
    crypto: &dyn CryptoProvider,
    group: &CoId,
    key: (&KeyId, &KeySecret),
    member: &Member,
) -> Result<Value> {
    let (target, value) = match member {
        Member::Agent(agent) => (
            RevealTarget::Agent(*agent),
            seal_key_for(crypto, group, key.0, key.1, agent)?,
        ),
        Member::Everyone => (RevealTarget::Everyone, key.1.to_string()),
    };
    let field = GroupKey::Revelation {
        key: key.0.clone(),
        target,
    };
    Ok(CoMap::set_change(field.to_string(), value))
}

/// `key` encrypted with `with`, so that holders of `with` can read it.
pub fn reveal_to_key_change(
    crypto: &dyn CryptoProvider,
    group: &CoId,
    key: (&KeyId, &KeySecret),
    with: (&KeyId, &KeySecret),
) -> Result<Value> {
    let field = GroupKey::Revelation {
        key: key.0.clone(),
        target: RevealTarget::Key(with.0.clone()),
    };
    let value = encrypt_key_for_key(crypto, group, key.0, key.1, with)?;
    Ok(CoMap::set_change(field.to_string(), value))
}

/// Bootstrap a new group: the initial admin promotes itself, receives the
/// first read key and makes it current.
pub fn create_group_changes(
    crypto: &dyn CryptoProvider,
    group: &CoId,
    admin: &AgentId,
    key: (&KeyId, &KeySecret),
) -> Result<Vec<Value>> {
    let admin = Member::Agent(*admin);
    Ok(vec![
        set_role_change(&admin, Role::Admin),
        reveal_change(crypto, group, key, &admin)?,
        read_key_change(key.0),
    ])
}

/// Give `member` a role, and the current read key if the role can read.
pub fn add_member_changes(
    crypto: &dyn CryptoProvider,
    group: &CoId,
    member: &Member,
    role: Role,
    read_key: Option<(&KeyId, &KeySecret)>,
) -> Result<Vec<Value>> {
    let mut changes = vec![set_role_change(member, role)];
    // writeOnly members still need the key to encrypt what they write.
    if role != Role::Revoked {
        if let Some(key) = read_key {
            changes.push(reveal_change(crypto, group, key, member)?);
        }
    }
    Ok(changes)
}

/// Changes for `child` extending `parent`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendChanges {
    /// Written to the child group.
    pub child: Vec<Value>,
    /// Written to the parent group.
    pub parent: Vec<Value>,
}

/// Link `child` to `parent` and let holders of the parent's read key
/// decrypt the child's.
pub fn extend_changes(
    crypto: &dyn CryptoProvider,
    child: (&CoId, &KeyId, &KeySecret),
    parent: (&CoId, &KeyId, &KeySecret),
    mapping: ParentRole,
) -> Result<ExtendChanges> {
    let (child_id, child_key, child_secret) = child;
    let (parent_id, parent_key, parent_secret) = parent;
    Ok(ExtendChanges {
        child: vec![
            CoMap::set_change(GroupKey::Parent(*parent_id).to_string(), mapping.as_str()),
            reveal_to_key_change(
                crypto,
                child_id,
                (child_key, child_secret),
                (parent_key, parent_secret),
            )?,
        ],
        parent: vec![CoMap::set_change(
            GroupKey::Child(*child_id).to_string(),
            ParentRole::Extend.as_str(),
        )],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use covault_core::NativeCrypto;

    #[test]
    fn test_seal_roundtrip() {
        let crypto = NativeCrypto::new();
        let group = CoId::from_bytes([1; 32]);
        let alice = AgentSecret::from_seed(&[1; 32]);
        let mallory = AgentSecret::from_seed(&[2; 32]);
        let (key, secret) = new_read_key(&crypto);

        let sealed = seal_key_for(&crypto, &group, &key, &secret, &alice.id()).unwrap();
        assert!(sealed.starts_with("sealed_"));
        assert_eq!(unseal_key(&crypto, &group, &key, &sealed, &alice).unwrap(), secret);
        assert!(unseal_key(&crypto, &group, &key, &sealed, &mallory).is_err());

        let other_group = CoId::from_bytes([2; 32]);
        assert!(unseal_key(&crypto, &other_group, &key, &sealed, &alice).is_err());
    }

    #[test]
    fn test_key_for_key_roundtrip() {
        let crypto = NativeCrypto::new();
        let group = CoId::from_bytes([1; 32]);
        let (key, secret) = new_read_key(&crypto);
        let (parent_key, parent_secret) = new_read_key(&crypto);

        let encrypted =
            encrypt_key_for_key(&crypto, &group, &key, &secret, (&parent_key, &parent_secret))
                .unwrap();
        let decrypted =
            decrypt_key_for_key(&crypto, &group, &key, &encrypted, (&parent_key, &parent_secret))
                .unwrap();
        assert_eq!(decrypted, secret);

        let (_, wrong) = new_read_key(&crypto);
        assert!(decrypt_key_for_key(&crypto, &group, &key, &encrypted, (&parent_key, &wrong)).is_err());
    }

    #[test]
    fn test_public_revelation_is_plaintext() {
        let crypto = NativeCrypto::new();
        let group = CoId::from_bytes([1; 32]);
        let (key, secret) = new_read_key(&crypto);
        let change = reveal_change(&crypto, &group, (&key, &secret), &Member::Everyone).unwrap();
        assert_eq!(change["key"], json!(format!("{}_for_everyone", key)));
        assert_eq!(change["value"], json!(secret.to_string()));
    }

    #[test]
    fn test_revoked_member_gets_no_key() {
        let crypto = NativeCrypto::new();
        let group = CoId::from_bytes([1; 32]);
        let bob = Member::Agent(AgentSecret::from_seed(&[2; 32]).id());
        let (key, secret) = new_read_key(&crypto);

        let changes =
            add_member_changes(&crypto, &group, &bob, Role::Revoked, Some((&key, &secret))).unwrap();
        assert_eq!(changes.len(), 1);
        let changes =
            add_member_changes(&crypto, &group, &bob, Role::Reader, Some((&key, &secret))).unwrap();
        assert_eq!(changes.len(), 2);
    }
}
