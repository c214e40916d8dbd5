//! Transactions: the unit appended to a session.
//!
//! A transaction is either `trusting` (plaintext changes) or `private`
//! (changes encrypted with a group read key). Changes and meta are kept as
//! stringified JSON so that the bytes covered by signatures never depend on
//! re-serialization.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::{canonical_bytes, canonical_string, parse_json};
use crate::crypto::{CryptoProvider, KeySecret};
use crate::error::{CoreError, Result};
use crate::ids::KeyId;

/// Serialized changes larger than this are deflated before encryption.
pub const COMPRESSION_THRESHOLD_BYTES: usize = 1024;

/// Upper bound on inflated private changes, against compression bombs.
pub const MAX_DECOMPRESSED_BYTES: usize = 16 * 1024 * 1024;

const PLAIN_PREFIX: char = 'z';
const DEFLATE_PREFIX: char = 'c';

/// How a new local transaction should be written.
#[derive(Debug, Clone, Copy)]
pub enum Privacy<'a> {
    Trusting,
    Private { key_id: &'a KeyId, key: &'a KeySecret },
}

/// One entry in a session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "privacy")]
pub enum Transaction {
    #[serde(rename = "trusting", rename_all = "camelCase")]
    Trusting {
        made_at: i64,
        changes: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<String>,
    },

    #[serde(rename = "private", rename_all = "camelCase")]
    Private {
        made_at: i64,
        key_used: KeyId,
        encrypted_changes: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<String>,
    },
}

impl Transaction {
    /// Build a plaintext transaction.
    pub fn trusting(changes: &[Value], meta: Option<&Value>, made_at: i64) -> Result<Self> {
        Ok(Transaction::Trusting {
            made_at,
            changes: canonical_string(changes)?,
            meta: meta.map(canonical_string).transpose()?,
        })
    }

    /// Build an encrypted transaction. `nonce_material` must be unique per
    /// transaction (see [`crate::canonical::transaction_nonce_material`]).
    pub fn private(
        changes: &[Value],
        meta: Option<&Value>,
        made_at: i64,
        key_id: &KeyId,
        key: &KeySecret,
        nonce_material: &[u8],
        crypto: &dyn CryptoProvider,
    ) -> Result<Self> {
        let plain = canonical_string(changes)?;

        let (prefix, body) = if plain.len() > COMPRESSION_THRESHOLD_BYTES {
            (DEFLATE_PREFIX, deflate(plain.as_bytes())?)
        } else {
            (PLAIN_PREFIX, plain.into_bytes())
        };

        let ciphertext = crypto.encrypt(&body, key, nonce_material)?;

        Ok(Transaction::Private {
            made_at,
            key_used: key_id.clone(),
            encrypted_changes: format!("{}{}", prefix, hex::encode(ciphertext)),
            meta: meta.map(canonical_string).transpose()?,
        })
    }

    pub fn made_at(&self) -> i64 {
        match self {
            Transaction::Trusting { made_at, .. } | Transaction::Private { made_at, .. } => {
                *made_at
            }
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Transaction::Private { .. })
    }

    pub fn key_used(&self) -> Option<&KeyId> {
        match self {
            Transaction::Private { key_used, .. } => Some(key_used),
            Transaction::Trusting { .. } => None,
        }
    }

    /// Parsed meta, `None` when absent or malformed.
    pub fn meta(&self) -> Option<Value> {
        let raw = match self {
            Transaction::Trusting { meta, .. } | Transaction::Private { meta, .. } => meta,
        };
        raw.as_deref().and_then(parse_json)
    }

    /// The first-writer-wins key, if this transaction competes for one.
    pub fn fww_key(&self) -> Option<String> {
        self.meta()?.get("fww")?.as_str().map(str::to_owned)
    }

    /// Whether this transaction marks its CoValue as deleted.
    pub fn is_deletion(&self) -> bool {
        self.meta()
            .and_then(|m| m.get("deleted").and_then(Value::as_bool))
            .unwrap_or(false)
    }

    /// Plaintext changes of a trusting transaction.
    pub fn trusting_changes(&self) -> Option<Vec<Value>> {
        match self {
            Transaction::Trusting { changes, .. } => serde_json::from_str(changes).ok(),
            Transaction::Private { .. } => None,
        }
    }

    /// Decrypt (and inflate) the changes of a private transaction.
    pub fn decrypt_changes(
        &self,
        key: &KeySecret,
        nonce_material: &[u8],
        crypto: &dyn CryptoProvider,
    ) -> Result<Vec<Value>> {
        let encrypted = match self {
            Transaction::Private {
                encrypted_changes, ..
            } => encrypted_changes,
            Transaction::Trusting { .. } => {
                return Err(CoreError::DecryptionError("transaction is not private".into()))
            }
        };

        let mut chars = encrypted.chars();
        let prefix = chars.next();
        let ciphertext = hex::decode(chars.as_str())
            .map_err(|e| CoreError::DecodingError(e.to_string()))?;
        let body = crypto.decrypt(&ciphertext, key, nonce_material)?;

        let plain = match prefix {
            Some(DEFLATE_PREFIX) => inflate(&body)?,
            Some(PLAIN_PREFIX) => body,
            _ => return Err(CoreError::DecodingError("unknown encryption prefix".into())),
        };

        serde_json::from_slice(&plain).map_err(|e| CoreError::DecodingError(e.to_string()))
    }

    /// The bytes this transaction contributes to its session's hash chain.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical_bytes(self)
    }

    /// Approximate wire size, used for checkpoint and chunk accounting.
    pub fn size(&self) -> usize {
        match self {
            Transaction::Trusting { changes, meta, .. } => {
                changes.len() + meta.as_ref().map_or(0, String::len)
            }
            Transaction::Private {
                encrypted_changes,
                meta,
                ..
            } => encrypted_changes.len() + meta.as_ref().map_or(0, String::len),
        }
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CoreError::EncodingError(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CoreError::EncodingError(e.to_string()))
}

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = decoder
            .read(&mut buffer)
            .map_err(|e| CoreError::DecodingError(e.to_string()))?;
        if read == 0 {
            break;
        }
        if out.len() + read > MAX_DECOMPRESSED_BYTES {
            return Err(CoreError::DecodingError(format!(
                "private changes exceed {} bytes when inflated",
                MAX_DECOMPRESSED_BYTES
            )));
        }
        out.extend_from_slice(&buffer[..read]);
    }

    Ok(out)
}
