//! Canonical JSON encoding.
//!
//! Everything that is hashed or signed (headers, transactions, nonce
//! material) is first converted to a `serde_json::Value` and then written
//! out. `serde_json` keeps object keys in a `BTreeMap`, so the output has
//! sorted keys and no insignificant whitespace, which makes it a stable
//! byte representation across peers.

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::ids::{CoId, TransactionId};

/// Canonical bytes of any serializable value.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Canonical string form, for values stored as stringified JSON.
pub fn canonical_string<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&value)?)
}

/// Nonce material for a private transaction: `{"in": <CoId>, "tx": <TransactionId>}`.
pub fn transaction_nonce_material(id: &CoId, tx: &TransactionId) -> Result<Vec<u8>> {
    canonical_bytes(&serde_json::json!({ "in": id, "tx": tx }))
}

/// Parse stringified JSON, returning `None` for anything malformed.
pub fn parse_json(s: &str) -> Option<Value> {
    serde_json::from_str(s).ok()
}
