//! Last-writer-wins map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::covalue::{DecodedTransaction, OrderKey};

/// A change to a map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum MapOp {
    #[serde(rename = "set")]
    Set { key: String, value: Value },
    #[serde(rename = "del")]
    Delete { key: String },
}

impl MapOp {
    pub fn key(&self) -> &str {
        match self {
            MapOp::Set { key, .. } | MapOp::Delete { key } => key,
        }
    }
}

/// The winning write for one key. `value` is `None` after a delete.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    pub value: Option<Value>,
    pub at: OrderKey,
    pub change_idx: u32,
}

/// Key to value, where the write with the greatest
/// `(madeAt, session, index, change index)` wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoMap {
    entries: BTreeMap<String, MapEntry>,
}

impl CoMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, tx: &DecodedTransaction) {
        let at = tx.order_key();
        for (idx, change) in tx.changes.iter().enumerate() {
            let op: MapOp = match serde_json::from_value(change.clone()) {
                Ok(op) => op,
                Err(e) => {
                    warn!(tx = %tx.id, error = %e, "skipping malformed map change");
                    continue;
                }
            };
            let change_idx = idx as u32;

            let newer = self.entries.get(op.key()).map_or(true, |existing| {
                (&at, change_idx) > (&existing.at, existing.change_idx)
            });
            if !newer {
                continue;
            }

            let (key, value) = match op {
                MapOp::Set { key, value } => (key, Some(value)),
                MapOp::Delete { key } => (key, None),
            };
            self.entries.insert(
                key,
                MapEntry {
                    value,
                    at: at.clone(),
                    change_idx,
                },
            );
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)?.value.as_ref()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// The last write to `key`, including deletes.
    pub fn last_edit(&self, key: &str) -> Option<&MapEntry> {
        self.entries.get(key)
    }

    /// Live entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries
            .iter()
            .filter_map(|(k, e)| e.value.as_ref().map(|v| (k.as_str(), v)))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries().map(|(k, _)| k)
    }

    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.entries()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    pub fn set_change(key: impl Into<String>, value: impl Into<Value>) -> Value {
        let value: Value = value.into();
        serde_json::json!({ "op": "set", "key": key.into(), "value": value })
    }

    pub fn delete_change(key: impl Into<String>) -> Value {
        serde_json::json!({ "op": "del", "key": key.into() })
    }
}
