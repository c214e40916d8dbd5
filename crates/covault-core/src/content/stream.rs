//! Per-session append logs, e.g. for presence or file chunks.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::covalue::{DecodedTransaction, OrderKey};
use crate::ids::{AgentId, SessionId};

/// One item pushed into a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    pub value: Value,
    pub at: OrderKey,
    pub change_idx: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoStream {
    sessions: BTreeMap<SessionId, Vec<StreamItem>>,
}

impl CoStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, tx: &DecodedTransaction) {
        let at = tx.order_key();
        let items = self.sessions.entry(tx.id.session.clone()).or_default();
        for (idx, value) in tx.changes.iter().enumerate() {
            let item = StreamItem {
                value: value.clone(),
                at: at.clone(),
                change_idx: idx as u32,
            };
            let pos = items.partition_point(|i| (&i.at, i.change_idx) < (&item.at, item.change_idx));
            items.insert(pos, item);
        }
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.sessions.keys()
    }

    pub fn items(&self, session: &SessionId) -> &[StreamItem] {
        self.sessions.get(session).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn last_item(&self, session: &SessionId) -> Option<&StreamItem> {
        self.items(session).last()
    }

    /// The most recent item pushed by `agent` across all of its sessions.
    pub fn last_item_by(&self, agent: &AgentId) -> Option<&StreamItem> {
        self.sessions
            .iter()
            .filter(|(session, _)| session.agent().ok().as_ref() == Some(agent))
            .filter_map(|(_, items)| items.last())
            .max_by(|a, b| (&a.at, a.change_idx).cmp(&(&b.at, b.change_idx)))
    }

    /// All items across sessions in `(madeAt, session, index)` order.
    pub fn all_items(&self) -> Vec<&StreamItem> {
        let mut all: Vec<&StreamItem> = self.sessions.values().flatten().collect();
        all.sort_by(|a, b| (&a.at, a.change_idx).cmp(&(&b.at, b.change_idx)));
        all
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.sessions
                .iter()
                .map(|(session, items)| {
                    (
                        session.to_string(),
                        Value::Array(items.iter().map(|i| i.value.clone()).collect()),
                    )
                })
                .collect(),
        )
    }

    /// Reassemble a binary upload written by [`binary_changes`] in `session`.
    pub fn binary(&self, session: &SessionId) -> Option<BinaryStream> {
        let mut items = self.items(session).iter();
        let start = items.next()?;
        if start.value.get("type")?.as_str()? != "start" {
            return None;
        }

        let mut stream = BinaryStream {
            mime_type: start.value.get("mimeType")?.as_str()?.to_string(),
            file_name: start
                .value
                .get("fileName")
                .and_then(Value::as_str)
                .map(str::to_string),
            total_size: start.value.get("totalSizeBytes").and_then(Value::as_u64),
            data: Vec::new(),
            finished: false,
        };

        for item in items {
            match item.value.get("type").and_then(Value::as_str) {
                Some("chunk") => {
                    let encoded = item.value.get("chunk")?.as_str()?.strip_prefix(BINARY_PREFIX)?;
                    stream.data.extend(hex::decode(encoded).ok()?);
                }
                Some("end") => {
                    stream.finished = true;
                    break;
                }
                _ => return None,
            }
        }
        Some(stream)
    }
}

const BINARY_PREFIX: &str = "binary_";

/// A reassembled binary upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryStream {
    pub mime_type: String,
    pub file_name: Option<String>,
    pub total_size: Option<u64>,
    pub data: Vec<u8>,
    pub finished: bool,
}

/// Stream changes that upload `data` in chunks of at most `chunk_size` bytes.
pub fn binary_changes(
    mime_type: &str,
    file_name: Option<&str>,
    data: &[u8],
    chunk_size: usize,
) -> Vec<Value> {
    let mut start = json!({
        "type": "start",
        "mimeType": mime_type,
        "totalSizeBytes": data.len(),
    });
    if let Some(name) = file_name {
        start["fileName"] = json!(name);
    }

    let mut changes = vec![start];
    for chunk in data.chunks(chunk_size.max(1)) {
        changes.push(json!({
            "type": "chunk",
            "chunk": format!("{}{}", BINARY_PREFIX, hex::encode(chunk)),
        }));
    }
    changes.push(json!({ "type": "end" }));
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AgentSecret;
    use crate::ids::TransactionId;

    fn tx(session: &SessionId, index: u32, made_at: i64, changes: Vec<Value>) -> DecodedTransaction {
        DecodedTransaction {
            id: TransactionId::new(session.clone(), index),
            made_at,
            changes,
            meta: None,
        }
    }

    #[test]
    fn test_sessions_are_independent() {
        let alice = AgentSecret::from_seed(&[1; 32]).id();
        let bob = AgentSecret::from_seed(&[2; 32]).id();
        let a = SessionId::new(&alice, &[0; 4]);
        let b = SessionId::new(&bob, &[0; 4]);

        let mut stream = CoStream::new();
        stream.apply(&tx(&a, 1, 20, vec![json!("a2")]));
        stream.apply(&tx(&b, 0, 15, vec![json!("b1")]));
        stream.apply(&tx(&a, 0, 10, vec![json!("a1")]));

        let a_items: Vec<_> = stream.items(&a).iter().map(|i| i.value.clone()).collect();
        assert_eq!(a_items, vec![json!("a1"), json!("a2")]);
        assert_eq!(stream.last_item_by(&bob).unwrap().value, json!("b1"));

        let all: Vec<_> = stream.all_items().iter().map(|i| i.value.clone()).collect();
        assert_eq!(all, vec![json!("a1"), json!("b1"), json!("a2")]);
    }

    #[test]
    fn test_binary_roundtrip() {
        let agent = AgentSecret::from_seed(&[1; 32]).id();
        let session = SessionId::new(&agent, &[0; 4]);
        let data: Vec<u8> = (0..=255).collect();

        let mut stream = CoStream::new();
        let changes = binary_changes("application/octet-stream", Some("f.bin"), &data, 100);
        assert_eq!(changes.len(), 5);
        stream.apply(&tx(&session, 0, 1, changes));

        let binary = stream.binary(&session).unwrap();
        assert!(binary.finished);
        assert_eq!(binary.data, data);
        assert_eq!(binary.total_size, Some(256));
        assert_eq!(binary.file_name.as_deref(), Some("f.bin"));
    }
}
