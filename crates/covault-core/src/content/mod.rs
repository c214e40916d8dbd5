//! Content materializers: fold a CoValue's valid transactions into a value.
//!
//! Each reducer is order-independent, so [`MaterializedContent`] can apply
//! newly valid transactions as they come and only starts over when the
//! CoValue reports that previously valid transactions flipped.

pub mod list;
pub mod map;
pub mod plaintext;
pub mod stream;

use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

use crate::covalue::{CoValueCore, DecodedTransaction};
use crate::gate::KeySource;
use crate::header::CoValueKind;
use crate::ids::TransactionId;

pub use list::{CoList, ListOp, OpId};
pub use map::{CoMap, MapOp};
pub use plaintext::CoPlainText;
pub use stream::{binary_changes, BinaryStream, CoStream};

/// The current value of a CoValue.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Map(CoMap),
    List(CoList),
    PlainText(CoPlainText),
    Stream(CoStream),
}

impl Content {
    pub fn empty(kind: CoValueKind) -> Self {
        match kind {
            CoValueKind::Map => Content::Map(CoMap::new()),
            CoValueKind::List => Content::List(CoList::new()),
            CoValueKind::PlainText => Content::PlainText(CoPlainText::new()),
            CoValueKind::Stream => Content::Stream(CoStream::new()),
        }
    }

    pub fn apply(&mut self, tx: &DecodedTransaction) {
        match self {
            Content::Map(map) => map.apply(tx),
            Content::List(list) => list.apply(tx),
            Content::PlainText(text) => text.apply(tx),
            Content::Stream(stream) => stream.apply(tx),
        }
    }

    pub fn as_map(&self) -> Option<&CoMap> {
        match self {
            Content::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&CoList> {
        match self {
            Content::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_plain_text(&self) -> Option<&CoPlainText> {
        match self {
            Content::PlainText(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&CoStream> {
        match self {
            Content::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    /// A JSON rendering of the current value.
    pub fn to_json(&self) -> Value {
        match self {
            Content::Map(map) => map.to_json(),
            Content::List(list) => Value::Array(list.to_vec()),
            Content::PlainText(text) => Value::String(text.to_string()),
            Content::Stream(stream) => stream.to_json(),
        }
    }
}

/// Content kept in step with a [`CoValueCore`].
#[derive(Debug, Clone)]
pub struct MaterializedContent {
    kind: CoValueKind,
    content: Content,
    applied: HashSet<TransactionId>,
    epoch: Option<u64>,
    rebuilds: u64,
}

impl MaterializedContent {
    pub fn new(kind: CoValueKind) -> Self {
        Self {
            kind,
            content: Content::empty(kind),
            applied: HashSet::new(),
            epoch: None,
            rebuilds: 0,
        }
    }

    /// Build content for `core` from scratch.
    pub fn from_core(core: &CoValueCore, keys: &dyn KeySource) -> Self {
        let mut content = Self::new(core.header().kind);
        content.update(core, keys);
        content
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    /// How many times content was thrown away and rebuilt.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Apply whatever became valid since the last update. Returns whether
    /// anything changed.
    ///
    /// Transactions whose read key is not available yet are retried on the
    /// next update.
    pub fn update(&mut self, core: &CoValueCore, keys: &dyn KeySource) -> bool {
        let mut changed = false;

        if let Some(epoch) = self.epoch {
            if epoch != core.epoch() {
                debug!(co = %core.id(), "rebuilding content");
                self.content = Content::empty(self.kind);
                self.applied.clear();
                self.rebuilds += 1;
                changed = true;
            }
        }
        self.epoch = Some(core.epoch());

        for (key, tx) in core.valid_sorted_transactions(false) {
            if self.applied.contains(&key.id) {
                continue;
            }
            if let Some(decoded) = core.decode(key, tx, keys) {
                self.content.apply(&decoded);
                self.applied.insert(key.id.clone());
                changed = true;
            }
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covalue::ValidityChange;
    use crate::crypto::{AgentSecret, CryptoProvider, NativeCrypto};
    use crate::gate::{AllowAll, NoKeys};
    use crate::header::{CoValueHeader, Ruleset};
    use crate::ids::SessionId;
    use crate::new_content::ChunkLimits;
    use crate::transaction::Privacy;
    use serde_json::json;
    use std::sync::Arc;

    fn header() -> CoValueHeader {
        CoValueHeader {
            kind: CoValueKind::Map,
            ruleset: Ruleset::UnsafeAllowAll,
            meta: None,
            uniqueness: json!("content"),
            created_at: None,
        }
    }

    #[test]
    fn test_late_fww_winner_rebuilds_exactly_once() {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(NativeCrypto::new());
        let alice = AgentSecret::from_seed(&[1; 32]);
        let bob = AgentSecret::from_seed(&[2; 32]);
        let fww = json!({"fww": "K"});

        let mut core = CoValueCore::new(header(), crypto.clone()).unwrap();
        let a = SessionId::new(&alice.id(), &[0; 8]);
        core.append_transaction(
            &alice,
            &a,
            &[CoMap::set_change("K", json!("A"))],
            Privacy::Trusting,
            Some(&fww),
            5,
        )
        .unwrap();
        core.refresh_validity(&AllowAll);

        let mut content = MaterializedContent::from_core(&core, &NoKeys);
        assert_eq!(content.content().as_map().unwrap().get("K"), Some(&json!("A")));
        assert_eq!(content.rebuilds(), 0);

        let mut other = CoValueCore::new(header(), crypto).unwrap();
        let b = SessionId::new(&bob.id(), &[0; 8]);
        other
            .append_transaction(
                &bob,
                &b,
                &[CoMap::set_change("K", json!("B"))],
                Privacy::Trusting,
                Some(&fww),
                3,
            )
            .unwrap();
        for msg in other.new_content_since(Some(&core.known_state()), ChunkLimits::UNLIMITED) {
            for (session, c) in msg.new {
                core.ingest(&session, c.after, c.new_transactions, &c.last_signature)
                    .unwrap();
            }
        }

        assert_eq!(core.refresh_validity(&AllowAll), ValidityChange::Flipped);
        assert!(content.update(&core, &NoKeys));
        assert_eq!(content.content().as_map().unwrap().get("K"), Some(&json!("B")));
        assert_eq!(content.rebuilds(), 1);

        assert!(!content.update(&core, &NoKeys));
        assert_eq!(content.rebuilds(), 1);
    }

    #[test]
    fn test_incremental_updates_do_not_rebuild() {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(NativeCrypto::new());
        let alice = AgentSecret::from_seed(&[1; 32]);
        let session = SessionId::new(&alice.id(), &[0; 8]);
        let mut core = CoValueCore::new(header(), crypto).unwrap();
        let mut content = MaterializedContent::new(CoValueKind::Map);

        for i in 0..3 {
            core.append_transaction(
                &alice,
                &session,
                &[CoMap::set_change(format!("k{}", i), json!(i))],
                Privacy::Trusting,
                None,
                i,
            )
            .unwrap();
            core.refresh_validity(&AllowAll);
            assert!(content.update(&core, &NoKeys));
        }

        assert_eq!(content.content().as_map().unwrap().len(), 3);
        assert_eq!(content.rebuilds(), 0);
        assert_eq!(content.content().to_json(), json!({"k0": 0, "k1": 1, "k2": 2}));
    }
}
