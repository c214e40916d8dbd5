//! Replicated growable array.
//!
//! Every inserted item is addressed by the [`OpId`] of the change that
//! inserted it. Inserts name an anchor (`after` an item or the start,
//! `before` an item or the end) and deletes name the insertion they remove,
//! so concurrent edits converge no matter the order they are applied in.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::covalue::DecodedTransaction;
use crate::ids::{SessionId, TransactionId};

/// Address of a single change: its transaction and position within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    #[serde(rename = "sessionID")]
    pub session: SessionId,
    #[serde(rename = "txIndex")]
    pub tx_index: u32,
    #[serde(rename = "changeIdx")]
    pub change_idx: u32,
}

impl OpId {
    pub fn new(tx: &TransactionId, change_idx: u32) -> Self {
        Self {
            session: tx.session.clone(),
            tx_index: tx.index,
            change_idx,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Edge {
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "end")]
    End,
}

/// Where an insert attaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Anchor {
    Op(OpId),
    Edge(Edge),
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A change to a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum ListOp {
    #[serde(rename = "app")]
    Append {
        #[serde(default)]
        value: Value,
        after: Anchor,
        #[serde(default, skip_serializing_if = "is_false")]
        compacted: bool,
    },
    #[serde(rename = "pre")]
    Prepend {
        #[serde(default)]
        value: Value,
        before: Anchor,
        #[serde(default, skip_serializing_if = "is_false")]
        compacted: bool,
    },
    #[serde(rename = "del")]
    Delete { insertion: OpId },
}

#[derive(Debug, Clone, PartialEq)]
struct Insertion {
    value: Value,
    made_at: i64,
}

/// Siblings are ordered by `(madeAt, OpId)`.
type SortKey = (i64, OpId);

fn insert_sorted(list: &mut Vec<SortKey>, key: SortKey) {
    if let Err(pos) = list.binary_search(&key) {
        list.insert(pos, key);
    }
}

/// One visible item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListEntry<'a> {
    pub op_id: &'a OpId,
    pub value: &'a Value,
    pub made_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoList {
    insertions: BTreeMap<OpId, Insertion>,
    successors: BTreeMap<OpId, Vec<SortKey>>,
    predecessors: BTreeMap<OpId, Vec<SortKey>>,
    after_start: Vec<SortKey>,
    before_end: Vec<SortKey>,
    deleted: BTreeSet<OpId>,
}

impl CoList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, tx: &DecodedTransaction) {
        for (idx, change) in tx.changes.iter().enumerate() {
            let op: ListOp = match serde_json::from_value(change.clone()) {
                Ok(op) => op,
                Err(e) => {
                    warn!(tx = %tx.id, error = %e, "skipping malformed list change");
                    continue;
                }
            };
            let op_id = OpId::new(&tx.id, idx as u32);
            let key = (tx.made_at, op_id.clone());

            match op {
                ListOp::Append { value, after, .. } => {
                    match after {
                        Anchor::Op(anchor) => {
                            insert_sorted(self.successors.entry(anchor).or_default(), key)
                        }
                        Anchor::Edge(Edge::Start) => insert_sorted(&mut self.after_start, key),
                        Anchor::Edge(Edge::End) => {
                            warn!(tx = %tx.id, "append after end, treating as end");
                            insert_sorted(&mut self.before_end, key)
                        }
                    }
                    self.insertions.insert(op_id, Insertion { value, made_at: tx.made_at });
                }
                ListOp::Prepend { value, before, .. } => {
                    match before {
                        Anchor::Op(anchor) => {
                            insert_sorted(self.predecessors.entry(anchor).or_default(), key)
                        }
                        Anchor::Edge(Edge::End) => insert_sorted(&mut self.before_end, key),
                        Anchor::Edge(Edge::Start) => {
                            warn!(tx = %tx.id, "prepend before start, treating as start");
                            insert_sorted(&mut self.after_start, key)
                        }
                    }
                    self.insertions.insert(op_id, Insertion { value, made_at: tx.made_at });
                }
                ListOp::Delete { insertion } => {
                    self.deleted.insert(insertion);
                }
            }
        }
    }

    /// Visible items in list order.
    ///
    /// Newer inserts after the same anchor come first; newer inserts before
    /// the same anchor come last. Items whose anchor is not known yet stay
    /// hidden until it arrives.
    pub fn entries(&self) -> Vec<ListEntry<'_>> {
        let mut out = Vec::new();
        for (_, root) in self.after_start.iter().rev() {
            self.walk(root, &mut out);
        }
        for (_, root) in &self.before_end {
            self.walk(root, &mut out);
        }
        out
    }

    fn walk<'a>(&'a self, root: &'a OpId, out: &mut Vec<ListEntry<'a>>) {
        enum Step<'a> {
            Enter(&'a OpId),
            Emit(&'a OpId),
        }

        let mut stack = vec![Step::Enter(root)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(id) => {
                    for (_, succ) in self.successors.get(id).into_iter().flatten() {
                        stack.push(Step::Enter(succ));
                    }
                    stack.push(Step::Emit(id));
                    for (_, pred) in self.predecessors.get(id).into_iter().flatten().rev() {
                        stack.push(Step::Enter(pred));
                    }
                }
                Step::Emit(id) => {
                    if self.deleted.contains(id) {
                        continue;
                    }
                    if let Some(ins) = self.insertions.get(id) {
                        out.push(ListEntry {
                            op_id: id,
                            value: &ins.value,
                            made_at: ins.made_at,
                        });
                    }
                }
            }
        }
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.entries().into_iter().map(|e| e.value.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.entries().get(index).map(|e| e.value.clone())
    }

    fn anchor_after(&self, index: Option<usize>) -> Option<Anchor> {
        match index {
            None => Some(Anchor::Edge(Edge::Start)),
            Some(i) => self
                .entries()
                .get(i)
                .map(|e| Anchor::Op(e.op_id.clone())),
        }
    }

    fn anchor_before(&self, index: usize) -> Option<Anchor> {
        let entries = self.entries();
        if index == entries.len() {
            return Some(Anchor::Edge(Edge::End));
        }
        entries.get(index).map(|e| Anchor::Op(e.op_id.clone()))
    }

    /// Change inserting `value` after the item at `index` (`None` for the start).
    pub fn insert_after_change(&self, index: Option<usize>, value: Value) -> Option<Value> {
        let after = self.anchor_after(index)?;
        serde_json::to_value(ListOp::Append {
            value,
            after,
            compacted: false,
        })
        .ok()
    }

    /// Change appending `value` at the end.
    pub fn push_change(&self, value: Value) -> Option<Value> {
        self.insert_after_change(self.len().checked_sub(1), value)
    }

    /// Change inserting `value` before the item at `index` (`len()` for the end).
    pub fn insert_before_change(&self, index: usize, value: Value) -> Option<Value> {
        let before = self.anchor_before(index)?;
        serde_json::to_value(ListOp::Prepend {
            value,
            before,
            compacted: false,
        })
        .ok()
    }

    /// Changes inserting `values` in order after the item at `index`.
    ///
    /// All changes share one anchor; they are emitted last-first so that the
    /// newest-first sibling order puts them back in sequence.
    pub fn insert_many_after_changes(
        &self,
        index: Option<usize>,
        values: impl IntoIterator<Item = Value>,
    ) -> Option<Vec<Value>> {
        let after = self.anchor_after(index)?;
        let mut values: Vec<Value> = values.into_iter().collect();
        values.reverse();
        values
            .into_iter()
            .map(|value| {
                serde_json::to_value(ListOp::Append {
                    value,
                    after: after.clone(),
                    compacted: false,
                })
                .ok()
            })
            .collect()
    }

    /// Change removing the item at `index`.
    pub fn delete_change(&self, index: usize) -> Option<Value> {
        let insertion = self.entries().get(index)?.op_id.clone();
        serde_json::to_value(ListOp::Delete { insertion }).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tx(session: &str, index: u32, made_at: i64, changes: Vec<Value>) -> DecodedTransaction {
        DecodedTransaction {
            id: TransactionId::new(SessionId::from_raw(session), index),
            made_at,
            changes,
            meta: None,
        }
    }

    #[test]
    fn test_push_sequence() {
        let mut list = CoList::new();
        for (i, v) in ["a", "b", "c"].iter().enumerate() {
            let change = list.push_change(json!(v)).unwrap();
            list.apply(&tx("s", i as u32, i as i64, vec![change]));
        }
        assert_eq!(list.to_vec(), vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn test_insert_many_keeps_order() {
        let mut list = CoList::new();
        let changes = list
            .insert_many_after_changes(None, vec![json!(1), json!(2), json!(3)])
            .unwrap();
        list.apply(&tx("s", 0, 0, changes));
        assert_eq!(list.to_vec(), vec![json!(1), json!(2), json!(3)]);

        let more = list
            .insert_many_after_changes(Some(0), vec![json!("x"), json!("y")])
            .unwrap();
        list.apply(&tx("s", 1, 1, more));
        assert_eq!(
            list.to_vec(),
            vec![json!(1), json!("x"), json!("y"), json!(2), json!(3)]
        );
    }

    #[test]
    fn test_prepend_before_item_and_end() {
        let mut list = CoList::new();
        list.apply(&tx("s", 0, 0, vec![list.push_change(json!("z")).unwrap()]));

        let before_z = list.insert_before_change(0, json!("a")).unwrap();
        list.apply(&tx("s", 1, 1, vec![before_z]));
        let before_z_again = list.insert_before_change(1, json!("b")).unwrap();
        list.apply(&tx("s", 2, 2, vec![before_z_again]));
        let at_end = list.insert_before_change(3, json!("end")).unwrap();
        list.apply(&tx("s", 3, 3, vec![at_end]));

        assert_eq!(
            list.to_vec(),
            vec![json!("a"), json!("b"), json!("z"), json!("end")]
        );
    }

    #[test]
    fn test_delete() {
        let mut list = CoList::new();
        let changes = list
            .insert_many_after_changes(None, vec![json!(1), json!(2)])
            .unwrap();
        list.apply(&tx("s", 0, 0, changes));
        let del = list.delete_change(0).unwrap();
        list.apply(&tx("s", 1, 1, vec![del]));
        assert_eq!(list.to_vec(), vec![json!(2)]);
        assert!(list.delete_change(5).is_none());
    }

    #[test]
    fn test_concurrent_inserts_converge() {
        let mut base = CoList::new();
        base.apply(&tx("s", 0, 0, vec![base.push_change(json!("root")).unwrap()]));

        let from_a = tx("a", 0, 5, vec![base.push_change(json!("A")).unwrap()]);
        let from_b = tx("b", 0, 6, vec![base.push_change(json!("B")).unwrap()]);
        let del_root = tx("c", 0, 7, vec![base.delete_change(0).unwrap()]);

        let mut one = base.clone();
        one.apply(&from_a);
        one.apply(&from_b);
        one.apply(&del_root);

        let mut two = base.clone();
        two.apply(&del_root);
        two.apply(&from_b);
        two.apply(&from_a);

        assert_eq!(one.to_vec(), two.to_vec());
        assert_eq!(one.to_vec(), vec![json!("B"), json!("A")]);
    }

    #[test]
    fn test_orphan_waits_for_anchor() {
        let mut source = CoList::new();
        let first = tx("s", 0, 0, vec![source.push_change(json!(1)).unwrap()]);
        source.apply(&first);
        let second = tx("s", 1, 1, vec![source.push_change(json!(2)).unwrap()]);

        let mut list = CoList::new();
        list.apply(&second);
        assert!(list.is_empty());
        list.apply(&first);
        assert_eq!(list.to_vec(), vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_wire_shape() {
        let list = CoList::new();
        let change = list.push_change(json!("v")).unwrap();
        assert_eq!(change, json!({"op": "app", "value": "v", "after": "start"}));
    }
}
