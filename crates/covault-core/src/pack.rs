//! Compact array encoding for map and list changes.
//!
//! Changes are written into transactions packed: objects become arrays in a
//! fixed key order, map ops use numeric codes, and a run of list appends
//! sharing one anchor collapses into a single header op followed by bare
//! values. Unpacking accepts both packed and unpacked input.

use serde_json::{Map, Value};

use crate::header::CoValueKind;

pub const LIST_KEYS_APPEND: &[&str] = &["op", "value", "after", "compacted"];
pub const LIST_KEYS_PREPEND: &[&str] = &["op", "value", "before", "compacted"];
pub const LIST_KEYS_DELETE: &[&str] = &["op", "insertion", "compacted"];

pub const MAP_KEYS_SET: &[&str] = &["op", "key", "value"];
pub const MAP_KEYS_DELETE: &[&str] = &["op", "key"];

const MAP_OP_SET: u64 = 1;
const MAP_OP_DELETE: u64 = 2;

/// Values of `obj` in `keys` order, with trailing nulls dropped.
/// Missing keys become null.
pub fn pack_object_to_array(keys: &[&str], obj: &Map<String, Value>) -> Vec<Value> {
    let mut arr: Vec<Value> = keys
        .iter()
        .map(|k| obj.get(*k).cloned().unwrap_or(Value::Null))
        .collect();
    while matches!(arr.last(), Some(Value::Null)) {
        arr.pop();
    }
    arr
}

/// Inverse of [`pack_object_to_array`]. Nulls are skipped.
pub fn unpack_array_to_object(keys: &[&str], arr: &[Value]) -> Map<String, Value> {
    keys.iter()
        .zip(arr)
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn list_keys(op: &str) -> Option<&'static [&'static str]> {
    match op {
        "app" => Some(LIST_KEYS_APPEND),
        "pre" => Some(LIST_KEYS_PREPEND),
        "del" => Some(LIST_KEYS_DELETE),
        _ => None,
    }
}

fn pack_list_op(change: &Value) -> Value {
    match change.as_object() {
        Some(obj) => match obj.get("op").and_then(Value::as_str).and_then(list_keys) {
            Some(keys) => Value::Array(pack_object_to_array(keys, obj)),
            None => change.clone(),
        },
        None => change.clone(),
    }
}

fn unpack_list_op(packed: &Value) -> Value {
    match packed.as_array() {
        Some(arr) => match arr.first().and_then(Value::as_str).and_then(list_keys) {
            Some(keys) => Value::Object(unpack_array_to_object(keys, arr)),
            None => packed.clone(),
        },
        None => packed.clone(),
    }
}

/// Pack list changes, compacting a run of appends with one shared anchor.
pub fn pack_list_changes(changes: &[Value]) -> Vec<Value> {
    let compactable = changes.len() > 1
        && changes.iter().all(|c| c.get("op").and_then(Value::as_str) == Some("app"))
        && changes
            .iter()
            .all(|c| c.get("after") == changes[0].get("after"));

    if !compactable {
        return changes.iter().map(pack_list_op).collect();
    }

    let mut first = changes[0].clone();
    first["compacted"] = Value::Bool(true);
    let mut out = vec![pack_list_op(&first)];
    out.extend(
        changes[1..]
            .iter()
            .map(|c| c.get("value").cloned().unwrap_or(Value::Null)),
    );
    out
}

/// Unpack list changes in any of the accepted forms.
pub fn unpack_list_changes(changes: &[Value]) -> Vec<Value> {
    let Some(first) = changes.first() else {
        return Vec::new();
    };
    if !first.is_array() {
        return changes.to_vec();
    }

    let head = unpack_list_op(first);
    let compacted = head.get("compacted").and_then(Value::as_bool) == Some(true);
    if !compacted {
        return changes.iter().map(unpack_list_op).collect();
    }

    let after = head.get("after").cloned().unwrap_or(Value::Null);
    let mut out = vec![head];
    out.extend(changes[1..].iter().map(|value| {
        serde_json::json!({ "op": "app", "value": value, "after": after })
    }));
    out
}

fn pack_map_op(change: &Value) -> Value {
    let Some(obj) = change.as_object() else {
        return change.clone();
    };
    let key = obj.get("key").cloned().unwrap_or(Value::Null);
    match obj.get("op").and_then(Value::as_str) {
        // The value slot is kept even when null so that `set k null` survives.
        Some("set") => Value::Array(vec![
            Value::from(MAP_OP_SET),
            key,
            obj.get("value").cloned().unwrap_or(Value::Null),
        ]),
        Some("del") => Value::Array(vec![Value::from(MAP_OP_DELETE), key]),
        _ => change.clone(),
    }
}

fn unpack_map_op(packed: &Value) -> Value {
    let Some(arr) = packed.as_array() else {
        return packed.clone();
    };
    let key = arr.get(1).cloned().unwrap_or(Value::Null);
    match arr.first().and_then(Value::as_u64) {
        Some(MAP_OP_DELETE) => serde_json::json!({ "op": "del", "key": key }),
        _ => serde_json::json!({
            "op": "set",
            "key": key,
            "value": arr.get(2).cloned().unwrap_or(Value::Null),
        }),
    }
}

pub fn pack_map_changes(changes: &[Value]) -> Vec<Value> {
    changes.iter().map(pack_map_op).collect()
}

pub fn unpack_map_changes(changes: &[Value]) -> Vec<Value> {
    changes.iter().map(unpack_map_op).collect()
}

/// Pack changes for a CoValue of `kind`. Streams are left as they are.
pub fn pack_changes(kind: CoValueKind, changes: &[Value]) -> Vec<Value> {
    match kind {
        CoValueKind::Map => pack_map_changes(changes),
        CoValueKind::List | CoValueKind::PlainText => pack_list_changes(changes),
        CoValueKind::Stream => changes.to_vec(),
    }
}

pub fn unpack_changes(kind: CoValueKind, changes: &[Value]) -> Vec<Value> {
    match kind {
        CoValueKind::Map => unpack_map_changes(changes),
        CoValueKind::List | CoValueKind::PlainText => unpack_list_changes(changes),
        CoValueKind::Stream => changes.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_trailing_nulls_dropped_intermediate_kept() {
        let obj = json!({"name": "Charlie", "city": "NYC"});
        let arr = pack_object_to_array(&["name", "age", "city"], obj.as_object().unwrap());
        assert_eq!(arr, vec![json!("Charlie"), Value::Null, json!("NYC")]);

        let obj = json!({"name": "Bob"});
        let arr = pack_object_to_array(&["name", "age", "city"], obj.as_object().unwrap());
        assert_eq!(arr, vec![json!("Bob")]);
    }

    #[test]
    fn test_unpack_skips_nulls_keeps_falsy() {
        let obj = unpack_array_to_object(&["count", "active", "gone"], &[json!(0), json!(false), Value::Null]);
        assert_eq!(Value::Object(obj), json!({"count": 0, "active": false}));
    }

    #[test]
    fn test_map_codes() {
        let changes = vec![
            json!({"op": "set", "key": "name", "value": "Alice"}),
            json!({"op": "del", "key": "age"}),
            json!({"op": "set", "key": "n", "value": null}),
        ];
        let packed = pack_map_changes(&changes);
        assert_eq!(
            packed,
            vec![json!([1, "name", "Alice"]), json!([2, "age"]), json!([1, "n", null])]
        );
        assert_eq!(unpack_map_changes(&packed), changes);
        assert_eq!(unpack_map_changes(&changes), changes);
    }

    #[test]
    fn test_list_compaction() {
        let changes = vec![
            json!({"op": "app", "value": "a", "after": "start"}),
            json!({"op": "app", "value": "b", "after": "start"}),
            json!({"op": "app", "value": "c", "after": "start"}),
        ];
        let packed = pack_list_changes(&changes);
        assert_eq!(packed, vec![json!(["app", "a", "start", true]), json!("b"), json!("c")]);

        let unpacked = unpack_list_changes(&packed);
        assert_eq!(unpacked[0], json!({"op": "app", "value": "a", "after": "start", "compacted": true}));
        assert_eq!(unpacked[1..], changes[1..]);
    }

    #[test]
    fn test_list_mixed_ops_not_compacted() {
        let insertion = json!({"sessionID": "s", "txIndex": 0, "changeIdx": 0});
        let changes = vec![
            json!({"op": "app", "value": 1, "after": "start"}),
            json!({"op": "del", "insertion": insertion}),
            json!({"op": "pre", "value": 2, "before": "end"}),
        ];
        let packed = pack_list_changes(&changes);
        assert_eq!(packed[1], json!(["del", insertion]));
        assert_eq!(packed[2], json!(["pre", 2, "end"]));
        assert_eq!(unpack_list_changes(&packed), changes);
    }

    fn json_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| json!(n)),
            "[a-z]{0,8}".prop_map(Value::String),
        ]
    }

    proptest! {
        #[test]
        fn prop_map_changes_roundtrip(
            ops in prop::collection::vec(("[a-z]{1,6}", prop::option::of(json_leaf())), 0..12)
        ) {
            let changes: Vec<Value> = ops
                .into_iter()
                .map(|(key, value)| match value {
                    Some(v) => json!({"op": "set", "key": key, "value": v}),
                    None => json!({"op": "del", "key": key}),
                })
                .collect();
            prop_assert_eq!(unpack_map_changes(&pack_map_changes(&changes)), changes);
        }

        #[test]
        fn prop_list_appends_roundtrip(values in prop::collection::vec(json_leaf(), 2..12)) {
            let changes: Vec<Value> = values
                .into_iter()
                .map(|v| json!({"op": "app", "value": v, "after": "start"}))
                .collect();
            let mut unpacked = unpack_list_changes(&pack_list_changes(&changes));
            if let Some(first) = unpacked.first_mut().and_then(Value::as_object_mut) {
                first.remove("compacted");
            }
            prop_assert_eq!(unpacked, changes);
        }
    }
}
