//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::{Map, Value};

use covault_core::{AgentSecret, CoMap};

/// Generate a random agent.
pub fn agent_secret() -> impl Strategy<Value = AgentSecret> {
    any::<[u8; 32]>().prop_map(|seed| AgentSecret::from_seed(&seed))
}

/// Generate a reasonable timestamp.
pub fn timestamp() -> impl Strategy<Value = i64> {
    0i64..=1_700_000_000_000i64
}

/// Generate a map key.
pub fn map_key() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,7}".prop_map(String::from)
}

/// Scalars other than null.
pub fn json_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,16}".prop_map(Value::String),
    ]
}

/// Any JSON value, nested up to three levels.
pub fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![Just(Value::Null), json_scalar()];
    leaf.prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map(map_key(), inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

/// An object using a subset of `keys`, every value present and non-null.
pub fn object_with_keys(keys: &'static [&'static str]) -> impl Strategy<Value = Map<String, Value>> {
    (
        prop::sample::subsequence(keys.to_vec(), 0..=keys.len()),
        prop::collection::vec(json_scalar(), keys.len()),
    )
        .prop_map(|(chosen, values)| {
            chosen
                .into_iter()
                .zip(values)
                .map(|(k, v)| (k.to_string(), v))
                .collect()
        })
}

/// A map set or delete change.
pub fn map_change() -> impl Strategy<Value = Value> {
    prop_oneof![
        3 => (map_key(), json_value()).prop_map(|(k, v)| CoMap::set_change(k, v)),
        1 => map_key().prop_map(CoMap::delete_change),
    ]
}

/// Parameters for one map write by one of a few agents.
#[derive(Debug, Clone)]
pub struct MapWrite {
    /// Index into the writing agents.
    pub author: usize,
    pub made_at: i64,
    pub change: Value,
    /// First-writer-wins key, if the write competes for one.
    pub fww: Option<String>,
}

impl Arbitrary for MapWrite {
    type Parameters = usize;
    type Strategy = BoxedStrategy<Self>;

    /// `authors` is the number of agents to spread writes over (at least 1).
    fn arbitrary_with(authors: Self::Parameters) -> Self::Strategy {
        (
            0..authors.max(1),
            0i64..1_000,
            map_change(),
            prop::option::weighted(0.2, prop_oneof![Just("a".to_string()), Just("b".to_string())]),
        )
            .prop_map(|(author, made_at, change, fww)| MapWrite {
                author,
                made_at,
                change,
                fww,
            })
            .boxed()
    }
}

/// A history of map writes by up to `authors` agents.
pub fn map_history(authors: usize, max_len: usize) -> impl Strategy<Value = Vec<MapWrite>> {
    prop::collection::vec(any_with::<MapWrite>(authors), 1..max_len.max(2))
}
