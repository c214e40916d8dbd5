//! Group content as a time-indexed map.
//!
//! A group is a map CoValue whose keys name members, read keys, key
//! revelations and links to other groups. [`GroupState`] keeps every
//! accepted write per key so that roles can be read back as of any
//! `madeAt`, which is how transactions of owned CoValues are judged.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use covault_core::{AgentId, CoId, KeyId, OrderKey};
use serde_json::Value;

use crate::role::{ParentRole, Role};

pub const READ_KEY: &str = "readKey";
pub const EVERYONE: &str = "everyone";

const PARENT_PREFIX: &str = "parent_";
const CHILD_PREFIX: &str = "child_";
const FOR_SEPARATOR: &str = "_for_";

/// Someone a role can be given to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Member {
    Agent(AgentId),
    Everyone,
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::Agent(agent) => agent.fmt(f),
            Member::Everyone => f.write_str(EVERYONE),
        }
    }
}

/// Who a key revelation is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RevealTarget {
    /// Sealed to one agent.
    Agent(AgentId),
    /// In plaintext.
    Everyone,
    /// Encrypted with another read key.
    Key(KeyId),
}

impl fmt::Display for RevealTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevealTarget::Agent(agent) => agent.fmt(f),
            RevealTarget::Everyone => f.write_str(EVERYONE),
            RevealTarget::Key(key) => key.fmt(f),
        }
    }
}

/// A parsed group map key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupKey {
    ReadKey,
    Member(Member),
    Parent(CoId),
    Child(CoId),
    Revelation { key: KeyId, target: RevealTarget },
}

impl GroupKey {
    pub fn parse(key: &str) -> Option<Self> {
        if key == READ_KEY {
            return Some(GroupKey::ReadKey);
        }
        if key == EVERYONE {
            return Some(GroupKey::Member(Member::Everyone));
        }
        if let Some(parent) = key.strip_prefix(PARENT_PREFIX) {
            return parent.parse().ok().map(GroupKey::Parent);
        }
        if let Some(child) = key.strip_prefix(CHILD_PREFIX) {
            return child.parse().ok().map(GroupKey::Child);
        }
        if let Some((revealed, target)) = key.split_once(FOR_SEPARATOR) {
            let key = revealed.parse().ok()?;
            let target = if target == EVERYONE {
                RevealTarget::Everyone
            } else if let Ok(other) = target.parse() {
                RevealTarget::Key(other)
            } else {
                RevealTarget::Agent(target.parse().ok()?)
            };
            return Some(GroupKey::Revelation { key, target });
        }
        key.parse().ok().map(|agent| GroupKey::Member(Member::Agent(agent)))
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::ReadKey => f.write_str(READ_KEY),
            GroupKey::Member(member) => member.fmt(f),
            GroupKey::Parent(id) => write!(f, "{}{}", PARENT_PREFIX, id),
            GroupKey::Child(id) => write!(f, "{}{}", CHILD_PREFIX, id),
            GroupKey::Revelation { key, target } => write!(f, "{}{}{}", key, FOR_SEPARATOR, target),
        }
    }
}

/// One accepted write to a group key.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupEntry {
    pub at: OrderKey,
    pub value: Value,
}

/// The accepted history of one group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupState {
    id: CoId,
    initial_admin: AgentId,
    entries: BTreeMap<String, Vec<GroupEntry>>,
}

impl GroupState {
    pub fn new(id: CoId, initial_admin: AgentId) -> Self {
        Self {
            id,
            initial_admin,
            entries: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> CoId {
        self.id
    }

    pub fn initial_admin(&self) -> &AgentId {
        &self.initial_admin
    }

    /// Record an accepted write. Writes arrive in `(madeAt, tx)` order.
    pub(crate) fn record(&mut self, key: String, at: OrderKey, value: Value) {
        let history = self.entries.entry(key).or_default();
        let pos = history.partition_point(|e| e.at <= at);
        history.insert(pos, GroupEntry { at, value });
    }

    pub fn has_entry(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// The value of `key` as of `at_time`, or the latest one for `None`.
    pub fn get(&self, key: &str, at_time: Option<i64>) -> Option<&Value> {
        let history = self.entries.get(key)?;
        let entry = match at_time {
            None => history.last(),
            Some(t) => history.iter().rev().find(|e| e.at.made_at <= t),
        }?;
        Some(&entry.value)
    }

    /// The role stored for `member` itself, without inheritance.
    pub fn direct_role(&self, member: &Member, at_time: Option<i64>) -> Option<Role> {
        self.get(&member.to_string(), at_time)?
            .as_str()?
            .parse()
            .ok()
    }

    pub fn read_key(&self, at_time: Option<i64>) -> Option<KeyId> {
        self.get(READ_KEY, at_time)?.as_str()?.parse().ok()
    }

    /// Groups this one extends, excluding revoked extensions.
    pub fn parents(&self, at_time: Option<i64>) -> Vec<(CoId, ParentRole)> {
        self.entries
            .range(PARENT_PREFIX.to_string()..)
            .take_while(|(k, _)| k.starts_with(PARENT_PREFIX))
            .filter_map(|(k, _)| {
                let id = k[PARENT_PREFIX.len()..].parse().ok()?;
                let mapping: ParentRole = self.get(k, at_time)?.as_str()?.parse().ok()?;
                (mapping != ParentRole::Role(Role::Revoked)).then_some((id, mapping))
            })
            .collect()
    }

    /// Back-links written by groups that extend this one.
    pub fn children(&self) -> Vec<CoId> {
        self.entries
            .range(CHILD_PREFIX.to_string()..)
            .take_while(|(k, _)| k.starts_with(CHILD_PREFIX))
            .filter_map(|(k, _)| k[CHILD_PREFIX.len()..].parse().ok())
            .collect()
    }

    /// Members with a direct role, excluding revoked ones.
    pub fn members(&self, at_time: Option<i64>) -> Vec<(Member, Role)> {
        self.entries
            .keys()
            .filter_map(|k| match GroupKey::parse(k)? {
                GroupKey::Member(member) => Some(member),
                _ => None,
            })
            .filter_map(|member| {
                let role = self.direct_role(&member, at_time)?;
                (role != Role::Revoked).then_some((member, role))
            })
            .collect()
    }

    /// The latest revelation of `key` to `target`.
    pub fn revelation(&self, key: &KeyId, target: &RevealTarget) -> Option<&str> {
        let field = GroupKey::Revelation {
            key: key.clone(),
            target: target.clone(),
        };
        self.get(&field.to_string(), None)?.as_str()
    }

    /// Every revelation of `key`, whoever it is addressed to.
    pub fn revelations_of(&self, key: &KeyId) -> Vec<(RevealTarget, &str)> {
        let prefix = format!("{}{}", key, FOR_SEPARATOR);
        self.entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, history)| {
                let target = match GroupKey::parse(k)? {
                    GroupKey::Revelation { target, .. } => target,
                    _ => return None,
                };
                Some((target, history.last()?.value.as_str()?))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covault_core::{AgentSecret, SessionId, TransactionId};
    use serde_json::json;

    fn at(made_at: i64, index: u32) -> OrderKey {
        let agent = AgentSecret::from_seed(&[9; 32]).id();
        OrderKey {
            made_at,
            id: TransactionId::new(SessionId::new(&agent, &[0; 8]), index),
        }
    }

    #[test]
    fn test_parse_keys() {
        let agent = AgentSecret::from_seed(&[1; 32]).id();
        let key = KeyId::from_bytes([7; 8]);
        let other = KeyId::from_bytes([8; 8]);
        let co = CoId::from_bytes([3; 32]);

        assert_eq!(GroupKey::parse("readKey"), Some(GroupKey::ReadKey));
        assert_eq!(
            GroupKey::parse(&agent.to_string()),
            Some(GroupKey::Member(Member::Agent(agent)))
        );
        assert_eq!(
            GroupKey::parse(&format!("parent_{}", co)),
            Some(GroupKey::Parent(co))
        );
        for target in [
            RevealTarget::Agent(agent),
            RevealTarget::Everyone,
            RevealTarget::Key(other),
        ] {
            let parsed = GroupKey::Revelation {
                key: key.clone(),
                target,
            };
            assert_eq!(GroupKey::parse(&parsed.to_string()), Some(parsed));
        }
        assert_eq!(GroupKey::parse("profile"), None);
    }

    #[test]
    fn test_time_travel() {
        let agent = AgentSecret::from_seed(&[1; 32]).id();
        let member = Member::Agent(agent);
        let mut state = GroupState::new(CoId::from_bytes([1; 32]), agent);
        state.record(member.to_string(), at(10, 0), json!("writer"));
        state.record(member.to_string(), at(20, 1), json!("revoked"));

        assert_eq!(state.direct_role(&member, Some(5)), None);
        assert_eq!(state.direct_role(&member, Some(15)), Some(Role::Writer));
        assert_eq!(state.direct_role(&member, None), Some(Role::Revoked));
        assert!(state.members(None).is_empty());
        assert_eq!(state.members(Some(15)), vec![(member, Role::Writer)]);
    }

    #[test]
    fn test_parents_skip_revoked() {
        let agent = AgentSecret::from_seed(&[1; 32]).id();
        let mut state = GroupState::new(CoId::from_bytes([1; 32]), agent);
        let a = CoId::from_bytes([2; 32]);
        let b = CoId::from_bytes([3; 32]);
        state.record(format!("parent_{}", a), at(1, 0), json!("extend"));
        state.record(format!("parent_{}", b), at(2, 1), json!("reader"));
        state.record(format!("parent_{}", b), at(3, 2), json!("revoked"));

        assert_eq!(state.parents(None), vec![(a, ParentRole::Extend)]);
        assert_eq!(state.parents(Some(2)).len(), 2);
    }
}
