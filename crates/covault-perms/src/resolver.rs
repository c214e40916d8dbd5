//! The permission resolver.
//!
//! [`PermissionResolver`] holds the replayed state of every loaded group.
//! It is the [`WriteGate`] that decides which transactions count and the
//! [`KeySource`] that recovers read keys for private transactions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use covault_core::pack::unpack_map_changes;
use covault_core::{
    AgentId, AgentSecret, CoId, CoValueCore, CoValueHeader, CryptoProvider, KeyId, KeySecret,
    KeySource, OrderKey, Ruleset, TxRef, Verdict, WriteGate,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{PermsError, Result};
use crate::group::{GroupKey, GroupState, Member, RevealTarget};
use crate::keys::{
    decrypt_key_for_key, new_read_key, read_key_change, reveal_change, reveal_to_key_change,
    unseal_key,
};
use crate::role::{ParentRole, Role};

/// Roles and keys across all loaded groups.
pub struct PermissionResolver {
    crypto: Arc<dyn CryptoProvider>,
    agent: Option<AgentSecret>,
    groups: HashMap<CoId, GroupState>,
    local_keys: HashMap<(CoId, KeyId), KeySecret>,
}

impl std::fmt::Debug for PermissionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionResolver")
            .field("agent", &self.agent.as_ref().map(AgentSecret::id))
            .field("groups", &self.groups.len())
            .finish()
    }
}

/// A read key the local agent can use.
#[derive(Debug, Clone)]
pub struct ReadKey {
    pub id: KeyId,
    pub secret: KeySecret,
}

/// A new read key and the group changes that install it.
#[derive(Debug, Clone)]
pub struct Rotation {
    pub key: ReadKey,
    pub changes: Vec<Value>,
}

impl PermissionResolver {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            crypto,
            agent: None,
            groups: HashMap::new(),
            local_keys: HashMap::new(),
        }
    }

    /// Resolve keys sealed to `agent`.
    pub fn with_agent(mut self, agent: AgentSecret) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn agent_id(&self) -> Option<AgentId> {
        self.agent.as_ref().map(AgentSecret::id)
    }

    pub fn group(&self, id: &CoId) -> Option<&GroupState> {
        self.groups.get(id)
    }

    pub fn has_group(&self, id: &CoId) -> bool {
        self.groups.contains_key(id)
    }

    /// Replay the valid transactions of a group CoValue.
    ///
    /// Returns whether the group's state changed, in which case CoValues
    /// owned by it or by its descendants need their validity refreshed.
    pub fn update_group(&mut self, core: &CoValueCore) -> bool {
        let Ruleset::Group { initial_admin } = &core.header().ruleset else {
            return false;
        };

        let valid = core.valid_sorted_transactions(false);
        let authors: Vec<AgentId> = valid
            .iter()
            .filter_map(|(key, _)| key.id.session.agent().ok())
            .collect();
        if authors.len() != valid.len() {
            warn!(group = %core.id(), "valid group transaction without an agent");
            return false;
        }
        let refs: Vec<TxRef<'_>> = valid
            .iter()
            .zip(&authors)
            .map(|((key, tx), author)| TxRef {
                id: &key.id,
                author,
                tx,
            })
            .collect();

        let (state, _) = self.replay(core.id(), *initial_admin, &refs);
        if self.groups.get(&core.id()) == Some(&state) {
            return false;
        }
        debug!(group = %core.id(), "group state updated");
        self.groups.insert(core.id(), state);
        true
    }

    pub fn remove_group(&mut self, id: &CoId) {
        self.groups.remove(id);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Roles
    // ─────────────────────────────────────────────────────────────────────

    /// Effective role of `agent` in `group` as of `at_time` (latest for
    /// `None`): the best of its direct and inherited roles, falling back to
    /// the role given to `everyone`.
    pub fn role_of(&self, group: &CoId, agent: &AgentId, at_time: Option<i64>) -> Option<Role> {
        let state = self.groups.get(group)?;
        self.role_in(state, &Member::Agent(*agent), at_time, &mut Vec::new())
    }

    /// The role given to `everyone`, directly or through parents.
    pub fn everyone_role(&self, group: &CoId, at_time: Option<i64>) -> Option<Role> {
        let state = self.groups.get(group)?;
        self.role_in(state, &Member::Everyone, at_time, &mut Vec::new())
    }

    fn role_in(
        &self,
        state: &GroupState,
        member: &Member,
        at_time: Option<i64>,
        visiting: &mut Vec<CoId>,
    ) -> Option<Role> {
        if visiting.contains(&state.id()) {
            return None;
        }
        visiting.push(state.id());

        let mut role = state
            .direct_role(member, at_time)
            .filter(|r| *r != Role::Revoked);

        for (parent, mapping) in state.parents(at_time) {
            let Some(parent_state) = self.groups.get(&parent) else {
                continue;
            };
            let parent_role = self.role_in(parent_state, member, at_time, visiting);
            if let Some(inherited) = mapping.inherit(parent_role) {
                if inherited.is_higher_than(role) {
                    role = Some(inherited);
                }
            }
        }
        visiting.pop();

        if role.is_none() && *member != Member::Everyone {
            role = state
                .direct_role(&Member::Everyone, at_time)
                .filter(|r| *r != Role::Revoked);
        }
        role
    }

    /// Fail with [`PermsError::NotAuthorized`] unless the local agent's role
    /// in `group` passes `allowed`.
    pub fn require_role(
        &self,
        group: &CoId,
        action: &'static str,
        allowed: impl Fn(Role) -> bool,
    ) -> Result<Role> {
        let agent = self
            .agent_id()
            .ok_or_else(|| PermsError::ConfigurationError("no local agent".into()))?;
        if !self.groups.contains_key(group) {
            return Err(PermsError::MissingGroup(*group));
        }
        match self.role_of(group, &agent, None) {
            Some(role) if allowed(role) => Ok(role),
            _ => Err(PermsError::NotAuthorized {
                agent,
                group: *group,
                action,
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Group graph
    // ─────────────────────────────────────────────────────────────────────

    /// Every group `group` extends, directly or transitively.
    pub fn ancestors(&self, group: &CoId) -> HashSet<CoId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<CoId> = VecDeque::from([*group]);
        while let Some(id) = queue.pop_front() {
            let Some(state) = self.groups.get(&id) else {
                continue;
            };
            for (parent, _) in state.parents(None) {
                if seen.insert(parent) {
                    queue.push_back(parent);
                }
            }
        }
        seen
    }

    /// Every loaded group that extends `group`, directly or transitively.
    pub fn descendants(&self, group: &CoId) -> Vec<CoId> {
        let mut found = Vec::new();
        let mut queue: VecDeque<CoId> = VecDeque::from([*group]);
        while let Some(id) = queue.pop_front() {
            for (child, state) in &self.groups {
                if *child == *group || found.contains(child) {
                    continue;
                }
                if state.parents(None).iter().any(|(p, _)| *p == id) {
                    found.push(*child);
                    queue.push_back(*child);
                }
            }
        }
        found
    }

    /// Whether `child` extending `parent` would close a cycle.
    pub fn would_cycle(&self, child: &CoId, parent: &CoId) -> bool {
        child == parent || self.ancestors(parent).contains(child)
    }

    /// Check an extension before writing it.
    pub fn check_extend(&self, child: &CoId, parent: &CoId) -> Result<()> {
        if self.would_cycle(child, parent) {
            return Err(PermsError::ConfigurationError(format!(
                "extending {} with {} would create a cycle",
                child, parent
            )));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Replay
    // ─────────────────────────────────────────────────────────────────────

    fn replay(
        &self,
        id: CoId,
        initial_admin: AgentId,
        txs: &[TxRef<'_>],
    ) -> (GroupState, Vec<Verdict>) {
        let mut state = GroupState::new(id, initial_admin);
        let mut verdicts = Vec::with_capacity(txs.len());

        for tx in txs {
            match self.check_group_tx(&state, tx) {
                Ok(Some((key, value))) => {
                    let at = OrderKey {
                        made_at: tx.tx.made_at(),
                        id: tx.id.clone(),
                    };
                    state.record(key, at, value);
                    verdicts.push(Ok(()));
                }
                Ok(None) => verdicts.push(Ok(())),
                Err(reason) => verdicts.push(Err(reason)),
            }
        }
        (state, verdicts)
    }

    /// Judge one group transaction against the state built so far. On
    /// success returns the write to record, if any.
    fn check_group_tx(
        &self,
        state: &GroupState,
        tx: &TxRef<'_>,
    ) -> std::result::Result<Option<(String, Value)>, String> {
        let made_at = tx.tx.made_at();
        let author = Member::Agent(*tx.author);
        let author_role = self.role_in(state, &author, Some(made_at), &mut Vec::new());
        let is_admin = author_role == Some(Role::Admin);

        if tx.tx.is_deletion() || tx.tx.is_private() {
            return if is_admin {
                Ok(None)
            } else {
                Err("only admins may delete a group or write private group transactions".into())
            };
        }

        let changes = tx
            .tx
            .trusting_changes()
            .map(|changes| unpack_map_changes(&changes))
            .ok_or("unreadable group changes")?;
        let [change] = changes.as_slice() else {
            return Err("group transactions carry exactly one change".into());
        };
        if change.get("op").and_then(Value::as_str) != Some("set") {
            return Err("group transactions may only set keys".into());
        }
        let key = change
            .get("key")
            .and_then(Value::as_str)
            .ok_or("group change without a key")?;
        let value = change.get("value").cloned().unwrap_or(Value::Null);

        let group_key =
            GroupKey::parse(key).ok_or_else(|| format!("unknown group key {:?}", key))?;
        match group_key {
            GroupKey::ReadKey => {
                if !is_admin {
                    return Err("only admins may set the read key".into());
                }
                value
                    .as_str()
                    .and_then(|v| v.parse::<KeyId>().ok())
                    .ok_or("read key must be a key id")?;
            }

            GroupKey::Parent(parent) => {
                if !is_admin {
                    return Err("only admins may extend a group".into());
                }
                value
                    .as_str()
                    .and_then(|v| v.parse::<ParentRole>().ok())
                    .ok_or("parent link must be a role or \"extend\"")?;
                if self.would_cycle(&state.id(), &parent) {
                    warn!(group = %state.id(), parent = %parent, "skipping cyclic group extension");
                    return Err("cyclic group extension".into());
                }
            }

            GroupKey::Child(_) => {
                if author_role.is_none() {
                    return Err("only members may link a child group".into());
                }
            }

            GroupKey::Revelation { target, .. } => {
                if !value.is_string() {
                    return Err("key revelations must be strings".into());
                }
                let own = target == RevealTarget::Agent(*tx.author) && author_role.is_some();
                if !is_admin && !own {
                    return Err("only admins may reveal keys to others".into());
                }
            }

            GroupKey::Member(member) => {
                let role: Role = value.as_str().ok_or("role must be a string")?.parse()?;
                if member == Member::Everyone && !role.allowed_for_everyone() {
                    return Err(format!("everyone cannot be {}", role));
                }

                let bootstrap = author_role.is_none()
                    && *tx.author == *state.initial_admin()
                    && member == author
                    && role == Role::Admin
                    && !state.has_entry(key);

                if !bootstrap {
                    if !is_admin {
                        return Err("only admins may change roles".into());
                    }
                    let current = state.direct_role(&member, Some(made_at));
                    if current == Some(Role::Admin) && member != author && role != Role::Admin {
                        return Err("admins cannot demote other admins".into());
                    }
                }
            }
        }

        Ok(Some((key.to_string(), value)))
    }

    fn check_owned_txs(&self, group: &CoId, txs: &[TxRef<'_>]) -> Vec<Verdict> {
        let Some(state) = self.groups.get(group) else {
            let reason = format!("owning group {} is not loaded", group);
            return vec![Err(reason); txs.len()];
        };

        txs.iter()
            .map(|tx| {
                let member = Member::Agent(*tx.author);
                let role = self.role_in(state, &member, Some(tx.tx.made_at()), &mut Vec::new());
                match role {
                    Some(Role::Admin) => Ok(()),
                    Some(_) if tx.tx.is_deletion() => Err("only admins may delete".into()),
                    Some(role) if role.can_write() => Ok(()),
                    Some(role) => Err(format!("{} may not write", role)),
                    None => Err("author has no role in the owning group".into()),
                }
            })
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Keys
    // ─────────────────────────────────────────────────────────────────────

    /// Remember a key created locally, before its revelation is replayed.
    pub fn remember_key(&mut self, group: CoId, key: &ReadKey) {
        self.local_keys
            .insert((group, key.id.clone()), key.secret.clone());
    }

    /// The current read key of `group`, if the local agent can recover it.
    pub fn read_key(&self, group: &CoId) -> Result<ReadKey> {
        let state = self.groups.get(group).ok_or(PermsError::MissingGroup(*group))?;
        let id = state.read_key(None).ok_or_else(|| {
            PermsError::ConfigurationError(format!("group {} has no read key", group))
        })?;
        let secret = self
            .key_secret(group, &id)
            .ok_or_else(|| PermsError::MissingKey {
                group: *group,
                key: id.clone(),
            })?;
        Ok(ReadKey { id, secret })
    }

    fn resolve_key(
        &self,
        group: &CoId,
        key: &KeyId,
        visiting: &mut Vec<(CoId, KeyId)>,
    ) -> Option<KeySecret> {
        if let Some(secret) = self.local_keys.get(&(*group, key.clone())) {
            return Some(secret.clone());
        }
        let state = self.groups.get(group)?;
        if visiting.iter().any(|(g, k)| g == group && k == key) {
            return None;
        }
        visiting.push((*group, key.clone()));
        let found = self.resolve_key_in(state, key, visiting);
        visiting.pop();
        found
    }

    fn resolve_key_in(
        &self,
        state: &GroupState,
        key: &KeyId,
        visiting: &mut Vec<(CoId, KeyId)>,
    ) -> Option<KeySecret> {
        let group = state.id();

        if let Some(public) = state.revelation(key, &RevealTarget::Everyone) {
            if let Ok(secret) = public.parse() {
                return Some(secret);
            }
        }

        if let Some(agent) = &self.agent {
            if let Some(sealed) = state.revelation(key, &RevealTarget::Agent(agent.id())) {
                match unseal_key(self.crypto.as_ref(), &group, key, sealed, agent) {
                    Ok(secret) => return Some(secret),
                    Err(e) => warn!(group = %group, key = %key, error = %e, "failed to unseal key"),
                }
            }
        }

        let parents: Vec<CoId> = state.parents(None).into_iter().map(|(p, _)| p).collect();
        for (target, encrypted) in state.revelations_of(key) {
            let RevealTarget::Key(other) = target else {
                continue;
            };
            let other_secret = self.resolve_key(&group, &other, visiting).or_else(|| {
                parents
                    .iter()
                    .find_map(|parent| self.resolve_key(parent, &other, visiting))
            });
            if let Some(other_secret) = other_secret {
                match decrypt_key_for_key(
                    self.crypto.as_ref(),
                    &group,
                    key,
                    encrypted,
                    (&other, &other_secret),
                ) {
                    Ok(secret) => return Some(secret),
                    Err(e) => warn!(group = %group, key = %key, error = %e, "failed to decrypt key"),
                }
            }
        }
        None
    }

    /// Build the changes that replace the read key of `group`.
    ///
    /// The new key is sealed to every remaining member that may read,
    /// revealed publicly if `everyone` may read, made readable to holders
    /// of the parents' current keys, and the old key is encrypted with the
    /// new one so history stays readable.
    pub fn rotate_read_key(&self, group: &CoId) -> Result<Rotation> {
        self.require_role(group, "rotate the read key", Role::is_admin)?;
        let state = self.groups.get(group).ok_or(PermsError::MissingGroup(*group))?;
        let crypto = self.crypto.as_ref();
        let (id, secret) = new_read_key(crypto);
        let new = (&id, &secret);

        let mut changes = Vec::new();
        for (member, role) in state.members(None) {
            if role.can_read() || role == Role::WriteOnly {
                changes.push(reveal_change(crypto, group, new, &member)?);
            }
        }
        if let Some(old) = state.read_key(None) {
            if let Some(old_secret) = self.key_secret(group, &old) {
                changes.push(reveal_to_key_change(crypto, group, (&old, &old_secret), new)?);
            }
        }
        for (parent, _) in state.parents(None) {
            match self.read_key(&parent) {
                Ok(parent_key) => changes.push(reveal_to_key_change(
                    crypto,
                    group,
                    new,
                    (&parent_key.id, &parent_key.secret),
                )?),
                Err(e) => warn!(group = %group, parent = %parent, error = %e, "parent key not available"),
            }
        }
        changes.push(read_key_change(&id));

        debug!(group = %group, key = %id, "rotating read key");
        Ok(Rotation {
            key: ReadKey { id, secret },
            changes,
        })
    }
}

impl WriteGate for PermissionResolver {
    fn validate(&self, id: &CoId, header: &CoValueHeader, txs: &[TxRef<'_>]) -> Vec<Verdict> {
        match &header.ruleset {
            Ruleset::UnsafeAllowAll => vec![Ok(()); txs.len()],
            Ruleset::Group { initial_admin } => self.replay(*id, *initial_admin, txs).1,
            Ruleset::OwnedByGroup { group } => self.check_owned_txs(group, txs),
        }
    }
}

impl KeySource for PermissionResolver {
    fn key_secret(&self, owner: &CoId, key_id: &KeyId) -> Option<KeySecret> {
        self.resolve_key(owner, key_id, &mut Vec::new())
    }
}
