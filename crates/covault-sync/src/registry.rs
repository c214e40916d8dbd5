//! The node's in-memory CoValues.
//!
//! The registry owns every loaded [`CoValueCore`], its materialized content
//! and the permission resolver that gates them all. Any change to a log
//! goes through [`Registry::refresh`], which recomputes validity and, when
//! a group's state moves, cascades to the groups extending it and to every
//! CoValue they own.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use covault_core::{
    AgentSecret, CoId, CoValueCore, CryptoProvider, MaterializedContent, NewContent,
    RejectionReason, SessionId, ValidityChange,
};
use covault_perms::PermissionResolver;
use tracing::{debug, warn};

/// A loaded CoValue.
pub struct Entry {
    pub core: CoValueCore,
    pub content: MaterializedContent,
}

/// What ingesting one content message did.
#[derive(Debug)]
pub struct Ingested {
    /// The part of the message that was accepted, ready to be stored and
    /// forwarded. Carries the header if the CoValue was created by it.
    pub valid: NewContent,
    /// Transactions actually added.
    pub added: usize,
    /// Some session started past our end; the sender needs our real state.
    pub needs_correction: bool,
    /// Sessions refused for other reasons.
    pub rejected: Vec<(SessionId, RejectionReason)>,
    /// The CoValue became deleted while ingesting this message.
    pub newly_deleted: bool,
}

impl Ingested {
    pub fn has_new_content(&self) -> bool {
        self.valid.header.is_some() || !self.valid.new.is_empty()
    }
}

/// Why content could not be ingested at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// Content without a header for a CoValue we do not have.
    UnknownCoValue,
    Rejected(RejectionReason),
}

pub struct Registry {
    crypto: Arc<dyn CryptoProvider>,
    resolver: PermissionResolver,
    entries: HashMap<CoId, Entry>,
}

impl Registry {
    pub fn new(crypto: Arc<dyn CryptoProvider>, agent: Option<AgentSecret>) -> Self {
        let mut resolver = PermissionResolver::new(crypto.clone());
        if let Some(agent) = agent {
            resolver = resolver.with_agent(agent);
        }
        Self {
            crypto,
            resolver,
            entries: HashMap::new(),
        }
    }

    pub fn crypto(&self) -> Arc<dyn CryptoProvider> {
        self.crypto.clone()
    }

    pub fn resolver(&self) -> &PermissionResolver {
        &self.resolver
    }

    pub fn resolver_mut(&mut self) -> &mut PermissionResolver {
        &mut self.resolver
    }

    pub fn contains(&self, id: &CoId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &CoId) -> Option<&CoValueCore> {
        self.entries.get(id).map(|e| &e.core)
    }

    /// Mutable access to a log. Call [`refresh`](Self::refresh) afterwards.
    pub fn core_mut(&mut self, id: &CoId) -> Option<&mut CoValueCore> {
        self.entries.get_mut(id).map(|e| &mut e.core)
    }

    pub fn content(&self, id: &CoId) -> Option<&MaterializedContent> {
        self.entries.get(id).map(|e| &e.content)
    }

    pub fn ids(&self) -> Vec<CoId> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a CoValue and bring it up to date. Returns every CoValue whose
    /// validity was refreshed as a consequence.
    pub fn insert(&mut self, core: CoValueCore) -> Vec<CoId> {
        let id = core.id();
        let content = MaterializedContent::new(core.header().kind);
        self.entries.insert(id, Entry { core, content });
        self.refresh(&id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Dependencies
    // ─────────────────────────────────────────────────────────────────────

    /// CoValues that must be known before `id` makes sense: the owning
    /// group of owned content, the parents of a group.
    pub fn dependencies(&self, id: &CoId) -> Vec<CoId> {
        let Some(core) = self.get(id) else {
            return Vec::new();
        };
        if let Some(group) = core.header().owner_group() {
            return vec![group];
        }
        self.resolver
            .group(id)
            .map(|state| state.parents(None).into_iter().map(|(p, _)| p).collect())
            .unwrap_or_default()
    }

    /// Dependencies of `content` that are not loaded. Uses the message's
    /// header when the CoValue itself is not loaded yet.
    pub fn missing_dependencies(&self, content: &NewContent) -> Vec<CoId> {
        let deps = match (self.get(&content.id), &content.header) {
            (Some(_), _) => self.dependencies(&content.id),
            (None, Some(header)) => header.owner_group().into_iter().collect(),
            (None, None) => Vec::new(),
        };
        deps.into_iter().filter(|d| !self.contains(d)).collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Ingest
    // ─────────────────────────────────────────────────────────────────────

    /// Verify and append a content message from a peer or storage.
    ///
    /// Sessions are handled independently: a bad signature or a gap in one
    /// session leaves the others alone. Once the CoValue is deleted only
    /// deletion sessions are accepted.
    pub fn ingest(&mut self, msg: &NewContent) -> Result<Ingested, IngestError> {
        let mut created = false;
        if !self.contains(&msg.id) {
            let header = msg.header.clone().ok_or(IngestError::UnknownCoValue)?;
            let core = CoValueCore::from_id_and_header(msg.id, header, self.crypto.clone())
                .map_err(IngestError::Rejected)?;
            let content = MaterializedContent::new(core.header().kind);
            self.entries.insert(msg.id, Entry { core, content });
            created = true;
        }

        let Some(entry) = self.entries.get_mut(&msg.id) else {
            return Err(IngestError::UnknownCoValue);
        };
        let was_deleted = entry.core.is_deleted();

        let mut valid_new = BTreeMap::new();
        let mut added = 0;
        let mut needs_correction = false;
        let mut rejected = Vec::new();

        for (session, piece) in &msg.new {
            if was_deleted && !session.is_delete() {
                continue;
            }
            match entry.core.ingest(
                session,
                piece.after,
                piece.new_transactions.clone(),
                &piece.last_signature,
            ) {
                Ok(n) => {
                    added += n;
                    if n > 0 {
                        valid_new.insert(session.clone(), piece.clone());
                    }
                }
                Err(reason) => {
                    if reason.needs_correction() {
                        needs_correction = true;
                    } else {
                        warn!(co = %msg.id, session = %session, %reason, "rejected session content");
                    }
                    rejected.push((session.clone(), reason));
                }
            }
        }

        let id = msg.id;
        if added > 0 || created {
            self.refresh(&id);
        }

        let newly_deleted = !was_deleted && self.get(&id).is_some_and(CoValueCore::is_deleted);
        if newly_deleted {
            // Only the tombstone travels on once the CoValue is deleted.
            valid_new.retain(|session, _| session.is_delete());
        }

        let valid = NewContent {
            id,
            header: created.then(|| msg.header.clone()).flatten(),
            priority: msg.priority,
            new: valid_new,
            expect_content_until: None,
        };
        debug!(co = %id, added, created, "ingested content");
        Ok(Ingested {
            valid,
            added,
            needs_correction,
            rejected,
            newly_deleted,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Validity
    // ─────────────────────────────────────────────────────────────────────

    /// Recompute validity of `id` and of everything whose permissions
    /// depend on it, then bring materialized content up to date. Returns
    /// the refreshed CoValues, `id` first.
    pub fn refresh(&mut self, id: &CoId) -> Vec<CoId> {
        let mut refreshed = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([*id]);

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            let Some(entry) = self.entries.get_mut(&current) else {
                continue;
            };

            let change = entry.core.refresh_validity(&self.resolver);
            let group_changed =
                entry.core.header().is_group() && self.resolver.update_group(&entry.core);
            entry.content.update(&entry.core, &self.resolver);
            if change == ValidityChange::Flipped {
                debug!(co = %current, "validity flipped, content rebuilt");
            }
            refreshed.push(current);

            if group_changed {
                queue.extend(self.resolver.descendants(&current));
                queue.extend(
                    self.entries
                        .iter()
                        .filter(|(_, e)| e.core.header().owner_group() == Some(current))
                        .map(|(other, _)| *other),
                );
                // A group that extends `current` changed its effective roles,
                // so the content it owns needs another pass.
                for child in self.resolver.descendants(&current) {
                    queue.extend(
                        self.entries
                            .iter()
                            .filter(|(_, e)| e.core.header().owner_group() == Some(child))
                            .map(|(other, _)| *other),
                    );
                }
            }
        }
        refreshed
    }

    /// Drop everything but the tombstone of a deleted CoValue.
    pub fn erase(&mut self, id: &CoId) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        if !entry.core.erase_non_delete_sessions() {
            return false;
        }
        entry.content.update(&entry.core, &self.resolver);
        if entry.core.header().is_group() {
            self.resolver.remove_group(id);
        }
        true
    }
}
