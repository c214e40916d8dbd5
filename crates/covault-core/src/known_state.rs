//! Known states: how much of a CoValue a node has, per session.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{CoId, SessionId};

/// A CoValue's id, whether the header is known, and the number of
/// transactions known in each session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub id: CoId,
    pub header: bool,
    #[serde(default)]
    pub sessions: BTreeMap<SessionId, u32>,
}

impl KnownState {
    /// Nothing known about `id`.
    pub fn empty(id: CoId) -> Self {
        Self {
            id,
            header: false,
            sessions: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.header && self.sessions.values().all(|n| *n == 0)
    }

    pub fn session_len(&self, session: &SessionId) -> u32 {
        self.sessions.get(session).copied().unwrap_or(0)
    }

    /// Merge another known state in, keeping the maximum per session.
    pub fn combine_with(&mut self, other: &KnownState) {
        self.header |= other.header;
        for (session, count) in &other.sessions {
            let entry = self.sessions.entry(session.clone()).or_insert(0);
            if *count > *entry {
                *entry = *count;
            }
        }
    }

    /// Raise a single session's count.
    pub fn update_session(&mut self, session: &SessionId, count: u32) {
        let entry = self.sessions.entry(session.clone()).or_insert(0);
        if count > *entry {
            *entry = count;
        }
    }

    /// Whether everything in `self` is also known by `other`.
    pub fn is_subset_of(&self, other: &KnownState) -> bool {
        (!self.header || other.header)
            && self
                .sessions
                .iter()
                .all(|(session, count)| other.session_len(session) >= *count)
    }
}

/// Sessions where `peer` knows fewer transactions than `ours`, with the
/// index the peer is at.
pub fn sessions_behind<'a>(
    ours: &'a KnownState,
    peer: &'a KnownState,
) -> impl Iterator<Item = (&'a SessionId, u32)> + 'a {
    ours.sessions.iter().filter_map(move |(session, count)| {
        let theirs = peer.session_len(session);
        (theirs < *count).then_some((session, theirs))
    })
}

/// Whether a peer with `peer` has all content in `ours`.
pub fn peer_has_all_content(ours: &KnownState, peer: &KnownState) -> bool {
    ours.is_subset_of(peer)
}
