//! What the Sync Manager knows about each peer.

use std::collections::{HashMap, HashSet};

use covault_core::{CoId, KnownState};
use tracing::debug;

use crate::messages::{PeerId, SyncMessage};
use crate::outgoing::OutgoingHandle;
use crate::peer::PeerRole;

/// Per-peer sync state.
///
/// For each CoValue the peer has talked about, two known states are kept:
/// `known` is what the peer confirmed, `optimistic` additionally includes
/// what we already sent and expect it to have. Diffs for new content are
/// taken against the optimistic one so nothing is sent twice.
pub struct PeerState {
    id: PeerId,
    role: PeerRole,
    outgoing: OutgoingHandle,
    known: HashMap<CoId, KnownState>,
    optimistic: HashMap<CoId, KnownState>,
    told_known: HashSet<CoId>,
    requested: HashSet<CoId>,
}

impl PeerState {
    pub fn new(id: PeerId, role: PeerRole, outgoing: OutgoingHandle) -> Self {
        Self {
            id,
            role,
            outgoing,
            known: HashMap::new(),
            optimistic: HashMap::new(),
            told_known: HashSet::new(),
            requested: HashSet::new(),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn is_server(&self) -> bool {
        self.role == PeerRole::Server
    }

    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }

    /// Queue a message for this peer. Dropped with a debug log if the
    /// connection is gone.
    pub fn send(&self, msg: SyncMessage) {
        let action = msg.action();
        let co = msg.id();
        if !self.outgoing.push(msg) {
            debug!(peer = %self.id, %co, action, "peer closed, dropping message");
        }
    }

    pub fn close(&self) {
        self.outgoing.close();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Known states
    // ─────────────────────────────────────────────────────────────────────

    pub fn known_state(&self, id: &CoId) -> Option<&KnownState> {
        self.known.get(id)
    }

    pub fn optimistic_known_state(&self, id: &CoId) -> Option<&KnownState> {
        self.optimistic.get(id)
    }

    /// Replace both views with what the peer just told us.
    pub fn set_known_state(&mut self, known: KnownState) {
        self.optimistic.insert(known.id, known.clone());
        self.known.insert(known.id, known);
    }

    /// Merge a confirmation into both views.
    pub fn combine_with(&mut self, known: &KnownState) {
        self.known
            .entry(known.id)
            .or_insert_with(|| KnownState::empty(known.id))
            .combine_with(known);
        self.optimistic
            .entry(known.id)
            .or_insert_with(|| KnownState::empty(known.id))
            .combine_with(known);
    }

    /// Record content we sent and expect the peer to accept.
    pub fn combine_optimistic_with(&mut self, known: &KnownState) {
        self.optimistic
            .entry(known.id)
            .or_insert_with(|| KnownState::empty(known.id))
            .combine_with(known);
    }

    /// Whether the peer takes part in syncing `id`: it loaded it, sent us
    /// content for it, or acknowledged content we sent.
    pub fn is_subscribed(&self, id: &CoId) -> bool {
        self.known.contains_key(id)
    }

    pub fn track_told_known_state(&mut self, id: CoId) {
        self.told_known.insert(id);
    }

    pub fn has_told_known_state(&self, id: &CoId) -> bool {
        self.told_known.contains(id)
    }

    /// Remember that we sent a LOAD and wait for the answer.
    pub fn mark_load_requested(&mut self, id: CoId) {
        self.requested.insert(id);
    }

    pub fn has_requested_load(&self, id: &CoId) -> bool {
        self.requested.contains(id)
    }

    /// CoValues this peer takes part in.
    pub fn subscriptions(&self) -> impl Iterator<Item = &CoId> {
        self.known.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::outgoing::spawn_outgoing;
    use crate::transport::memory;
    use covault_core::SessionId;
    use std::sync::Arc;

    fn state() -> PeerState {
        let (sink, _source, _b_sink, _b_source) = memory::raw_pair();
        let (outgoing, _) = spawn_outgoing(Arc::new(sink), TransportConfig::default());
        PeerState::new("server".into(), PeerRole::Server, outgoing)
    }

    fn known(sessions: &[(&str, u32)]) -> KnownState {
        KnownState {
            id: CoId::from_bytes([1; 32]),
            header: true,
            sessions: sessions
                .iter()
                .map(|(s, n)| (SessionId::from_raw(*s), *n))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_optimistic_runs_ahead_of_confirmed() {
        let mut peer = state();
        let id = CoId::from_bytes([1; 32]);
        assert!(!peer.is_subscribed(&id));

        peer.set_known_state(known(&[("a", 1)]));
        peer.combine_optimistic_with(&known(&[("a", 3), ("b", 1)]));
        assert!(peer.is_subscribed(&id));
        assert_eq!(peer.known_state(&id).unwrap().session_len(&SessionId::from_raw("a")), 1);
        assert_eq!(
            peer.optimistic_known_state(&id)
                .unwrap()
                .session_len(&SessionId::from_raw("b")),
            1
        );

        peer.combine_with(&known(&[("a", 2)]));
        assert_eq!(peer.known_state(&id).unwrap().session_len(&SessionId::from_raw("a")), 2);
        assert_eq!(
            peer.optimistic_known_state(&id)
                .unwrap()
                .session_len(&SessionId::from_raw("a")),
            3
        );

        // A correction resets both views.
        peer.set_known_state(known(&[]));
        assert_eq!(
            peer.optimistic_known_state(&id)
                .unwrap()
                .session_len(&SessionId::from_raw("a")),
            0
        );
    }
}
