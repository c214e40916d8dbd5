//! The Sync Manager.
//!
//! Tracks, per peer and CoValue, what the peer has confirmed and what we
//! already sent it, and turns the four protocol messages into log appends
//! and replies. Storage takes part as one more participant with its own
//! known state: whatever the node has and storage lacks is written on the
//! next change, and a CoValue that is not in memory is looked up there
//! before any peer is asked.
//!
//! The manager is not thread-safe by itself. A node keeps it behind one
//! async mutex so that validate, ingest and materialize for a CoValue never
//! interleave with another operation on it.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use covault_core::{peer_has_all_content, ChunkLimits, CoId, KnownState, NewContent, SessionId};
use covault_store::{StorageAdapter, StoreOutcome};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::messages::{PeerId, SyncMessage};
use crate::outgoing::OutgoingHandle;
use crate::peer::{PeerEvent, PeerRole};
use crate::peer_state::PeerState;
use crate::registry::{IngestError, Registry};

/// Unsynced marker used while no server peer is connected.
pub const NO_SERVER_PEER: &str = "*";

/// Where inbound content came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSource {
    Peer(PeerId),
    Storage,
}

impl ContentSource {
    fn peer(&self) -> Option<&PeerId> {
        match self {
            ContentSource::Peer(id) => Some(id),
            ContentSource::Storage => None,
        }
    }
}

/// A CoValue we asked servers for.
#[derive(Debug, Default)]
struct PendingLoad {
    /// Peers asked that have not answered "not found" yet.
    asked: HashSet<PeerId>,
    /// Peers whose LOAD we answer once the CoValue shows up.
    waiting: Vec<PeerId>,
}

/// Per-node sync state.
pub struct SyncManager {
    config: SyncConfig,
    registry: Registry,
    peers: BTreeMap<PeerId, PeerState>,
    storage: Option<Arc<dyn StorageAdapter>>,
    storage_known: HashMap<CoId, KnownState>,
    /// Content held back until the keyed dependency is loaded.
    waiting_on: HashMap<CoId, Vec<(NewContent, ContentSource)>>,
    loads: HashMap<CoId, PendingLoad>,
    unavailable: HashSet<CoId>,
    /// Server peers (or [`NO_SERVER_PEER`]) that lack local changes.
    unsynced: HashMap<CoId, HashSet<String>>,
    deleted_pending: HashSet<CoId>,
    /// CoValues whose last write to storage failed.
    unpersisted: HashSet<CoId>,
    changed: Arc<Notify>,
}

impl SyncManager {
    pub fn new(config: SyncConfig, registry: Registry) -> Self {
        Self {
            config,
            registry,
            peers: BTreeMap::new(),
            storage: None,
            storage_known: HashMap::new(),
            waiting_on: HashMap::new(),
            loads: HashMap::new(),
            unavailable: HashSet::new(),
            unsynced: HashMap::new(),
            deleted_pending: HashSet::new(),
            unpersisted: HashSet::new(),
            changed: Arc::new(Notify::new()),
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Local writes go through here; follow them with [`sync_local`](Self::sync_local).
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn storage(&self) -> Option<&Arc<dyn StorageAdapter>> {
        self.storage.as_ref()
    }

    /// Notified whenever content arrives, a peer confirms something or a
    /// load resolves. Create the `notified()` future before releasing the
    /// lock around the manager so no wakeup is missed.
    pub fn changes(&self) -> Arc<Notify> {
        self.changed.clone()
    }

    pub fn peer(&self, id: &PeerId) -> Option<&PeerState> {
        self.peers.get(id)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    /// Every server peer asked for `id` answered that it does not have it.
    pub fn is_unavailable(&self, id: &CoId) -> bool {
        self.unavailable.contains(id)
    }

    fn server_ids(&self) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|p| p.is_server() && !p.is_closed())
            .map(|p| p.id().clone())
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────

    /// Start syncing with a peer. Server peers are asked about every
    /// CoValue in memory so both sides catch up.
    pub fn add_peer(&mut self, id: PeerId, role: PeerRole, outgoing: OutgoingHandle) {
        if let Some(previous) = self.peers.remove(&id) {
            debug!(peer = %id, "replacing existing peer");
            previous.close();
        }
        let mut state = PeerState::new(id.clone(), role, outgoing);

        if role == PeerRole::Server {
            let mut ids = self.registry.ids();
            ids.sort();
            for co in ids {
                if let Some(core) = self.registry.get(&co) {
                    state.send(SyncMessage::Load(core.known_state()));
                    state.mark_load_requested(co);
                }
            }
        }

        info!(peer = %id, ?role, "peer added");
        self.peers.insert(id, state);
    }

    /// Forget a peer and close its connection after the queue drains.
    pub fn remove_peer(&mut self, id: &PeerId) -> bool {
        let Some(peer) = self.peers.remove(id) else {
            return false;
        };
        peer.close();

        let given_up: Vec<CoId> = self
            .loads
            .iter_mut()
            .filter_map(|(co, load)| {
                load.waiting.retain(|p| p != id);
                (load.asked.remove(id) && load.asked.is_empty()).then_some(*co)
            })
            .collect();
        for co in given_up {
            self.resolve_not_found(&co);
        }

        info!(peer = %id, "peer removed");
        self.changed.notify_waiters();
        true
    }

    /// Dispatch one event from a peer's connection.
    pub async fn handle_event(&mut self, from: &PeerId, event: PeerEvent) {
        match event {
            PeerEvent::Message(msg) => self.handle_message(from, msg).await,
            PeerEvent::Disconnected => {
                self.remove_peer(from);
            }
        }
    }

    pub async fn handle_message(&mut self, from: &PeerId, msg: SyncMessage) {
        if !self.peers.contains_key(from) {
            warn!(peer = %from, action = msg.action(), "message from unknown peer");
            return;
        }
        debug!(peer = %from, co = %msg.id(), action = msg.action(), "handling message");

        match msg {
            SyncMessage::Load(known) => self.handle_load(from, known).await,
            SyncMessage::Known(known) => self.handle_known(from, known).await,
            SyncMessage::Correction(known) => self.handle_correction(from, known),
            SyncMessage::Content(content) => {
                self.handle_content(content, ContentSource::Peer(from.clone()))
                    .await
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Handlers
    // ─────────────────────────────────────────────────────────────────────

    async fn handle_load(&mut self, from: &PeerId, known: KnownState) {
        let id = known.id;
        if let Some(peer) = self.peers.get_mut(from) {
            // The peer's word replaces what we assumed, so data it lost
            // (a restart without storage, say) gets resent.
            peer.set_known_state(known);
        }

        if self.load_from_storage(&id).await {
            self.send_new_content(&id, from, true);
            return;
        }

        let servers: Vec<PeerId> = self
            .server_ids()
            .into_iter()
            .filter(|s| s != from)
            .collect();
        if servers.is_empty() {
            self.reply_not_found(&id, from);
            return;
        }

        self.loads
            .entry(id)
            .or_default()
            .waiting
            .push(from.clone());
        self.request_load(&id, &servers);
    }

    async fn handle_known(&mut self, from: &PeerId, known: KnownState) {
        let id = known.id;
        let has_header = known.header;
        if let Some(peer) = self.peers.get_mut(from) {
            peer.combine_with(&known);
        }

        if !has_header {
            let exhausted = self
                .loads
                .get_mut(&id)
                .is_some_and(|load| load.asked.remove(from) && load.asked.is_empty());
            if exhausted {
                self.resolve_not_found(&id);
            }
        }

        if self.registry.contains(&id) {
            self.send_new_content(&id, from, false);
        }
        self.update_sync_state(&id, from).await;
        self.changed.notify_waiters();
    }

    fn handle_correction(&mut self, from: &PeerId, known: KnownState) {
        let id = known.id;
        debug!(peer = %from, co = %id, "peer corrected our assumption");
        if let Some(peer) = self.peers.get_mut(from) {
            peer.set_known_state(known);
        }
        self.send_new_content(&id, from, false);
    }

    /// Ingest content and everything that was waiting for it.
    pub async fn handle_content(&mut self, msg: NewContent, source: ContentSource) {
        if source != ContentSource::Storage {
            self.retry_persistence().await;
        }
        let mut work = VecDeque::from([(msg, source)]);
        while let Some((msg, source)) = work.pop_front() {
            self.process_content(msg, source, &mut work).await;
        }
    }

    async fn process_content(
        &mut self,
        msg: NewContent,
        source: ContentSource,
        released: &mut VecDeque<(NewContent, ContentSource)>,
    ) {
        let id = msg.id;

        // Look in storage before believing we have never seen it.
        if !self.registry.contains(&id) {
            self.load_from_storage(&id).await;
        }

        let mut missing = self.registry.missing_dependencies(&msg);
        if !missing.is_empty() {
            for dep in &missing {
                self.load_from_storage(dep).await;
            }
            missing.retain(|dep| !self.registry.contains(dep));
        }
        if let Some(dep) = missing.first().copied() {
            debug!(co = %id, dependency = %dep, "holding content until dependency loads");
            let mut targets = self.server_ids();
            if let Some(p) = source.peer() {
                if !targets.contains(p) {
                    targets.push(p.clone());
                }
            }
            for dep in &missing {
                self.request_load(dep, &targets);
            }
            self.waiting_on.entry(dep).or_default().push((msg, source));
            return;
        }

        let ingested = match self.registry.ingest(&msg) {
            Ok(ingested) => ingested,
            Err(IngestError::UnknownCoValue) => {
                match source.peer() {
                    Some(p) => {
                        debug!(peer = %p, co = %id, "content without header, asking for everything");
                        if let Some(peer) = self.peers.get_mut(p) {
                            peer.send(SyncMessage::Correction(KnownState::empty(id)));
                            peer.track_told_known_state(id);
                        }
                    }
                    None => warn!(co = %id, "storage returned content without a header"),
                }
                return;
            }
            Err(IngestError::Rejected(reason)) => {
                warn!(co = %id, %reason, "rejected content");
                return;
            }
        };

        // Acknowledge to the sender.
        if let Some(p) = source.peer() {
            let skip: Vec<&SessionId> = ingested.rejected.iter().map(|(s, _)| s).collect();
            let claimed = content_known_state(&msg, &skip);
            if let (Some(peer), Some(core)) = (self.peers.get_mut(p), self.registry.get(&id)) {
                peer.combine_with(&claimed);
                let ours = reply_known_state(core.known_state(), core.is_deleted(), peer);
                if ingested.needs_correction {
                    peer.send(SyncMessage::Correction(ours));
                } else {
                    peer.send(SyncMessage::Known(ours));
                }
                peer.track_told_known_state(id);
            }
        }

        if ingested.newly_deleted {
            self.enqueue_deleted(&id).await;
        }
        if source != ContentSource::Storage && ingested.has_new_content() {
            self.persist(&id).await;
        }

        // Forward to everyone following this CoValue; ask servers that
        // do not follow it yet.
        let from = source.peer().cloned();
        let peer_ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        for pid in peer_ids {
            let (subscribed, should_ask) = match self.peers.get(&pid) {
                Some(peer) if !peer.is_closed() => (
                    peer.is_subscribed(&id),
                    peer.is_server()
                        && Some(&pid) != from.as_ref()
                        && !peer.has_requested_load(&id),
                ),
                _ => continue,
            };
            if subscribed {
                self.send_new_content(&id, &pid, false);
            } else if should_ask {
                let (Some(peer), Some(core)) = (self.peers.get_mut(&pid), self.registry.get(&id))
                else {
                    continue;
                };
                peer.send(SyncMessage::Load(core.known_state()));
                peer.mark_load_requested(id);
            }
        }

        if let Some(load) = self.loads.remove(&id) {
            for waiting in load.waiting {
                self.send_new_content(&id, &waiting, true);
            }
        }
        self.unavailable.remove(&id);
        self.changed.notify_waiters();

        if let Some(waiting) = self.waiting_on.remove(&id) {
            debug!(co = %id, count = waiting.len(), "releasing content that waited on dependency");
            released.extend(waiting);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────────────

    /// Send `to` what it lacks of `id`, dependencies first.
    ///
    /// With `force`, a KNOWN goes out even when there is nothing to send.
    pub fn send_new_content(&mut self, id: &CoId, to: &PeerId, force: bool) {
        let limits = self.config.peer_chunk_limits;
        let Some(peer) = self.peers.get_mut(to) else {
            return;
        };
        let mut seen = HashSet::new();
        send_with_dependencies(&self.registry, peer, id, force, limits, &mut seen);
    }

    /// Ask `peers` for `id`, skipping those already asked.
    fn request_load(&mut self, id: &CoId, peers: &[PeerId]) {
        let load = self.loads.entry(*id).or_default();
        for pid in peers {
            if load.asked.contains(pid) {
                continue;
            }
            let Some(peer) = self.peers.get_mut(pid) else {
                continue;
            };
            debug!(peer = %pid, co = %id, "requesting CoValue");
            let known = peer
                .known_state(id)
                .cloned()
                .unwrap_or_else(|| KnownState::empty(*id));
            peer.send(SyncMessage::Load(known));
            peer.mark_load_requested(*id);
            load.asked.insert(pid.clone());
        }
        if load.asked.is_empty() && load.waiting.is_empty() {
            self.loads.remove(id);
        }
    }

    fn reply_not_found(&mut self, id: &CoId, to: &PeerId) {
        if let Some(peer) = self.peers.get_mut(to) {
            peer.send(SyncMessage::Known(KnownState::empty(*id)));
            peer.track_told_known_state(*id);
        }
    }

    fn resolve_not_found(&mut self, id: &CoId) {
        let Some(load) = self.loads.remove(id) else {
            return;
        };
        debug!(co = %id, "no peer has the CoValue");
        for waiting in load.waiting {
            self.reply_not_found(id, &waiting);
        }
        if let Some(dropped) = self.waiting_on.remove(id) {
            warn!(co = %id, count = dropped.len(), "dropping content whose dependency is unavailable");
        }
        if !self.registry.contains(id) {
            self.unavailable.insert(*id);
        }
        self.changed.notify_waiters();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Local changes
    // ─────────────────────────────────────────────────────────────────────

    /// Make `id` available in memory, from storage or from server peers.
    ///
    /// Returns `true` if it is available now. Otherwise servers were asked
    /// and [`changes`](Self::changes) fires when they answer.
    pub async fn load(&mut self, id: &CoId) -> bool {
        if self.load_from_storage(id).await {
            return true;
        }
        let servers = self.server_ids();
        if servers.is_empty() {
            self.unavailable.insert(*id);
            return false;
        }
        self.unavailable.remove(id);
        self.request_load(id, &servers);
        false
    }

    /// Push a local change to storage and to peers.
    ///
    /// Server peers always get it; client peers only if they follow the
    /// CoValue.
    pub async fn sync_local(&mut self, id: &CoId) {
        if !self.registry.contains(id) {
            return;
        }
        self.retry_persistence().await;
        self.persist(id).await;

        let peer_ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        for pid in peer_ids {
            let follows = self
                .peers
                .get(&pid)
                .is_some_and(|p| !p.is_closed() && (p.is_server() || p.is_subscribed(id)));
            if follows {
                self.send_new_content(id, &pid, false);
            }
        }

        self.track_unsynced(id).await;
        self.changed.notify_waiters();
    }

    /// Record a local deletion: queue the CoValue for erasure and sync the
    /// tombstone.
    pub async fn delete_covalue(&mut self, id: &CoId) {
        self.enqueue_deleted(id).await;
        self.sync_local(id).await;
    }

    /// Erase every queued deleted CoValue, in memory and in storage, down
    /// to its tombstone. Returns how many CoValues storage erased, or the
    /// in-memory count without storage.
    pub async fn erase_all_deleted_covalues(&mut self) -> Result<usize> {
        let mut pending: HashSet<CoId> = std::mem::take(&mut self.deleted_pending);
        if let Some(storage) = &self.storage {
            pending.extend(storage.all_deleted_pending().await?);
        }

        let mut erased = 0;
        for id in &pending {
            if self.registry.erase(id) {
                erased += 1;
            }
        }

        if let Some(storage) = self.storage.clone() {
            erased = storage.erase_all_deleted_covalues().await?;
            for id in &pending {
                match storage.known_state(id).await {
                    Ok(known) => {
                        self.storage_known.insert(*id, known);
                    }
                    Err(e) => warn!(co = %id, error = %e, "failed to read storage state after erase"),
                }
            }
        }
        info!(erased, "erased deleted CoValues");
        Ok(erased)
    }

    async fn enqueue_deleted(&mut self, id: &CoId) {
        self.deleted_pending.insert(*id);
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.enqueue_deleted(id).await {
                warn!(co = %id, error = %e, "failed to enqueue deleted CoValue");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Unsynced tracking
    // ─────────────────────────────────────────────────────────────────────

    /// Whether every connected server peer confirmed all of `id`.
    pub fn is_synced(&self, id: &CoId) -> bool {
        let Some(core) = self.registry.get(id) else {
            return false;
        };
        let ours = core.known_state();
        self.peers
            .values()
            .filter(|p| p.is_server() && !p.is_closed())
            .all(|p| {
                p.known_state(id)
                    .is_some_and(|theirs| peer_has_all_content(&ours, theirs))
            })
    }

    /// Whether `peer` confirmed all of `id`.
    pub fn is_synced_with(&self, id: &CoId, peer: &PeerId) -> bool {
        let (Some(core), Some(peer)) = (self.registry.get(id), self.peers.get(peer)) else {
            return false;
        };
        peer.known_state(id)
            .is_some_and(|theirs| peer_has_all_content(&core.known_state(), theirs))
    }

    async fn track_unsynced(&mut self, id: &CoId) {
        let servers = self.server_ids();
        let mut targets: Vec<String> = servers
            .iter()
            .filter(|s| !self.is_synced_with(id, s))
            .map(|s| s.as_str().to_string())
            .collect();
        if servers.is_empty() {
            targets.push(NO_SERVER_PEER.to_string());
        }

        let entry = self.unsynced.entry(*id).or_default();
        let fresh: Vec<String> = targets
            .into_iter()
            .filter(|t| entry.insert(t.clone()))
            .collect();
        if entry.is_empty() {
            self.unsynced.remove(id);
        }

        if let Some(storage) = &self.storage {
            for target in fresh {
                if let Err(e) = storage.mark_unsynced(id, &target).await {
                    warn!(co = %id, peer = %target, error = %e, "failed to mark unsynced");
                }
            }
        }
    }

    async fn update_sync_state(&mut self, id: &CoId, from: &PeerId) {
        let is_server = self.peers.get(from).is_some_and(PeerState::is_server);
        if !is_server || !self.is_synced_with(id, from) {
            return;
        }
        let Some(entry) = self.unsynced.get_mut(id) else {
            return;
        };
        let cleared: Vec<String> = [from.as_str(), NO_SERVER_PEER]
            .into_iter()
            .filter(|t| entry.remove(*t))
            .map(str::to_string)
            .collect();
        if entry.is_empty() {
            self.unsynced.remove(id);
        }

        if let Some(storage) = &self.storage {
            for target in cleared {
                if let Err(e) = storage.mark_synced(id, &target).await {
                    warn!(co = %id, peer = %target, error = %e, "failed to mark synced");
                }
            }
        }
        debug!(co = %id, peer = %from, "synced to server");
    }

    /// CoValues storage still lists as not confirmed by a server.
    pub async fn unsynced_covalue_ids(&self) -> Result<Vec<CoId>> {
        match &self.storage {
            Some(storage) => Ok(storage.unsynced_covalue_ids().await?),
            None => Ok(self.unsynced.keys().copied().collect()),
        }
    }

    /// Pick up syncing a CoValue left unsynced by a previous run.
    pub async fn resume(&mut self, id: &CoId) {
        if !self.load_from_storage(id).await {
            warn!(co = %id, "unsynced CoValue not found in storage");
            if let Some(storage) = &self.storage {
                if let Err(e) = storage.mark_synced(id, NO_SERVER_PEER).await {
                    warn!(co = %id, error = %e, "failed to clear unsynced marker");
                }
            }
            return;
        }

        let servers = self.server_ids();
        for server in &servers {
            self.send_new_content(id, server, false);
        }
        let mut markers: HashSet<String> = servers.iter().map(|s| s.as_str().to_string()).collect();
        markers.insert(NO_SERVER_PEER.to_string());
        self.unsynced.entry(*id).or_default().extend(markers);
        self.track_unsynced(id).await;
        debug!(co = %id, "resumed unsynced CoValue");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Storage
    // ─────────────────────────────────────────────────────────────────────

    /// Load `id` and its dependencies from storage unless already in
    /// memory. Returns whether `id` is in memory afterwards.
    async fn load_from_storage(&mut self, id: &CoId) -> bool {
        if self.registry.contains(id) {
            return true;
        }
        let Some(storage) = self.storage.clone() else {
            return false;
        };

        let mut stack = vec![*id];
        while let Some(next) = stack.pop() {
            if self.registry.contains(&next) {
                continue;
            }
            let (tx, mut rx) = mpsc::channel::<NewContent>(16);
            let limits = self.config.storage_chunk_limits;
            let registry = &mut self.registry;

            let load = storage.load(&next, limits, tx);
            let ingest = async {
                let mut chunks = 0;
                while let Some(chunk) = rx.recv().await {
                    chunks += 1;
                    if let Err(e) = registry.ingest(&chunk) {
                        warn!(co = %next, error = ?e, "stored content failed to ingest");
                    }
                }
                chunks
            };
            let (found, chunks) = tokio::join!(load, ingest);

            match found {
                Ok(true) => debug!(co = %next, chunks, "loaded from storage"),
                Ok(false) => continue,
                Err(e) => {
                    warn!(co = %next, error = %e, "failed to load from storage");
                    continue;
                }
            }

            if let Some(core) = self.registry.get(&next) {
                self.storage_known.insert(next, core.known_state());
            }
            stack.extend(
                self.registry
                    .dependencies(&next)
                    .into_iter()
                    .filter(|d| !self.registry.contains(d)),
            );
        }
        self.registry.contains(id)
    }

    /// Write whatever storage lacks of `id`.
    async fn persist(&mut self, id: &CoId) {
        let Some(storage) = self.storage.clone() else {
            return;
        };
        let limits = self.config.storage_chunk_limits;

        // One retry: a correction means storage lost something we assumed
        // it had, and the second diff starts from its real state.
        for _ in 0..2 {
            let Some(core) = self.registry.get(id) else {
                return;
            };
            let pieces = core.new_content_since(self.storage_known.get(id), limits);
            let mut corrected = None;
            for piece in &pieces {
                match storage.store(piece).await {
                    Ok(StoreOutcome::Stored(known)) => {
                        self.storage_known.insert(*id, known);
                    }
                    Ok(StoreOutcome::Correction(known)) => {
                        debug!(co = %id, "storage asked for a correction");
                        corrected = Some(known);
                        break;
                    }
                    Err(e) => {
                        warn!(co = %id, error = %e, "failed to store content, will retry");
                        self.unpersisted.insert(*id);
                        return;
                    }
                }
            }
            match corrected {
                Some(known) => {
                    self.storage_known.insert(*id, known);
                }
                None => {
                    self.unpersisted.remove(id);
                    return;
                }
            }
        }
        warn!(co = %id, "storage still behind after correction, will retry");
        self.unpersisted.insert(*id);
    }

    /// CoValues with changes storage has not accepted yet.
    pub fn unpersisted_ids(&self) -> Vec<CoId> {
        self.unpersisted.iter().copied().collect()
    }

    /// Write again everything a failed store left behind, along with its
    /// unsynced markers. Returns how many CoValues are still not persisted.
    pub async fn retry_persistence(&mut self) -> usize {
        if self.unpersisted.is_empty() {
            return 0;
        }
        let Some(storage) = self.storage.clone() else {
            self.unpersisted.clear();
            return 0;
        };

        let pending = std::mem::take(&mut self.unpersisted);
        for id in &pending {
            self.persist(id).await;
            if self.unpersisted.contains(id) {
                continue;
            }
            let targets: Vec<String> = self
                .unsynced
                .get(id)
                .map(|t| t.iter().cloned().collect())
                .unwrap_or_default();
            for target in targets {
                if let Err(e) = storage.mark_unsynced(id, &target).await {
                    warn!(co = %id, peer = %target, error = %e, "failed to mark unsynced");
                }
            }
        }

        let recovered = pending.len().saturating_sub(self.unpersisted.len());
        if recovered > 0 {
            info!(recovered, remaining = self.unpersisted.len(), "persisted after storage failure");
        }
        self.unpersisted.len()
    }
}

/// What a content message says its sender has, minus refused sessions.
fn content_known_state(msg: &NewContent, skip: &[&SessionId]) -> KnownState {
    KnownState {
        id: msg.id,
        header: true,
        sessions: msg
            .new
            .iter()
            .filter(|(session, _)| !skip.contains(session))
            .map(|(session, piece)| (session.clone(), piece.end()))
            .collect(),
    }
}

/// Our known state as told to `peer`. For a deleted CoValue, whatever the
/// peer already has is echoed back so it stops sending sessions we drop.
fn reply_known_state(mut ours: KnownState, deleted: bool, peer: &PeerState) -> KnownState {
    if deleted {
        if let Some(theirs) = peer.known_state(&ours.id) {
            ours.sessions.extend(
                theirs
                    .sessions
                    .iter()
                    .filter(|(s, _)| !s.is_delete())
                    .map(|(s, n)| (s.clone(), *n)),
            );
        }
    }
    ours
}

fn send_with_dependencies(
    registry: &Registry,
    peer: &mut PeerState,
    id: &CoId,
    force: bool,
    limits: ChunkLimits,
    seen: &mut HashSet<CoId>,
) {
    if !seen.insert(*id) {
        return;
    }
    let Some(core) = registry.get(id) else {
        return;
    };

    for dep in registry.dependencies(id) {
        send_with_dependencies(registry, peer, &dep, false, limits, seen);
    }

    let pieces = core.new_content_since(peer.optimistic_known_state(id), limits);
    if !pieces.is_empty() {
        debug!(peer = %peer.id(), co = %id, pieces = pieces.len(), "sending content");
        for piece in pieces {
            peer.send(SyncMessage::Content(piece));
        }
        peer.combine_optimistic_with(&core.known_state());
    } else if force || !peer.has_told_known_state(id) {
        let known = reply_known_state(core.known_state(), core.is_deleted(), peer);
        peer.send(SyncMessage::Known(known));
    }
    peer.track_told_known_state(*id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::messages::decode_frame;
    use crate::outgoing::spawn_outgoing;
    use crate::transport::memory::{self, MemorySource};
    use crate::transport::FrameSource;
    use covault_core::{
        AgentSecret, CoMap, CoValueCore, CoValueHeader, CoValueKind, CryptoProvider, NativeCrypto,
        Privacy, Ruleset,
    };
    use covault_store::MemoryStorage;
    use serde_json::json;

    fn crypto() -> Arc<dyn CryptoProvider> {
        Arc::new(NativeCrypto::new())
    }

    fn manager() -> SyncManager {
        SyncManager::new(SyncConfig::default(), Registry::new(crypto(), None))
    }

    /// Connect `name` to `manager`, returning what the peer receives.
    fn attach(manager: &mut SyncManager, name: &str, role: PeerRole) -> MemorySource {
        let (sink, _source, _remote_sink, remote_source) = memory::raw_pair();
        let config = TransportConfig {
            batching_by_default: false,
            ping_interval_ms: 0,
            ..TransportConfig::default()
        };
        let (outgoing, _) = spawn_outgoing(Arc::new(sink), config);
        manager.add_peer(name.into(), role, outgoing);
        remote_source
    }

    async fn next_message(source: &mut MemorySource) -> SyncMessage {
        let frame = source.next_frame().await.unwrap();
        decode_frame(&frame).unwrap().messages.remove(0)
    }

    /// A trusting map with one transaction, outside any group.
    fn open_map(seed: u8) -> CoValueCore {
        let agent = AgentSecret::from_seed(&[seed; 32]);
        let header = CoValueHeader {
            kind: CoValueKind::Map,
            ruleset: Ruleset::UnsafeAllowAll,
            meta: None,
            uniqueness: json!(seed),
            created_at: None,
        };
        let mut core = CoValueCore::new(header, crypto()).unwrap();
        core.append_transaction(
            &agent,
            &SessionId::new(&agent.id(), &[0; 8]),
            &[CoMap::set_change("k", seed as i64)],
            Privacy::Trusting,
            None,
            1,
        )
        .unwrap();
        core
    }

    fn full(core: &CoValueCore) -> NewContent {
        core.new_content_since(None, ChunkLimits::UNLIMITED).remove(0)
    }

    #[tokio::test]
    async fn test_load_unknown_replies_empty_known() {
        let mut sync = manager();
        let mut client = attach(&mut sync, "client", PeerRole::Client);
        let id = CoId::from_bytes([7; 32]);

        sync.handle_message(&"client".into(), SyncMessage::Load(KnownState::empty(id)))
            .await;
        assert_eq!(next_message(&mut client).await, SyncMessage::Known(KnownState::empty(id)));
    }

    #[tokio::test]
    async fn test_load_sends_content_then_known_only_once() {
        let mut sync = manager();
        let core = open_map(1);
        let id = core.id();
        sync.registry_mut().insert(core);
        let mut client = attach(&mut sync, "client", PeerRole::Client);

        sync.handle_message(&"client".into(), SyncMessage::Load(KnownState::empty(id)))
            .await;
        let SyncMessage::Content(content) = next_message(&mut client).await else {
            panic!("expected content");
        };
        assert!(content.header.is_some());
        assert_eq!(content.transaction_count(), 1);

        // Up to date now: a second LOAD with the full state gets a KNOWN.
        let known = sync.registry().get(&id).unwrap().known_state();
        sync.handle_message(&"client".into(), SyncMessage::Load(known.clone()))
            .await;
        assert_eq!(next_message(&mut client).await, SyncMessage::Known(known));
    }

    #[tokio::test]
    async fn test_content_is_acknowledged_and_forwarded() {
        let mut sync = manager();
        let core = open_map(1);
        let id = core.id();
        let mut alice = attach(&mut sync, "alice", PeerRole::Client);
        let mut bob = attach(&mut sync, "bob", PeerRole::Client);

        // Bob follows the CoValue before it exists here.
        sync.handle_message(&"bob".into(), SyncMessage::Load(KnownState::empty(id)))
            .await;
        assert_eq!(next_message(&mut bob).await, SyncMessage::Known(KnownState::empty(id)));

        sync.handle_message(&"alice".into(), SyncMessage::Content(full(&core)))
            .await;
        assert_eq!(
            next_message(&mut alice).await,
            SyncMessage::Known(core.known_state())
        );
        let SyncMessage::Content(forwarded) = next_message(&mut bob).await else {
            panic!("expected forwarded content");
        };
        assert_eq!(forwarded.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_gap_answers_with_correction() {
        let mut sync = manager();
        let core = open_map(1);
        let id = core.id();
        let mut alice = attach(&mut sync, "alice", PeerRole::Client);

        let mut msg = full(&core);
        for piece in msg.new.values_mut() {
            piece.after = 3;
        }
        sync.handle_message(&"alice".into(), SyncMessage::Content(msg))
            .await;

        let mut expected = KnownState::empty(id);
        expected.header = true;
        assert_eq!(next_message(&mut alice).await, SyncMessage::Correction(expected));
    }

    #[tokio::test]
    async fn test_headerless_content_for_unknown_requests_everything() {
        let mut sync = manager();
        let core = open_map(1);
        let mut alice = attach(&mut sync, "alice", PeerRole::Client);

        let mut msg = full(&core);
        msg.header = None;
        sync.handle_message(&"alice".into(), SyncMessage::Content(msg))
            .await;
        assert_eq!(
            next_message(&mut alice).await,
            SyncMessage::Correction(KnownState::empty(core.id()))
        );
    }

    #[tokio::test]
    async fn test_local_change_goes_to_storage_and_servers() {
        let storage = Arc::new(MemoryStorage::new());
        let mut sync = manager().with_storage(storage.clone());
        let mut server = attach(&mut sync, "server", PeerRole::Server);

        let core = open_map(1);
        let id = core.id();
        let known = core.known_state();
        sync.registry_mut().insert(core);
        sync.sync_local(&id).await;

        assert_eq!(storage.known_state(&id).await.unwrap(), known);
        assert!(matches!(next_message(&mut server).await, SyncMessage::Content(_)));
        assert_eq!(storage.unsynced_covalue_ids().await.unwrap(), vec![id]);
        assert!(!sync.is_synced(&id));

        sync.handle_message(&"server".into(), SyncMessage::Known(known))
            .await;
        assert!(sync.is_synced(&id));
        assert!(storage.unsynced_covalue_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_falls_back_to_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let core = open_map(1);
        let id = core.id();
        storage.store(&full(&core)).await.unwrap();

        let mut sync = manager().with_storage(storage);
        assert!(sync.load(&id).await);
        let content = sync.registry().content(&id).unwrap().content();
        assert_eq!(content.as_map().unwrap().get("k"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_load_from_server_on_behalf_of_client() {
        let mut sync = manager();
        let core = open_map(1);
        let id = core.id();
        let mut server = attach(&mut sync, "server", PeerRole::Server);
        let mut client = attach(&mut sync, "client", PeerRole::Client);

        sync.handle_message(&"client".into(), SyncMessage::Load(KnownState::empty(id)))
            .await;
        assert_eq!(next_message(&mut server).await, SyncMessage::Load(KnownState::empty(id)));

        sync.handle_message(&"server".into(), SyncMessage::Content(full(&core)))
            .await;
        assert!(matches!(next_message(&mut client).await, SyncMessage::Content(_)));
    }

    #[tokio::test]
    async fn test_not_found_on_all_servers() {
        let mut sync = manager();
        let id = CoId::from_bytes([3; 32]);
        let _server = attach(&mut sync, "server", PeerRole::Server);

        assert!(!sync.load(&id).await);
        assert!(!sync.is_unavailable(&id));
        sync.handle_message(&"server".into(), SyncMessage::Known(KnownState::empty(id)))
            .await;
        assert!(sync.is_unavailable(&id));
    }

    #[tokio::test]
    async fn test_disconnect_removes_peer() {
        let mut sync = manager();
        let _client = attach(&mut sync, "client", PeerRole::Client);
        sync.handle_event(&"client".into(), PeerEvent::Disconnected).await;
        assert!(sync.peer(&"client".into()).is_none());
    }
}
