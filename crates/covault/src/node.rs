//! The local node: one agent's view of every CoValue it knows.
//!
//! A node brings together the transaction logs, the permission resolver,
//! the Sync Manager and (optionally) storage. All state sits behind one
//! async mutex, so validating, ingesting and materializing a CoValue never
//! interleaves with a local write to it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use covault_core::{
    AgentId, AgentSecret, CoId, CoMap, CoValueCore, CoValueHeader, CoValueKind, Content,
    CryptoProvider, KnownState, NativeCrypto, Privacy, SessionId, TransactionId,
};
use covault_perms::{
    add_member_changes, create_group_changes, extend_changes, new_read_key, set_role_change,
    Member, ParentRole, ReadKey, Role,
};
use covault_store::StorageAdapter;
use covault_sync::{
    connect_peer, Connection, Peer, PeerEvent, PeerId, PeerRole, Registry, SyncConfig,
    SyncManager, TransportConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{NodeError, Result};

/// Configuration for a [`LocalNode`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Chunking towards peers and storage, resume batch size.
    pub sync: SyncConfig,
    /// Applied to every connection the node opens.
    pub transport: TransportConfig,
}

/// How a local transaction is written.
#[derive(Debug, Clone, PartialEq)]
pub struct TxOptions {
    /// Encrypt with the owning group's read key. Groups and unowned
    /// CoValues are always written in the clear.
    pub private: bool,
    pub meta: Option<Value>,
    /// Defaults to the current time.
    pub made_at: Option<i64>,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            private: true,
            meta: None,
            made_at: None,
        }
    }
}

impl TxOptions {
    pub fn trusting() -> Self {
        Self {
            private: false,
            ..Self::default()
        }
    }

    /// Compete for `key`: among transactions carrying the same key only the
    /// earliest stays valid.
    pub fn first_writer_wins(key: impl Into<String>) -> Self {
        Self {
            meta: Some(json!({ "fww": key.into() })),
            ..Self::default()
        }
    }

    pub fn made_at(mut self, made_at: i64) -> Self {
        self.made_at = Some(made_at);
        self
    }
}

/// A node owned by one agent.
///
/// Writes go to a session created when the node starts. Every local write
/// is validated, materialized, persisted and pushed to peers before the
/// call returns.
pub struct LocalNode {
    agent: AgentSecret,
    session: SessionId,
    config: NodeConfig,
    manager: Arc<Mutex<SyncManager>>,
    changes: Arc<Notify>,
    pumps: Mutex<HashMap<PeerId, JoinHandle<()>>>,
    /// Retries writes storage refused; only runs with storage.
    persist_retry: Option<JoinHandle<()>>,
}

impl LocalNode {
    /// A node that keeps everything in memory.
    pub fn new(agent: AgentSecret, config: NodeConfig) -> Self {
        Self::build(agent, None, config)
    }

    /// A node that persists to `storage` and loads from it on demand.
    pub fn with_storage(
        agent: AgentSecret,
        storage: Arc<dyn StorageAdapter>,
        config: NodeConfig,
    ) -> Self {
        Self::build(agent, Some(storage), config)
    }

    fn build(
        agent: AgentSecret,
        storage: Option<Arc<dyn StorageAdapter>>,
        config: NodeConfig,
    ) -> Self {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(NativeCrypto::new());
        let session = SessionId::new(&agent.id(), &crypto.random_bytes(8));
        let registry = Registry::new(crypto, Some(agent.clone()));

        let has_storage = storage.is_some();
        let mut manager = SyncManager::new(config.sync.clone(), registry);
        if let Some(storage) = storage {
            manager = manager.with_storage(storage);
        }
        let changes = manager.changes();
        let manager = Arc::new(Mutex::new(manager));

        let persist_retry = match (has_storage, config.sync.persist_retry_interval()) {
            (true, Some(interval)) => spawn_persist_retry(Arc::downgrade(&manager), interval),
            _ => None,
        };

        info!(agent = %agent.id(), %session, "node started");
        Self {
            agent,
            session,
            config,
            manager,
            changes,
            pumps: Mutex::new(HashMap::new()),
            persist_retry,
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent.id()
    }

    /// The session local writes are appended to.
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Direct access to the Sync Manager, for inspection and tests.
    pub fn manager(&self) -> &Arc<Mutex<SyncManager>> {
        &self.manager
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Creating CoValues
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a CoValue from an arbitrary header.
    pub async fn create(&self, header: CoValueHeader) -> Result<CoId> {
        let mut manager = self.manager.lock().await;
        let id = insert_header(&mut manager, header)?;
        manager.sync_local(&id).await;
        Ok(id)
    }

    /// Create a group with this node's agent as its admin.
    pub async fn create_group(&self) -> Result<CoId> {
        let mut manager = self.manager.lock().await;
        let header = CoValueHeader::group(self.agent.id(), uniqueness(&manager), now_millis());
        let id = insert_header(&mut manager, header)?;

        let registry = manager.registry_mut();
        let crypto = registry.crypto();
        let (key_id, secret) = new_read_key(crypto.as_ref());
        let changes =
            create_group_changes(crypto.as_ref(), &id, &self.agent.id(), (&key_id, &secret))?;
        registry
            .resolver_mut()
            .remember_key(id, &ReadKey { id: key_id, secret });

        self.append_each(&mut manager, &id, changes)?;
        manager.sync_local(&id).await;
        info!(group = %id, "group created");
        Ok(id)
    }

    /// Create a CoValue owned by `group`.
    pub async fn create_covalue(&self, kind: CoValueKind, group: &CoId) -> Result<CoId> {
        let mut manager = self.manager.lock().await;
        if !manager.registry().resolver().has_group(group) {
            return Err(NodeError::NotFound(*group));
        }
        let header = CoValueHeader::owned_by(kind, *group, uniqueness(&manager), now_millis());
        let id = insert_header(&mut manager, header)?;
        manager.sync_local(&id).await;
        debug!(co = %id, ?kind, %group, "CoValue created");
        Ok(id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writing
    // ─────────────────────────────────────────────────────────────────────────

    /// Append one transaction carrying `changes`.
    pub async fn transact(
        &self,
        id: &CoId,
        changes: Vec<Value>,
        options: TxOptions,
    ) -> Result<TransactionId> {
        let mut manager = self.manager.lock().await;
        let tx = self.append_local(&mut manager, id, &changes, &options)?;
        manager.sync_local(id).await;
        Ok(tx)
    }

    pub async fn map_set(
        &self,
        id: &CoId,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<TransactionId> {
        self.map_set_with(id, key, value, TxOptions::default()).await
    }

    pub async fn map_set_with(
        &self,
        id: &CoId,
        key: &str,
        value: impl Into<Value>,
        options: TxOptions,
    ) -> Result<TransactionId> {
        let value = value.into();
        self.edit(id, "set a key", &options, |content| {
            content.as_map().map(|_| vec![CoMap::set_change(key, value)])
        })
        .await
    }

    pub async fn map_delete(&self, id: &CoId, key: &str) -> Result<TransactionId> {
        self.edit(id, "delete a key", &TxOptions::default(), |content| {
            content.as_map().map(|_| vec![CoMap::delete_change(key)])
        })
        .await
    }

    pub async fn list_push(&self, id: &CoId, value: impl Into<Value>) -> Result<TransactionId> {
        let value = value.into();
        self.edit(id, "push", &TxOptions::default(), |content| {
            content.as_list()?.push_change(value).map(|c| vec![c])
        })
        .await
    }

    /// Insert after the item at `index`, or at the start for `None`.
    pub async fn list_insert_after(
        &self,
        id: &CoId,
        index: Option<usize>,
        value: impl Into<Value>,
    ) -> Result<TransactionId> {
        let value = value.into();
        self.edit(id, "insert", &TxOptions::default(), |content| {
            content
                .as_list()?
                .insert_after_change(index, value)
                .map(|c| vec![c])
        })
        .await
    }

    pub async fn list_insert_before(
        &self,
        id: &CoId,
        index: usize,
        value: impl Into<Value>,
    ) -> Result<TransactionId> {
        let value = value.into();
        self.edit(id, "insert", &TxOptions::default(), |content| {
            content
                .as_list()?
                .insert_before_change(index, value)
                .map(|c| vec![c])
        })
        .await
    }

    pub async fn list_delete(&self, id: &CoId, index: usize) -> Result<TransactionId> {
        self.edit(id, "delete an item", &TxOptions::default(), |content| {
            content.as_list()?.delete_change(index).map(|c| vec![c])
        })
        .await
    }

    pub async fn text_append(&self, id: &CoId, text: &str) -> Result<TransactionId> {
        self.edit(id, "append text", &TxOptions::default(), |content| {
            content.as_plain_text()?.push_changes(text)
        })
        .await
    }

    /// Insert `text` after the character at `index`, or at the start for `None`.
    pub async fn text_insert(
        &self,
        id: &CoId,
        index: Option<usize>,
        text: &str,
    ) -> Result<TransactionId> {
        self.edit(id, "insert text", &TxOptions::default(), |content| {
            content.as_plain_text()?.insert_after_changes(index, text)
        })
        .await
    }

    /// Delete the characters in `from..to`.
    pub async fn text_delete(&self, id: &CoId, from: usize, to: usize) -> Result<TransactionId> {
        self.edit(id, "delete text", &TxOptions::default(), |content| {
            content.as_plain_text()?.delete_range_changes(from, to)
        })
        .await
    }

    pub async fn stream_push(&self, id: &CoId, item: impl Into<Value>) -> Result<TransactionId> {
        let item = item.into();
        self.edit(id, "push to a stream", &TxOptions::default(), |content| {
            content.as_stream().map(|_| vec![item])
        })
        .await
    }

    /// Build changes from the current content and append them as one transaction.
    async fn edit(
        &self,
        id: &CoId,
        action: &str,
        options: &TxOptions,
        build: impl FnOnce(&Content) -> Option<Vec<Value>>,
    ) -> Result<TransactionId> {
        let mut manager = self.manager.lock().await;
        let content = manager
            .registry()
            .content(id)
            .ok_or(NodeError::NotFound(*id))?;
        let changes = build(content.content()).ok_or_else(|| {
            NodeError::InvalidOperation(format!("cannot {} on {}", action, id))
        })?;

        let tx = self.append_local(&mut manager, id, &changes, options)?;
        manager.sync_local(id).await;
        Ok(tx)
    }

    /// Append one transaction and bring validity and content up to date.
    fn append_local(
        &self,
        manager: &mut SyncManager,
        id: &CoId,
        changes: &[Value],
        options: &TxOptions,
    ) -> Result<TransactionId> {
        let registry = manager.registry_mut();
        let core = registry.get(id).ok_or(NodeError::NotFound(*id))?;
        if core.is_deleted() {
            return Err(NodeError::Deleted(*id));
        }

        let key = match core.header().owner_group() {
            Some(group) => {
                registry
                    .resolver()
                    .require_role(&group, "write", Role::can_write)?;
                match options.private {
                    true => Some(registry.resolver().read_key(&group)?),
                    false => None,
                }
            }
            None => None,
        };
        let privacy = match &key {
            Some(key) => Privacy::Private {
                key_id: &key.id,
                key: &key.secret,
            },
            None => Privacy::Trusting,
        };

        let made_at = options.made_at.unwrap_or_else(now_millis);
        let core = registry.core_mut(id).ok_or(NodeError::NotFound(*id))?;
        let tx = core.append_transaction(
            &self.agent,
            &self.session,
            changes,
            privacy,
            options.meta.as_ref(),
            made_at,
        )?;
        registry.refresh(id);
        Ok(tx)
    }

    /// Group changes are written one per transaction.
    fn append_each(
        &self,
        manager: &mut SyncManager,
        group: &CoId,
        changes: Vec<Value>,
    ) -> Result<()> {
        let options = TxOptions::trusting().made_at(now_millis());
        for change in changes {
            self.append_local(manager, group, std::slice::from_ref(&change), &options)?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────────

    /// Give `member` a role in `group` and share the current read key.
    pub async fn add_member(&self, group: &CoId, member: Member, role: Role) -> Result<()> {
        let mut manager = self.manager.lock().await;
        let changes = {
            let registry = manager.registry();
            let resolver = registry.resolver();
            resolver.require_role(group, "add a member", Role::is_admin)?;
            let key = resolver.read_key(group)?;
            add_member_changes(
                registry.crypto().as_ref(),
                group,
                &member,
                role,
                Some((&key.id, &key.secret)),
            )?
        };

        self.append_each(&mut manager, group, changes)?;
        manager.sync_local(group).await;
        info!(%group, %member, role = role.as_str(), "member added");
        Ok(())
    }

    /// Revoke `agent` and rotate the read key so it cannot read new content.
    pub async fn remove_member(&self, group: &CoId, agent: &AgentId) -> Result<()> {
        let mut manager = self.manager.lock().await;
        manager
            .registry()
            .resolver()
            .require_role(group, "remove a member", Role::is_admin)?;
        let revoke = set_role_change(&Member::Agent(*agent), Role::Revoked);
        self.append_each(&mut manager, group, vec![revoke])?;

        let rotation = manager.registry().resolver().rotate_read_key(group)?;
        manager
            .registry_mut()
            .resolver_mut()
            .remember_key(*group, &rotation.key);
        self.append_each(&mut manager, group, rotation.changes)?;

        manager.sync_local(group).await;
        info!(%group, %agent, "member removed, read key rotated");
        Ok(())
    }

    /// Make `child` inherit the members of `parent`.
    pub async fn extend_group(
        &self,
        child: &CoId,
        parent: &CoId,
        mapping: ParentRole,
    ) -> Result<()> {
        let mut manager = self.manager.lock().await;
        let changes = {
            let registry = manager.registry();
            let resolver = registry.resolver();
            resolver.require_role(child, "extend the group", Role::is_admin)?;
            resolver.check_extend(child, parent)?;
            let child_key = resolver.read_key(child)?;
            let parent_key = resolver.read_key(parent)?;
            extend_changes(
                registry.crypto().as_ref(),
                (child, &child_key.id, &child_key.secret),
                (parent, &parent_key.id, &parent_key.secret),
                mapping,
            )?
        };

        self.append_each(&mut manager, parent, changes.parent)?;
        self.append_each(&mut manager, child, changes.child)?;
        manager.sync_local(parent).await;
        manager.sync_local(child).await;
        info!(%child, %parent, mapping = mapping.as_str(), "group extended");
        Ok(())
    }

    /// The current effective role of `agent` in `group`.
    pub async fn role_of(&self, group: &CoId, agent: &AgentId) -> Option<Role> {
        let manager = self.manager.lock().await;
        manager.registry().resolver().role_of(group, agent, None)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reading
    // ─────────────────────────────────────────────────────────────────────────

    /// A snapshot of the materialized content of `id`.
    pub async fn content(&self, id: &CoId) -> Result<Content> {
        let manager = self.manager.lock().await;
        manager
            .registry()
            .content(id)
            .map(|c| c.content().clone())
            .ok_or(NodeError::NotFound(*id))
    }

    pub async fn map_get(&self, id: &CoId, key: &str) -> Result<Option<Value>> {
        let content = self.content(id).await?;
        let map = content
            .as_map()
            .ok_or_else(|| NodeError::InvalidOperation(format!("{} is not a map", id)))?;
        Ok(map.get(key).cloned())
    }

    pub async fn known_state(&self, id: &CoId) -> Option<KnownState> {
        let manager = self.manager.lock().await;
        manager.registry().get(id).map(CoValueCore::known_state)
    }

    pub async fn is_deleted(&self, id: &CoId) -> Result<bool> {
        self.with_core(id, CoValueCore::is_deleted).await
    }

    /// Whether a transaction of `id` is currently valid. `None` for
    /// transactions the node does not have.
    pub async fn is_valid(&self, id: &CoId, tx: &TransactionId) -> Result<Option<bool>> {
        self.with_core(id, |core| core.is_valid(tx)).await
    }

    pub async fn session_ids(&self, id: &CoId) -> Result<Vec<SessionId>> {
        self.with_core(id, |core| core.sessions().keys().cloned().collect())
            .await
    }

    /// How many times the content of `id` was rebuilt from scratch.
    pub async fn rebuilds(&self, id: &CoId) -> Option<u64> {
        let manager = self.manager.lock().await;
        manager.registry().content(id).map(|c| c.rebuilds())
    }

    async fn with_core<T>(&self, id: &CoId, f: impl FnOnce(&CoValueCore) -> T) -> Result<T> {
        let manager = self.manager.lock().await;
        manager
            .registry()
            .get(id)
            .map(f)
            .ok_or(NodeError::NotFound(*id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Deletion
    // ─────────────────────────────────────────────────────────────────────────

    /// Write a tombstone for `id`. Only admins of the owning group may.
    pub async fn delete_covalue(&self, id: &CoId) -> Result<()> {
        let mut manager = self.manager.lock().await;
        let registry = manager.registry_mut();
        let core = registry.get(id).ok_or(NodeError::NotFound(*id))?;
        if core.is_deleted() {
            return Ok(());
        }
        let admin_of = match core.header().is_group() {
            true => Some(*id),
            false => core.header().owner_group(),
        };
        if let Some(group) = admin_of {
            registry
                .resolver()
                .require_role(&group, "delete", Role::is_admin)?;
        }

        let core = registry.core_mut(id).ok_or(NodeError::NotFound(*id))?;
        core.mark_deleted(&self.agent, now_millis())?;
        registry.refresh(id);
        manager.delete_covalue(id).await;
        info!(co = %id, "CoValue deleted");
        Ok(())
    }

    /// Erase deleted CoValues down to their tombstones.
    pub async fn erase_all_deleted_covalues(&self) -> Result<usize> {
        let mut manager = self.manager.lock().await;
        Ok(manager.erase_all_deleted_covalues().await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Start syncing over `connection`. A peer with the same id is replaced.
    pub async fn connect(&self, peer: impl Into<PeerId>, role: PeerRole, connection: Connection) {
        let Peer {
            id,
            role,
            outgoing,
            mut incoming,
        } = connect_peer(peer.into(), role, connection, &self.config.transport);

        let mut pumps = self.pumps.lock().await;
        if let Some(previous) = pumps.remove(&id) {
            previous.abort();
        }
        self.manager
            .lock()
            .await
            .add_peer(id.clone(), role, outgoing);

        let manager = self.manager.clone();
        let peer = id.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = incoming.recv().await {
                let disconnected = event == PeerEvent::Disconnected;
                manager.lock().await.handle_event(&peer, event).await;
                if disconnected {
                    break;
                }
            }
        });
        pumps.insert(id, pump);
    }

    /// Stop syncing with a peer. Returns whether it was connected.
    pub async fn disconnect(&self, peer: &PeerId) -> bool {
        if let Some(pump) = self.pumps.lock().await.remove(peer) {
            pump.abort();
        }
        self.manager.lock().await.remove_peer(peer)
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        self.manager.lock().await.peer_ids()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loading and waiting
    // ─────────────────────────────────────────────────────────────────────────

    /// Make `id` available: from memory, storage, or server peers.
    ///
    /// Fails with [`NodeError::NotFound`] once every server peer answered
    /// that it lacks the CoValue, or right away without server peers.
    pub async fn load(&self, id: &CoId, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut first = true;
        loop {
            let notified = self.changes.notified();
            {
                let mut manager = self.manager.lock().await;
                let available = match first {
                    true => manager.load(id).await,
                    false => manager.registry().contains(id),
                };
                if available {
                    return Ok(());
                }
                if manager.is_unavailable(id) {
                    return Err(NodeError::NotFound(*id));
                }
            }
            first = false;
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(NodeError::Timeout(*id));
            }
        }
    }

    /// Wait until every connected server peer confirmed all of `id`.
    pub async fn wait_for_sync(&self, id: &CoId, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changes.notified();
            {
                let manager = self.manager.lock().await;
                if !manager.registry().contains(id) {
                    return Err(NodeError::NotFound(*id));
                }
                if manager.is_synced(id) {
                    return Ok(());
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(NodeError::Timeout(*id));
            }
        }
    }

    /// Pick up CoValues a previous run left unsynced, a batch at a time.
    /// Returns how many were resumed.
    pub async fn resume_unsynced(&self) -> Result<usize> {
        let ids = {
            let mut manager = self.manager.lock().await;
            manager.retry_persistence().await;
            manager.unsynced_covalue_ids().await?
        };
        let batch = self.config.sync.resume_batch_size.max(1);
        for chunk in ids.chunks(batch) {
            let mut manager = self.manager.lock().await;
            for id in chunk {
                manager.resume(id).await;
            }
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "resumed unsynced CoValues");
        }
        Ok(ids.len())
    }
}

impl Drop for LocalNode {
    fn drop(&mut self) {
        for (_, pump) in self.pumps.get_mut().drain() {
            pump.abort();
        }
        if let Some(retry) = self.persist_retry.take() {
            retry.abort();
        }
    }
}

/// Retry refused storage writes every `interval` until the node is gone.
/// Needs a running tokio runtime; without one, retries only happen on the
/// next change.
fn spawn_persist_retry(
    manager: Weak<Mutex<SyncManager>>,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else {
                break;
            };
            let remaining = manager.lock().await.retry_persistence().await;
            if remaining > 0 {
                debug!(remaining, "storage still refusing writes");
            }
        }
    }))
}

fn insert_header(manager: &mut SyncManager, header: CoValueHeader) -> Result<CoId> {
    let registry = manager.registry_mut();
    let core = CoValueCore::new(header, registry.crypto())?;
    let id = core.id();
    if !registry.contains(&id) {
        registry.insert(core);
    }
    Ok(id)
}

fn uniqueness(manager: &SyncManager) -> Value {
    Value::String(hex::encode(manager.registry().crypto().random_bytes(12)))
}

/// Get current time in milliseconds.
fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use covault_core::{Ruleset, Transaction};
    use covault_perms::PermsError;

    fn node(seed: u8) -> LocalNode {
        LocalNode::new(AgentSecret::from_seed(&[seed; 32]), NodeConfig::default())
    }

    #[test]
    fn test_config_reads_partial_json() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"transport": {"batching_by_default": false}}"#).unwrap();
        assert!(!config.transport.batching_by_default);
        assert_eq!(config.sync, SyncConfig::default());
        assert_eq!(config.transport.buffer_limit, 100_000);
    }

    #[tokio::test]
    async fn test_owned_map_is_written_privately() {
        let node = node(1);
        let group = node.create_group().await.unwrap();
        let map = node.create_covalue(CoValueKind::Map, &group).await.unwrap();

        let tx = node.map_set(&map, "title", "hello").await.unwrap();
        assert_eq!(node.map_get(&map, "title").await.unwrap(), Some(json!("hello")));

        let manager = node.manager().lock().await;
        let stored = manager.registry().get(&map).unwrap().transaction(&tx).unwrap();
        assert!(matches!(stored, Transaction::Private { .. }));
    }

    #[tokio::test]
    async fn test_trusting_option_writes_in_the_clear() {
        let node = node(1);
        let group = node.create_group().await.unwrap();
        let map = node.create_covalue(CoValueKind::Map, &group).await.unwrap();

        let tx = node
            .map_set_with(&map, "k", 1, TxOptions::trusting())
            .await
            .unwrap();
        let manager = node.manager().lock().await;
        let stored = manager.registry().get(&map).unwrap().transaction(&tx).unwrap();
        assert!(!stored.is_private());
    }

    #[tokio::test]
    async fn test_list_and_text_edits() {
        let node = node(1);
        let group = node.create_group().await.unwrap();

        let list = node.create_covalue(CoValueKind::List, &group).await.unwrap();
        node.list_push(&list, "b").await.unwrap();
        node.list_insert_after(&list, None, "a").await.unwrap();
        node.list_push(&list, "c").await.unwrap();
        node.list_delete(&list, 1).await.unwrap();
        let content = node.content(&list).await.unwrap();
        assert_eq!(content.as_list().unwrap().to_vec(), vec![json!("a"), json!("c")]);

        let text = node.create_covalue(CoValueKind::PlainText, &group).await.unwrap();
        node.text_append(&text, "helo").await.unwrap();
        node.text_insert(&text, Some(2), "l").await.unwrap();
        let content = node.content(&text).await.unwrap();
        assert_eq!(content.to_json(), json!("hello"));

        let err = node.list_delete(&list, 10).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidOperation(_)));
        let err = node.text_append(&list, "x").await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_stream_push_per_session() {
        let node = node(1);
        let group = node.create_group().await.unwrap();
        let stream = node.create_covalue(CoValueKind::Stream, &group).await.unwrap();
        node.stream_push(&stream, 1).await.unwrap();
        node.stream_push(&stream, 2).await.unwrap();

        let content = node.content(&stream).await.unwrap();
        let items = content.as_stream().unwrap().items(node.session());
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].value, json!(2));
    }

    #[tokio::test]
    async fn test_unowned_covalue_accepts_any_writer() {
        let node = node(1);
        let header = CoValueHeader {
            kind: CoValueKind::Map,
            ruleset: Ruleset::UnsafeAllowAll,
            meta: None,
            uniqueness: json!("shared"),
            created_at: Some(0),
        };
        let id = node.create(header.clone()).await.unwrap();
        assert_eq!(node.create(header).await.unwrap(), id);
        node.map_set(&id, "k", "v").await.unwrap();
        assert_eq!(node.map_get(&id, "k").await.unwrap(), Some(json!("v")));
    }

    #[tokio::test]
    async fn test_covalue_needs_known_group() {
        let node = node(1);
        let missing = CoId::from_bytes([9; 32]);
        let err = node.create_covalue(CoValueKind::Map, &missing).await.unwrap_err();
        assert!(matches!(err, NodeError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_deleted_covalue_refuses_writes() {
        let node = node(1);
        let group = node.create_group().await.unwrap();
        let map = node.create_covalue(CoValueKind::Map, &group).await.unwrap();
        node.map_set(&map, "k", "v").await.unwrap();

        node.delete_covalue(&map).await.unwrap();
        assert!(node.is_deleted(&map).await.unwrap());
        let err = node.map_set(&map, "k", "w").await.unwrap_err();
        assert!(matches!(err, NodeError::Deleted(_)));

        assert_eq!(node.erase_all_deleted_covalues().await.unwrap(), 1);
        let sessions = node.session_ids(&map).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].is_delete());
    }

    #[tokio::test]
    async fn test_non_admin_cannot_add_members() {
        let node = node(1);
        let group = node.create_group().await.unwrap();
        let other = AgentSecret::from_seed(&[2; 32]).id();

        node.add_member(&group, Member::Agent(other), Role::Reader)
            .await
            .unwrap();
        assert_eq!(node.role_of(&group, &other).await, Some(Role::Reader));

        node.remove_member(&group, &other).await.unwrap();
        assert_eq!(node.role_of(&group, &other).await, None);

        // A foreign group this node has no role in.
        let stranger = LocalNode::new(AgentSecret::from_seed(&[3; 32]), NodeConfig::default());
        let foreign = stranger.create_group().await.unwrap();
        let err = node
            .add_member(&foreign, Member::Everyone, Role::Reader)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NodeError::Perms(PermsError::MissingGroup(_))
        ));
    }

    #[tokio::test]
    async fn test_rotation_keeps_content_readable() {
        let node = node(1);
        let group = node.create_group().await.unwrap();
        let map = node.create_covalue(CoValueKind::Map, &group).await.unwrap();
        node.map_set(&map, "before", 1).await.unwrap();

        let other = AgentSecret::from_seed(&[2; 32]).id();
        node.add_member(&group, Member::Agent(other), Role::Writer)
            .await
            .unwrap();
        node.remove_member(&group, &other).await.unwrap();
        node.map_set(&map, "after", 2).await.unwrap();

        assert_eq!(node.map_get(&map, "before").await.unwrap(), Some(json!(1)));
        assert_eq!(node.map_get(&map, "after").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_extend_group_inherits_members() {
        let node = node(1);
        let parent = node.create_group().await.unwrap();
        let child = node.create_group().await.unwrap();
        let other = AgentSecret::from_seed(&[2; 32]).id();
        node.add_member(&parent, Member::Agent(other), Role::Writer)
            .await
            .unwrap();

        node.extend_group(&child, &parent, ParentRole::Extend)
            .await
            .unwrap();
        assert_eq!(node.role_of(&child, &other).await, Some(Role::Writer));

        let err = node
            .extend_group(&parent, &child, ParentRole::Extend)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Perms(_)));
    }

    #[tokio::test]
    async fn test_load_without_peers_is_not_found() {
        let node = node(1);
        let missing = CoId::from_bytes([9; 32]);
        let err = node
            .load(&missing, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::NotFound(_)));
    }
}
