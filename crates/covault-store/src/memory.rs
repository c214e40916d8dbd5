//! In-memory implementation of the StorageAdapter trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use covault_core::{
    split_at_checkpoints, ChunkLimits, CoId, CoValueHeader, ContentChunker, Ed25519Signature,
    KnownState, NewContent, SessionId, Transaction,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::model::{plan_append, SessionAppend};
use crate::traits::{StorageAdapter, StoreOutcome};

/// In-memory storage.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStorage {
    inner: RwLock<MemoryStorageInner>,
}

#[derive(Default)]
struct MemoryStorageInner {
    covalues: HashMap<CoId, StoredCoValue>,

    /// CoValue -> peers that have not confirmed it.
    unsynced: BTreeMap<CoId, BTreeSet<String>>,

    /// Deletion queue; `true` once erased.
    deleted: BTreeMap<CoId, bool>,
}

struct StoredCoValue {
    header: CoValueHeader,
    sessions: BTreeMap<SessionId, StoredSession>,
}

struct StoredSession {
    transactions: Vec<Transaction>,
    last_signature: Ed25519Signature,
    bytes_since_checkpoint: usize,
    signature_after: BTreeMap<u32, Ed25519Signature>,
}

impl StoredCoValue {
    fn known_state(&self, id: CoId) -> KnownState {
        KnownState {
            id,
            header: true,
            sessions: self
                .sessions
                .iter()
                .map(|(session, stored)| (session.clone(), stored.transactions.len() as u32))
                .collect(),
        }
    }
}

impl MemoryStorage {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStorageInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStorageInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStorageInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
    }

    fn chunks(&self, id: &CoId, limits: ChunkLimits) -> Result<Option<Vec<NewContent>>> {
        let inner = self.read()?;
        let Some(stored) = inner.covalues.get(id) else {
            return Ok(None);
        };

        let header = stored.header.clone();
        let priority = header.priority();
        let mut chunker = ContentChunker::new(*id, Some(header), priority, limits);
        for (session, s) in &stored.sessions {
            let pieces =
                split_at_checkpoints(&s.transactions, 0, &s.signature_after, &s.last_signature);
            chunker.push_session(session, pieces);
        }
        Ok(Some(chunker.finish()))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn store(&self, content: &NewContent) -> Result<StoreOutcome> {
        let mut inner = self.write()?;

        if !inner.covalues.contains_key(&content.id) {
            let Some(header) = &content.header else {
                return Ok(StoreOutcome::Correction(KnownState::empty(content.id)));
            };
            inner.covalues.insert(
                content.id,
                StoredCoValue {
                    header: header.clone(),
                    sessions: BTreeMap::new(),
                },
            );
        }
        let Some(stored) = inner.covalues.get_mut(&content.id) else {
            return Err(StoreError::InvalidData(format!("{} vanished", content.id)));
        };

        let mut invalid_assumptions = false;
        for (session, piece) in &content.new {
            let (stored_len, bytes_since) = stored
                .sessions
                .get(session)
                .map_or((0, 0), |s| (s.transactions.len() as u32, s.bytes_since_checkpoint));

            match plan_append(stored_len, bytes_since, piece) {
                SessionAppend::Gap => invalid_assumptions = true,
                SessionAppend::UpToDate => {}
                SessionAppend::Append {
                    transactions,
                    new_len,
                    bytes_since_checkpoint,
                    checkpoint,
                    ..
                } => {
                    let entry = stored
                        .sessions
                        .entry(session.clone())
                        .or_insert_with(|| StoredSession {
                            transactions: Vec::new(),
                            last_signature: piece.last_signature,
                            bytes_since_checkpoint: 0,
                            signature_after: BTreeMap::new(),
                        });
                    entry.transactions.extend_from_slice(transactions);
                    entry.last_signature = piece.last_signature;
                    entry.bytes_since_checkpoint = bytes_since_checkpoint;
                    if let Some(index) = checkpoint {
                        entry.signature_after.insert(index, piece.last_signature);
                    }
                    debug!(co = %content.id, session = %session, len = new_len, "stored transactions");
                }
            }
        }

        let known = stored.known_state(content.id);
        Ok(if invalid_assumptions {
            StoreOutcome::Correction(known)
        } else {
            StoreOutcome::Stored(known)
        })
    }

    async fn load(
        &self,
        id: &CoId,
        limits: ChunkLimits,
        sink: mpsc::Sender<NewContent>,
    ) -> Result<bool> {
        let Some(messages) = self.chunks(id, limits)? else {
            return Ok(false);
        };
        for msg in messages {
            if sink.send(msg).await.is_err() {
                debug!(co = %id, "load receiver dropped");
                break;
            }
        }
        Ok(true)
    }

    async fn known_state(&self, id: &CoId) -> Result<KnownState> {
        let inner = self.read()?;
        Ok(inner
            .covalues
            .get(id)
            .map_or_else(|| KnownState::empty(*id), |stored| stored.known_state(*id)))
    }

    async fn mark_unsynced(&self, id: &CoId, peer: &str) -> Result<()> {
        let mut inner = self.write()?;
        inner.unsynced.entry(*id).or_default().insert(peer.to_string());
        Ok(())
    }

    async fn mark_synced(&self, id: &CoId, peer: &str) -> Result<()> {
        let mut inner = self.write()?;
        if let Some(peers) = inner.unsynced.get_mut(id) {
            peers.remove(peer);
            if peers.is_empty() {
                inner.unsynced.remove(id);
            }
        }
        Ok(())
    }

    async fn unsynced_covalue_ids(&self) -> Result<Vec<CoId>> {
        Ok(self.read()?.unsynced.keys().copied().collect())
    }

    async fn enqueue_deleted(&self, id: &CoId) -> Result<()> {
        self.write()?.deleted.entry(*id).or_insert(false);
        Ok(())
    }

    async fn all_deleted_pending(&self) -> Result<Vec<CoId>> {
        Ok(self
            .read()?
            .deleted
            .iter()
            .filter(|(_, done)| !**done)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn erase_all_deleted_covalues(&self) -> Result<usize> {
        let mut inner = self.write()?;
        let pending: Vec<CoId> = inner
            .deleted
            .iter()
            .filter(|(_, done)| !**done)
            .map(|(id, _)| *id)
            .collect();

        for id in &pending {
            if let Some(stored) = inner.covalues.get_mut(id) {
                stored.sessions.retain(|session, _| session.is_delete());
            }
            inner.deleted.insert(*id, true);
            debug!(co = %id, "erased deleted CoValue");
        }
        Ok(pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{content_for, sample_covalue};

    #[tokio::test]
    async fn test_store_and_load() {
        let storage = MemoryStorage::new();
        let (core, _) = sample_covalue(3);
        for msg in content_for(&core, None) {
            assert!(!storage.store(&msg).await.unwrap().needs_correction());
        }
        assert_eq!(storage.known_state(&core.id()).await.unwrap(), core.known_state());

        let (tx, mut rx) = mpsc::channel(16);
        assert!(storage.load(&core.id(), ChunkLimits::default(), tx).await.unwrap());
        let loaded = rx.recv().await.unwrap();
        assert!(loaded.header.is_some());
        assert_eq!(loaded.transaction_count(), 3);
    }

    #[tokio::test]
    async fn test_missing_covalue() {
        let storage = MemoryStorage::new();
        let id = CoId::from_bytes([9; 32]);
        let (tx, _rx) = mpsc::channel(1);
        assert!(!storage.load(&id, ChunkLimits::default(), tx).await.unwrap());
        assert!(storage.known_state(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gap_requests_correction() {
        let storage = MemoryStorage::new();
        let (core, _) = sample_covalue(4);
        let mut msgs = content_for(&core, None);
        let mut msg = msgs.remove(0);

        // Without the header an unknown CoValue cannot be stored.
        let mut headless = msg.clone();
        headless.header = None;
        let outcome = storage.store(&headless).await.unwrap();
        assert_eq!(outcome, StoreOutcome::Correction(KnownState::empty(core.id())));

        for piece in msg.new.values_mut() {
            piece.after = 2;
            piece.new_transactions.drain(..2);
        }
        let outcome = storage.store(&msg).await.unwrap();
        assert!(outcome.needs_correction());
        assert!(outcome.known_state().header);
        assert!(outcome.known_state().sessions.is_empty());
    }

    #[tokio::test]
    async fn test_unsynced_tracking() {
        let storage = MemoryStorage::new();
        let id = CoId::from_bytes([1; 32]);
        storage.mark_unsynced(&id, "server").await.unwrap();
        storage.mark_unsynced(&id, "laptop").await.unwrap();
        storage.mark_synced(&id, "server").await.unwrap();
        assert_eq!(storage.unsynced_covalue_ids().await.unwrap(), vec![id]);
        storage.mark_synced(&id, "laptop").await.unwrap();
        assert!(storage.unsynced_covalue_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_erase_keeps_tombstone() {
        let storage = MemoryStorage::new();
        let (mut core, agent) = sample_covalue(2);
        core.mark_deleted(&agent, 100).unwrap();
        for msg in content_for(&core, None) {
            storage.store(&msg).await.unwrap();
        }

        storage.enqueue_deleted(&core.id()).await.unwrap();
        storage.enqueue_deleted(&core.id()).await.unwrap();
        assert_eq!(storage.all_deleted_pending().await.unwrap(), vec![core.id()]);
        assert_eq!(storage.erase_all_deleted_covalues().await.unwrap(), 1);
        assert!(storage.all_deleted_pending().await.unwrap().is_empty());

        let known = storage.known_state(&core.id()).await.unwrap();
        assert!(known.header);
        assert_eq!(known.sessions.len(), 1);
        assert!(known.sessions.keys().all(SessionId::is_delete));
    }
}
