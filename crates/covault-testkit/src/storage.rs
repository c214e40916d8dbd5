//! Storage that can be switched off, for exercising outages.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use covault_core::{ChunkLimits, CoId, KnownState, NewContent};
use covault_store::{MemoryStorage, Result, StorageAdapter, StoreError, StoreOutcome};
use tokio::sync::mpsc;

/// A [`MemoryStorage`] whose writes fail while it is down. Reads keep
/// working, as with a full disk.
#[derive(Default)]
pub struct FlakyStorage {
    inner: MemoryStorage,
    down: AtomicBool,
    refused: AtomicUsize,
}

impl FlakyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Writes refused so far.
    pub fn refused(&self) -> usize {
        self.refused.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            self.refused.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("storage is down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for FlakyStorage {
    async fn store(&self, content: &NewContent) -> Result<StoreOutcome> {
        self.check()?;
        self.inner.store(content).await
    }

    async fn load(
        &self,
        id: &CoId,
        limits: ChunkLimits,
        sink: mpsc::Sender<NewContent>,
    ) -> Result<bool> {
        self.inner.load(id, limits, sink).await
    }

    async fn known_state(&self, id: &CoId) -> Result<KnownState> {
        self.inner.known_state(id).await
    }

    async fn mark_unsynced(&self, id: &CoId, peer: &str) -> Result<()> {
        self.check()?;
        self.inner.mark_unsynced(id, peer).await
    }

    async fn mark_synced(&self, id: &CoId, peer: &str) -> Result<()> {
        self.check()?;
        self.inner.mark_synced(id, peer).await
    }

    async fn unsynced_covalue_ids(&self) -> Result<Vec<CoId>> {
        self.inner.unsynced_covalue_ids().await
    }

    async fn enqueue_deleted(&self, id: &CoId) -> Result<()> {
        self.check()?;
        self.inner.enqueue_deleted(id).await
    }

    async fn all_deleted_pending(&self) -> Result<Vec<CoId>> {
        self.inner.all_deleted_pending().await
    }

    async fn erase_all_deleted_covalues(&self) -> Result<usize> {
        self.check()?;
        self.inner.erase_all_deleted_covalues().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{multi_party, open_covalue};
    use covault_core::{CoMap, CoValueKind};

    #[tokio::test]
    async fn test_refuses_writes_while_down() {
        let agents = multi_party(1);
        let mut core = open_covalue(CoValueKind::Map, "flaky");
        agents[0].append(&mut core, &[CoMap::set_change("k", 1)], None, 1);
        let content = core.new_content_since(None, ChunkLimits::UNLIMITED).remove(0);

        let storage = FlakyStorage::new();
        storage.set_down(true);
        assert!(storage.store(&content).await.is_err());
        assert_eq!(storage.refused(), 1);
        assert!(!storage.known_state(&core.id()).await.unwrap().header);

        storage.set_down(false);
        let outcome = storage.store(&content).await.unwrap();
        assert_eq!(outcome.known_state(), &core.known_state());
    }
}
