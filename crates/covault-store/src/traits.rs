//! StorageAdapter trait: the abstract interface for CoValue persistence.
//!
//! Storage does not verify anything. It keeps what the node hands it,
//! session by session, and streams it back in the same shape the sync
//! protocol uses. The node treats storage as one more peer with its own
//! known state.

use async_trait::async_trait;
use covault_core::{ChunkLimits, CoId, KnownState, NewContent};
use tokio::sync::mpsc;

use crate::error::Result;

/// What happened to a [`StorageAdapter::store`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Everything new was written. Carries the updated known state.
    Stored(KnownState),
    /// Some session started past what storage has, or the header is
    /// missing for an unknown CoValue. Carries what storage actually has
    /// so the caller can resend from there. Sessions without a gap were
    /// still written.
    Correction(KnownState),
}

impl StoreOutcome {
    pub fn known_state(&self) -> &KnownState {
        match self {
            StoreOutcome::Stored(known) | StoreOutcome::Correction(known) => known,
        }
    }

    pub fn needs_correction(&self) -> bool {
        matches!(self, StoreOutcome::Correction(_))
    }
}

/// The StorageAdapter trait: async interface for CoValue persistence.
///
/// For SQLite, calls run in `spawn_blocking` so the runtime is never blocked.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Content
    // ─────────────────────────────────────────────────────────────────────────

    /// Append new content. Transactions storage already has are skipped.
    async fn store(&self, content: &NewContent) -> Result<StoreOutcome>;

    /// Stream a CoValue into `sink`, cut into messages that respect
    /// `limits`. Returns whether the CoValue was found.
    async fn load(
        &self,
        id: &CoId,
        limits: ChunkLimits,
        sink: mpsc::Sender<NewContent>,
    ) -> Result<bool>;

    /// What storage has for `id`; empty if nothing.
    async fn known_state(&self, id: &CoId) -> Result<KnownState>;

    // ─────────────────────────────────────────────────────────────────────────
    // Sync tracking
    // ─────────────────────────────────────────────────────────────────────────

    /// Record that `peer` has not confirmed everything of `id` yet.
    async fn mark_unsynced(&self, id: &CoId, peer: &str) -> Result<()>;

    /// Record that `peer` confirmed everything of `id`.
    async fn mark_synced(&self, id: &CoId, peer: &str) -> Result<()>;

    /// CoValues with at least one unsynced peer, to resume after a restart.
    async fn unsynced_covalue_ids(&self) -> Result<Vec<CoId>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Deletion
    // ─────────────────────────────────────────────────────────────────────────

    /// Queue a deleted CoValue for erasure. Idempotent.
    async fn enqueue_deleted(&self, id: &CoId) -> Result<()>;

    /// CoValues queued for erasure and not yet erased.
    async fn all_deleted_pending(&self) -> Result<Vec<CoId>>;

    /// Erase everything but the tombstone (header and deletion sessions) of
    /// every queued CoValue. Returns how many were erased.
    async fn erase_all_deleted_covalues(&self) -> Result<usize>;
}
