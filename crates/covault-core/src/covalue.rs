//! The per-CoValue transaction log.
//!
//! A [`CoValueCore`] holds a header and one [`SessionLog`] per writer
//! session. Ingest only checks structure and signatures; which transactions
//! count is decided separately by [`CoValueCore::refresh_validity`], in two
//! phases: permission validity from a [`WriteGate`], then first-writer-wins
//! resolution over the permitted set.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::canonical::transaction_nonce_material;
use crate::crypto::{AgentSecret, CryptoProvider, Ed25519Signature};
use crate::error::{CoreError, RejectionReason, Result};
use crate::gate::{KeySource, TxRef, WriteGate};
use crate::header::{CoValueHeader, Ruleset};
use crate::ids::{AgentId, CoId, SessionId, TransactionId};
use crate::known_state::KnownState;
use crate::new_content::{split_at_checkpoints, ChunkLimits, ContentChunker, NewContent};
use crate::pack::{pack_changes, unpack_changes};
use crate::session::SessionLog;
use crate::transaction::{Privacy, Transaction};

/// Deterministic position of a transaction across all sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderKey {
    pub made_at: i64,
    pub id: TransactionId,
}

/// Why a stored transaction does not contribute to content.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidReason {
    #[error("{0}")]
    Permission(String),

    #[error("not the first writer for fww key {0}")]
    NotFirstWriter(String),

    #[error("{0}")]
    Deletion(&'static str),

    #[error("session does not name an agent")]
    InvalidSession,
}

/// What the last validity refresh did to the valid set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidityChange {
    Unchanged,
    /// Only additions; content can be patched incrementally.
    Extended,
    /// Something previously valid is no longer valid; content must be rebuilt.
    Flipped,
}

/// A valid transaction with its changes in plaintext.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTransaction {
    pub id: TransactionId,
    pub made_at: i64,
    pub changes: Vec<Value>,
    pub meta: Option<Value>,
}

impl DecodedTransaction {
    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            made_at: self.made_at,
            id: self.id.clone(),
        }
    }
}

/// A CoValue's header, session logs and derived validity.
pub struct CoValueCore {
    id: CoId,
    header: CoValueHeader,
    crypto: Arc<dyn CryptoProvider>,
    sessions: BTreeMap<SessionId, SessionLog>,
    valid: BTreeSet<OrderKey>,
    fww_losers: BTreeSet<OrderKey>,
    invalid: BTreeMap<TransactionId, InvalidReason>,
    deleted: bool,
    /// Bumped on every flip so materialized content knows to rebuild.
    epoch: u64,
}

impl std::fmt::Debug for CoValueCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoValueCore")
            .field("id", &self.id)
            .field("sessions", &self.sessions.len())
            .field("valid", &self.valid.len())
            .field("deleted", &self.deleted)
            .finish()
    }
}

impl CoValueCore {
    /// Create a CoValue from a fresh header.
    pub fn new(header: CoValueHeader, crypto: Arc<dyn CryptoProvider>) -> Result<Self> {
        let id = header.id(crypto.as_ref())?;
        Ok(Self::with_id(id, header, crypto))
    }

    /// Accept a header received for `id`, checking that it hashes to `id`.
    pub fn from_id_and_header(
        id: CoId,
        header: CoValueHeader,
        crypto: Arc<dyn CryptoProvider>,
    ) -> std::result::Result<Self, RejectionReason> {
        match header.id(crypto.as_ref()) {
            Ok(actual) if actual == id => Ok(Self::with_id(id, header, crypto)),
            _ => Err(RejectionReason::HeaderMismatch(id)),
        }
    }

    fn with_id(id: CoId, header: CoValueHeader, crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            id,
            header,
            crypto,
            sessions: BTreeMap::new(),
            valid: BTreeSet::new(),
            fww_losers: BTreeSet::new(),
            invalid: BTreeMap::new(),
            deleted: false,
            epoch: 0,
        }
    }

    pub fn id(&self) -> CoId {
        self.id
    }

    pub fn header(&self) -> &CoValueHeader {
        &self.header
    }

    pub fn crypto(&self) -> &dyn CryptoProvider {
        self.crypto.as_ref()
    }

    pub fn sessions(&self) -> &BTreeMap<SessionId, SessionLog> {
        &self.sessions
    }

    pub fn session(&self, session: &SessionId) -> Option<&SessionLog> {
        self.sessions.get(session)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The group whose keys and roles govern this CoValue.
    pub fn key_owner(&self) -> Option<CoId> {
        match &self.header.ruleset {
            Ruleset::Group { .. } => Some(self.id),
            Ruleset::OwnedByGroup { group } => Some(*group),
            Ruleset::UnsafeAllowAll => None,
        }
    }

    pub fn transaction(&self, id: &TransactionId) -> Option<&Transaction> {
        self.sessions
            .get(&id.session)?
            .transactions()
            .get(id.index as usize)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Writing
    // ─────────────────────────────────────────────────────────────────────

    /// Append a transaction authored by `agent` to one of its sessions.
    ///
    /// The new transaction takes part in validity only after the next
    /// [`refresh_validity`](Self::refresh_validity).
    pub fn append_transaction(
        &mut self,
        agent: &AgentSecret,
        session: &SessionId,
        changes: &[Value],
        privacy: Privacy<'_>,
        meta: Option<&Value>,
        made_at: i64,
    ) -> Result<TransactionId> {
        let owner = session.agent()?;
        if owner != agent.id() {
            return Err(CoreError::NotOwner {
                session: session.clone(),
                agent: agent.id(),
            });
        }
        if self.deleted && !session.is_delete() {
            return Err(CoreError::Deleted(self.id));
        }

        let index = self.sessions.get(session).map_or(0, SessionLog::len);
        let tx_id = TransactionId::new(session.clone(), index);

        let changes = pack_changes(self.header.kind, changes);
        let tx = match privacy {
            Privacy::Trusting => Transaction::trusting(&changes, meta, made_at)?,
            Privacy::Private { key_id, key } => {
                let nonce = transaction_nonce_material(&self.id, &tx_id)?;
                Transaction::private(
                    &changes,
                    meta,
                    made_at,
                    key_id,
                    key,
                    &nonce,
                    self.crypto.as_ref(),
                )?
            }
        };

        let log = self
            .sessions
            .entry(session.clone())
            .or_insert_with(|| SessionLog::new(&self.id, session.clone()));
        log.append_signed(tx, &agent.signer, self.crypto.as_ref())?;
        debug!(co = %self.id, tx = %tx_id, "appended transaction");
        Ok(tx_id)
    }

    /// Write a tombstone in a fresh deletion session.
    ///
    /// Whether the deletion takes effect is up to the write gate (only
    /// admins may delete).
    pub fn mark_deleted(&mut self, agent: &AgentSecret, made_at: i64) -> Result<TransactionId> {
        let random = self.crypto.random_bytes(8);
        let session = SessionId::new_delete(&agent.id(), &random);
        let meta = serde_json::json!({ "deleted": true });
        self.append_transaction(agent, &session, &[], Privacy::Trusting, Some(&meta), made_at)
    }

    /// Verify and append transactions received from a peer or storage.
    ///
    /// `after` is the index of the first transaction in `txs`. Transactions
    /// already present are skipped; a gap leaves the log untouched. Returns
    /// the number of transactions actually added.
    pub fn ingest(
        &mut self,
        session: &SessionId,
        after: u32,
        txs: Vec<Transaction>,
        signature: &Ed25519Signature,
    ) -> std::result::Result<usize, RejectionReason> {
        if self.deleted && !session.is_delete() {
            return Err(RejectionReason::Deleted);
        }

        let author = session
            .agent()
            .map_err(|_| RejectionReason::InvalidSession(session.to_string()))?;

        let current = self.sessions.get(session).map_or(0, SessionLog::len);
        if after > current {
            return Err(RejectionReason::GapInLog {
                expected: current,
                got: after,
            });
        }

        let overlap = (current - after) as usize;
        if overlap >= txs.len() {
            return Ok(0);
        }
        let fresh: Vec<Transaction> = txs.into_iter().skip(overlap).collect();
        let added = fresh.len();

        let log = self
            .sessions
            .entry(session.clone())
            .or_insert_with(|| SessionLog::new(&self.id, session.clone()));
        let result = log.try_add(fresh, signature, &author.signer, self.crypto.as_ref());

        if log.is_empty() {
            self.sessions.remove(session);
        }
        result.map(|()| added)
    }

    /// Restore checkpoint signatures that storage kept for a session.
    pub fn record_checkpoints(
        &mut self,
        session: &SessionId,
        checkpoints: impl IntoIterator<Item = (u32, Ed25519Signature)>,
    ) {
        if let Some(log) = self.sessions.get_mut(session) {
            for (index, signature) in checkpoints {
                log.record_checkpoint(index, signature);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Validity
    // ─────────────────────────────────────────────────────────────────────

    /// Recompute which transactions are valid.
    pub fn refresh_validity(&mut self, gate: &dyn WriteGate) -> ValidityChange {
        let mut invalid = BTreeMap::new();
        let mut candidates: Vec<(OrderKey, AgentId, &Transaction)> = Vec::new();

        for (session, log) in &self.sessions {
            let Ok(author) = session.agent() else {
                for index in 0..log.len() {
                    invalid.insert(
                        TransactionId::new(session.clone(), index),
                        InvalidReason::InvalidSession,
                    );
                }
                continue;
            };
            for (index, tx) in log.transactions().iter().enumerate() {
                let key = OrderKey {
                    made_at: tx.made_at(),
                    id: TransactionId::new(session.clone(), index as u32),
                };
                candidates.push((key, author, tx));
            }
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let refs: Vec<TxRef<'_>> = candidates
            .iter()
            .map(|(key, author, tx)| TxRef {
                id: &key.id,
                author,
                tx,
            })
            .collect();
        let mut verdicts = gate.validate(&self.id, &self.header, &refs);
        if verdicts.len() != candidates.len() {
            error!(
                co = %self.id,
                expected = candidates.len(),
                got = verdicts.len(),
                "write gate returned the wrong number of verdicts"
            );
            verdicts.resize(candidates.len(), Err("no verdict from write gate".into()));
        }

        let mut valid = BTreeSet::new();
        let mut fww_losers = BTreeSet::new();
        let mut fww_winners = HashSet::new();
        let mut deleted = false;

        for ((key, _, tx), verdict) in candidates.into_iter().zip(verdicts) {
            if let Err(reason) = verdict {
                invalid.insert(key.id, InvalidReason::Permission(reason));
                continue;
            }

            let deletion = tx.is_deletion();
            if deletion != key.id.session.is_delete() {
                let reason = if deletion {
                    "deletion outside a deletion session"
                } else {
                    "regular transaction in a deletion session"
                };
                invalid.insert(key.id, InvalidReason::Deletion(reason));
                continue;
            }

            if let Some(fww) = tx.fww_key() {
                if !fww_winners.insert(fww.clone()) {
                    invalid.insert(key.id.clone(), InvalidReason::NotFirstWriter(fww));
                    fww_losers.insert(key);
                    continue;
                }
            }

            deleted |= deletion;
            valid.insert(key);
        }

        let change = if valid == self.valid {
            ValidityChange::Unchanged
        } else if self.valid.is_subset(&valid) {
            ValidityChange::Extended
        } else {
            ValidityChange::Flipped
        };

        if change == ValidityChange::Flipped {
            self.epoch += 1;
            debug!(co = %self.id, epoch = self.epoch, "validity flipped");
        }
        if deleted && !self.deleted {
            debug!(co = %self.id, "CoValue deleted");
        }

        self.valid = valid;
        self.fww_losers = fww_losers;
        self.invalid = invalid;
        self.deleted |= deleted;
        change
    }

    /// Whether a transaction is currently valid. `None` for unknown ids.
    pub fn is_valid(&self, id: &TransactionId) -> Option<bool> {
        let tx = self.transaction(id)?;
        Some(self.valid.contains(&OrderKey {
            made_at: tx.made_at(),
            id: id.clone(),
        }))
    }

    pub fn invalid_reason(&self, id: &TransactionId) -> Option<&InvalidReason> {
        self.invalid.get(id)
    }

    pub fn invalid_transactions(&self) -> &BTreeMap<TransactionId, InvalidReason> {
        &self.invalid
    }

    /// Valid transactions in `(madeAt, session, index)` order.
    ///
    /// With `include_invalid_meta`, first-writer-wins losers are included
    /// as well; permission-invalid transactions never are.
    pub fn valid_sorted_transactions(
        &self,
        include_invalid_meta: bool,
    ) -> Vec<(&OrderKey, &Transaction)> {
        let keys: Box<dyn Iterator<Item = &OrderKey>> = if include_invalid_meta {
            let mut all: Vec<&OrderKey> = self.valid.iter().chain(&self.fww_losers).collect();
            all.sort();
            Box::new(all.into_iter())
        } else {
            Box::new(self.valid.iter())
        };

        keys.filter_map(|key| self.transaction(&key.id).map(|tx| (key, tx)))
            .collect()
    }

    /// Plaintext changes of `tx`, decrypting private ones with `keys`.
    pub fn decrypted_changes(
        &self,
        id: &TransactionId,
        tx: &Transaction,
        keys: &dyn KeySource,
    ) -> Option<Vec<Value>> {
        let packed = match tx {
            Transaction::Trusting { .. } => tx.trusting_changes(),
            Transaction::Private { key_used, .. } => {
                let owner = self.key_owner()?;
                let key = keys.key_secret(&owner, key_used)?;
                let nonce = transaction_nonce_material(&self.id, id).ok()?;
                match tx.decrypt_changes(&key, &nonce, self.crypto.as_ref()) {
                    Ok(changes) => Some(changes),
                    Err(e) => {
                        warn!(co = %self.id, tx = %id, error = %e, "failed to decrypt transaction");
                        None
                    }
                }
            }
        }?;
        Some(unpack_changes(self.header.kind, &packed))
    }

    /// Valid transactions with plaintext changes. Transactions whose key is
    /// not available are left out.
    pub fn decoded_valid_transactions(&self, keys: &dyn KeySource) -> Vec<DecodedTransaction> {
        self.valid_sorted_transactions(false)
            .into_iter()
            .filter_map(|(key, tx)| self.decode(key, tx, keys))
            .collect()
    }

    pub fn decode(
        &self,
        key: &OrderKey,
        tx: &Transaction,
        keys: &dyn KeySource,
    ) -> Option<DecodedTransaction> {
        let changes = self.decrypted_changes(&key.id, tx, keys)?;
        Some(DecodedTransaction {
            id: key.id.clone(),
            made_at: key.made_at,
            changes,
            meta: tx.meta(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sync views
    // ─────────────────────────────────────────────────────────────────────

    fn visible_sessions(&self) -> impl Iterator<Item = (&SessionId, &SessionLog)> {
        let deleted = self.deleted;
        self.sessions
            .iter()
            .filter(move |(session, _)| !deleted || session.is_delete())
    }

    /// What this node has. A deleted CoValue reports only its deletion sessions.
    pub fn known_state(&self) -> KnownState {
        KnownState {
            id: self.id,
            header: true,
            sessions: self
                .visible_sessions()
                .map(|(session, log)| (session.clone(), log.len()))
                .collect(),
        }
    }

    /// Everything `known` lacks, cut into messages that respect `limits`.
    ///
    /// `None` means the peer knows nothing. Returns an empty vector when the
    /// peer is up to date.
    pub fn new_content_since(
        &self,
        known: Option<&KnownState>,
        limits: ChunkLimits,
    ) -> Vec<NewContent> {
        let include_header = known.map_or(true, |k| !k.header);
        let header = include_header.then(|| self.header.clone());
        let mut chunker = ContentChunker::new(self.id, header, self.header.priority(), limits);

        for (session, log) in self.visible_sessions() {
            let from = known.map_or(0, |k| k.session_len(session));
            let Some(last_signature) = log.last_signature() else {
                continue;
            };
            let pieces = split_at_checkpoints(
                log.transactions(),
                from,
                log.signature_after(),
                last_signature,
            );
            chunker.push_session(session, pieces);
        }
        chunker.finish()
    }

    /// Drop every non-deletion session of a deleted CoValue.
    ///
    /// Returns `false` (and does nothing) if the CoValue is not deleted.
    pub fn erase_non_delete_sessions(&mut self) -> bool {
        if !self.deleted {
            return false;
        }

        self.sessions.retain(|session, _| session.is_delete());
        self.valid.retain(|key| key.id.session.is_delete());
        self.fww_losers.retain(|key| key.id.session.is_delete());
        self.invalid.retain(|id, _| id.session.is_delete());
        self.epoch += 1;
        debug!(co = %self.id, "erased non-deletion sessions");
        true
    }
}
